// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for RabbitMQ.
//!
//! Provides helpers to spin up a broker for the `amqp` adapter tests.

use log_pipeline::config::BrokerConfig;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

const AMQP_PORT: u16 = 5672;

/// Create a RabbitMQ container.
///
/// Uses the official rabbitmq:3 alpine image. Waits for "Server startup complete".
pub fn rabbitmq_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("rabbitmq", "3-alpine")
        .with_exposed_port(AMQP_PORT)
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));
    docker.run(image)
}

/// Broker config pointing at a container, with short test timings.
pub fn rabbitmq_config(container: &Container<'_, GenericImage>) -> BrokerConfig {
    BrokerConfig {
        host: "127.0.0.1".to_string(),
        port: container.get_host_port_ipv4(AMQP_PORT),
        ..BrokerConfig::for_testing()
    }
}
