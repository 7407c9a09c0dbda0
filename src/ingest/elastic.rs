//! Elasticsearch `_bulk` client.

use super::store::{BulkItemResult, BulkRequest, BulkResponse, BulkStore};
use crate::broker::BoxFuture;
use crate::config::StoreConfig;
use crate::error::{PipelineError, Result};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct RawBulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, RawBulkItem>>,
}

#[derive(Debug, Deserialize)]
struct RawBulkItem {
    #[serde(rename = "_id", default)]
    id: String,
    status: u16,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

pub struct ElasticStore {
    client: reqwest::Client,
    endpoint: String,
    username: Option<String>,
    password: Option<String>,
}

impl ElasticStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout_duration())
            .build()
            .map_err(|e| PipelineError::Config(format!("store client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    async fn send(&self, request: &BulkRequest) -> Result<BulkResponse> {
        let body = ndjson_body(request)?;
        let mut http = self
            .client
            .post(format!("{}/_bulk", self.endpoint))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body);
        if let Some(username) = &self.username {
            http = http.basic_auth(username, self.password.as_ref());
        }

        let response = http
            .send()
            .await
            .map_err(|e| PipelineError::store(format!("bulk request failed: {}", e), None))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::store(
                format!("bulk request rejected: {}", truncate(&text, 512)),
                Some(status.as_u16()),
            ));
        }

        let raw: RawBulkResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::store(format!("unreadable bulk response: {}", e), Some(status.as_u16())))?;
        debug!(index = %request.index, items = raw.items.len(), errors = raw.errors, "Bulk response");
        Ok(parse_items(raw))
    }
}

impl BulkStore for ElasticStore {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn bulk<'a>(&'a self, request: &'a BulkRequest) -> BoxFuture<'a, BulkResponse> {
        Box::pin(self.send(request))
    }
}

impl std::fmt::Debug for ElasticStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElasticStore")
            .field("endpoint", &self.endpoint)
            .field("authenticated", &self.username.is_some())
            .finish()
    }
}

/// Action line plus source line per operation.
fn ndjson_body(request: &BulkRequest) -> Result<String> {
    let mut body = String::new();
    for op in &request.operations {
        let action = json!({ "index": { "_index": request.index, "_id": op.id } });
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(&op.document)?);
        body.push('\n');
    }
    Ok(body)
}

/// Items come back in submission order, one single-key object each.
fn parse_items(raw: RawBulkResponse) -> BulkResponse {
    let items = raw
        .items
        .into_iter()
        .enumerate()
        .filter_map(|(position, mut entry)| {
            let item = entry.drain().next().map(|(_, item)| item)?;
            Some(BulkItemResult {
                position,
                id: item.id,
                status: item.status,
                error: item.error.map(|e| match e.get("reason").and_then(|r| r.as_str()) {
                    Some(reason) => reason.to_string(),
                    None => e.to_string(),
                }),
            })
        })
        .collect();
    BulkResponse { items }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
