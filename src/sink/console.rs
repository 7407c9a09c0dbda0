//! Console sink writer.

use super::SinkWriter;
use crate::broker::BoxFuture;
use crate::config::ConsoleFormat;
use crate::error::{PipelineError, Result};
use crate::event::LogEvent;
use std::io::Write;
use std::sync::Mutex;

/// Renders events to stdout (or any writer), one per line.
pub struct ConsoleWriter {
    format: ConsoleFormat,
    output: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleWriter {
    pub fn stdout(format: ConsoleFormat) -> Self {
        Self::with_output(format, Box::new(std::io::stdout()))
    }

    pub fn with_output(format: ConsoleFormat, output: Box<dyn Write + Send>) -> Self {
        Self {
            format,
            output: Mutex::new(output),
        }
    }

    pub fn render(&self, event: &LogEvent) -> Result<String> {
        match self.format {
            ConsoleFormat::Json => Ok(serde_json::to_string(event)?),
            ConsoleFormat::Plain => Ok(render_plain(event)),
        }
    }

    fn write_line(&self, line: &str) -> Result<()> {
        let mut output = self.output.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        writeln!(output, "{}", line).map_err(|e| PipelineError::io("<console>", e))?;
        output.flush().map_err(|e| PipelineError::io("<console>", e))
    }
}

fn render_plain(event: &LogEvent) -> String {
    let mut line = format!(
        "{} {:<11} [{}] {}",
        event.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        event.level.as_str(),
        event.source,
        event.message
    );
    if let Some(exception) = &event.exception {
        line.push_str(&format!("\n  {}: {}", exception.kind, exception.message));
        for inner in exception.inner_chain() {
            line.push_str(&format!("\n  caused by {}: {}", inner.kind, inner.message));
        }
    }
    line
}

impl SinkWriter<LogEvent> for ConsoleWriter {
    fn process<'a>(&'a self, item: &'a LogEvent) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let line = self.render(item)?;
            self.write_line(&line)
        })
    }
}
