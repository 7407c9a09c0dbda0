//! Store-side document shape (ECS field layout) and its deterministic id.
//!
//! The id is a SHA-256 over the fields that identify an occurrence, so a
//! document replayed from the journal overwrites its earlier copy instead of
//! duplicating it.

use crate::event::{ExceptionDetail, LogEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    pub level: String,
    pub logger: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Stream key the event was emitted under.
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSection {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

/// A log event in the store's document layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogDocument {
    /// Deterministic document id; sent as the bulk `_id`, not part of the body.
    #[serde(skip)]
    pub id: String,
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub log: LogSection,
    pub event: EventSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSection>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// Journal record for a document that failed to ingest.
///
/// The body alone does not carry the id, so the journal keeps both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedDocument {
    pub id: String,
    pub index: String,
    pub document: LogDocument,
}

impl FailedDocument {
    pub fn new(index: impl Into<String>, document: LogDocument) -> Self {
        Self {
            id: document.id.clone(),
            index: index.into(),
            document,
        }
    }

    /// Restore the id after deserializing from the journal.
    pub fn into_document(self) -> LogDocument {
        let mut document = self.document;
        document.id = self.id;
        document
    }
}

impl LogDocument {
    /// Convert an event into its store document.
    pub fn from_event(event: &LogEvent) -> Self {
        Self {
            id: document_id(event),
            timestamp: event.timestamp,
            message: event.message.clone(),
            log: LogSection {
                level: event.level.to_string(),
                logger: event.source.clone(),
            },
            event: EventSection {
                id: event.event_id.map(|id| id.to_string()),
                action: event.event_name.clone(),
                reference: event.log_key.clone(),
            },
            error: event.exception.as_ref().map(error_section),
            labels: event.enrichers.clone(),
            fields: event.properties.clone(),
        }
    }

    /// Stream key this document belongs to.
    pub fn stream_key(&self) -> &str {
        &self.event.reference
    }
}

/// Hex SHA-256 over stream key, timestamp, level, source, message and event id.
pub fn document_id(event: &LogEvent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.log_key.as_bytes());
    hasher.update([0u8]);
    hasher.update(event.timestamp.timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
    hasher.update([0u8]);
    hasher.update(event.level.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(event.source.as_bytes());
    hasher.update([0u8]);
    hasher.update(event.message.as_bytes());
    hasher.update([0u8]);
    if let Some(id) = event.event_id {
        hasher.update(id.to_be_bytes());
    }
    hex::encode(hasher.finalize())
}

fn error_section(exception: &ExceptionDetail) -> ErrorSection {
    let mut trace = exception.stack_trace.clone().unwrap_or_default();
    for inner in exception.inner_chain() {
        trace.push_str("\n--- Inner Exception ---\n");
        trace.push_str(&format!("Type: {}\n", inner.kind));
        trace.push_str(&format!("Message: {}\n", inner.message));
        trace.push_str(&format!("StackTrace: {}", inner.stack_trace.as_deref().unwrap_or_default()));
    }

    ErrorSection {
        kind: exception.kind.clone(),
        message: exception.message.clone(),
        stack_trace: if trace.is_empty() { None } else { Some(trace) },
    }
}
