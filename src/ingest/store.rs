//! Bulk-write contract of the search store.
//!
//! The ingest engine needs exactly one call: index a list of documents by
//! id into one index, and learn which positions failed. [`ElasticStore`]
//! speaks the Elasticsearch `_bulk` API; [`MemoryStore`] keeps everything
//! in process and injects failures for tests.
//!
//! [`ElasticStore`]: super::elastic::ElasticStore

use crate::broker::BoxFuture;
use crate::document::LogDocument;
use crate::error::{PipelineError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One document to index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkOperation {
    pub id: String,
    pub document: serde_json::Value,
}

impl BulkOperation {
    pub fn from_document(document: &LogDocument) -> Result<Self> {
        Ok(Self {
            id: document.id.clone(),
            document: serde_json::to_value(document)?,
        })
    }

    /// Serialized size of the document body.
    pub fn body_len(&self) -> usize {
        serde_json::to_vec(&self.document).map(|b| b.len()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BulkRequest {
    pub index: String,
    pub operations: Vec<BulkOperation>,
}

impl BulkRequest {
    pub fn new(index: impl Into<String>, operations: Vec<BulkOperation>) -> Self {
        Self {
            index: index.into(),
            operations,
        }
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Per-operation result, pointing back at the submitted position.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemResult {
    pub position: usize,
    pub id: String,
    pub status: u16,
    pub error: Option<String>,
}

impl BulkItemResult {
    pub fn ok(position: usize, id: impl Into<String>) -> Self {
        Self {
            position,
            id: id.into(),
            status: 201,
            error: None,
        }
    }

    pub fn failed(position: usize, id: impl Into<String>, status: u16, error: impl Into<String>) -> Self {
        Self {
            position,
            id: id.into(),
            status,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkResponse {
    pub items: Vec<BulkItemResult>,
}

impl BulkResponse {
    /// Positions of failed operations that fall inside a request of `len`
    /// operations. Out-of-range back-references are ignored.
    pub fn failed_positions(&self, len: usize) -> Vec<usize> {
        let mut positions: Vec<usize> = self
            .items
            .iter()
            .filter(|item| !item.is_success() && item.position < len)
            .map(|item| item.position)
            .collect();
        positions.sort_unstable();
        positions.dedup();
        positions
    }

    pub fn has_failures(&self) -> bool {
        self.items.iter().any(|item| !item.is_success())
    }

    /// First error message, for logs.
    pub fn first_error(&self) -> Option<&str> {
        self.items.iter().find_map(|item| item.error.as_deref())
    }
}

/// A store that accepts bulk index requests.
pub trait BulkStore: Send + Sync + 'static {
    /// Store address for logs.
    fn endpoint(&self) -> String;

    /// Index every operation. `Err` means the request as a whole failed;
    /// per-item failures come back in the response.
    fn bulk<'a>(&'a self, request: &'a BulkRequest) -> BoxFuture<'a, BulkResponse>;
}

#[derive(Default)]
struct MemoryState {
    requests: Vec<BulkRequest>,
    indices: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
    rejected_ids: HashSet<String>,
}

/// In-process store with failure injection.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    fail_next: Arc<AtomicUsize>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next `n` requests as a whole.
    pub fn fail_next_requests(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Report these document ids as failed items.
    pub fn reject_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().rejected_ids.extend(ids.into_iter().map(Into::into));
    }

    pub fn clear_rejections(&self) {
        self.state().rejected_ids.clear();
    }

    /// While unavailable every request fails.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Every request received, including failed ones.
    pub fn requests(&self) -> Vec<BulkRequest> {
        self.state().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state().requests.len()
    }

    pub fn document_count(&self, index: &str) -> usize {
        self.state().indices.get(index).map_or(0, |docs| docs.len())
    }

    pub fn indices(&self) -> Vec<String> {
        self.state().indices.keys().cloned().collect()
    }

    pub fn contains(&self, index: &str, id: &str) -> bool {
        self.state().indices.get(index).is_some_and(|docs| docs.contains_key(id))
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl BulkStore for MemoryStore {
    fn endpoint(&self) -> String {
        "memory://store".to_string()
    }

    fn bulk<'a>(&'a self, request: &'a BulkRequest) -> BoxFuture<'a, BulkResponse> {
        Box::pin(async move {
            self.state().requests.push(request.clone());

            if self.unavailable.load(Ordering::SeqCst) {
                return Err(PipelineError::store("store unavailable", None));
            }
            if self.take_injected_failure() {
                return Err(PipelineError::store("injected bulk failure", Some(503)));
            }

            let mut state = self.state();
            let mut items = Vec::with_capacity(request.operations.len());
            for (position, op) in request.operations.iter().enumerate() {
                if state.rejected_ids.contains(&op.id) {
                    items.push(BulkItemResult::failed(position, &op.id, 400, "mapper_parsing_exception"));
                    continue;
                }
                state
                    .indices
                    .entry(request.index.clone())
                    .or_default()
                    .insert(op.id.clone(), op.document.clone());
                items.push(BulkItemResult::ok(position, &op.id));
            }
            Ok(BulkResponse { items })
        })
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("requests", &self.request_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(id: &str) -> BulkOperation {
        BulkOperation {
            id: id.to_string(),
            document: serde_json::json!({"message": id}),
        }
    }

    #[test]
    fn test_failed_positions_ignore_out_of_range() {
        let response = BulkResponse {
            items: vec![
                BulkItemResult::ok(0, "a"),
                BulkItemResult::failed(1, "b", 400, "bad"),
                BulkItemResult::failed(7, "?", 400, "bad"),
                BulkItemResult::failed(1, "b", 400, "dup"),
            ],
        };
        assert_eq!(response.failed_positions(3), vec![1]);
        assert!(response.has_failures());
        assert_eq!(response.first_error(), Some("bad"));
    }

    #[tokio::test]
    async fn test_memory_store_indexes_by_id() {
        let store = MemoryStore::new();
        let request = BulkRequest::new("a-logs-2026-03-01", vec![op("1"), op("2"), op("1")]);

        let response = store.bulk(&request).await.unwrap();
        assert!(!response.has_failures());
        assert_eq!(store.document_count("a-logs-2026-03-01"), 2);
        assert!(store.contains("a-logs-2026-03-01", "2"));
    }

    #[tokio::test]
    async fn test_memory_store_rejects_items() {
        let store = MemoryStore::new();
        store.reject_ids(["2"]);
        let request = BulkRequest::new("i", vec![op("1"), op("2"), op("3")]);

        let response = store.bulk(&request).await.unwrap();
        assert_eq!(response.failed_positions(3), vec![1]);
        assert_eq!(store.document_count("i"), 2);
    }

    #[tokio::test]
    async fn test_memory_store_injected_failures() {
        let store = MemoryStore::new();
        store.fail_next_requests(1);
        let request = BulkRequest::new("i", vec![op("1")]);

        assert!(store.bulk(&request).await.is_err());
        assert!(store.bulk(&request).await.is_ok());

        store.set_available(false);
        assert!(matches!(
            store.bulk(&request).await,
            Err(PipelineError::Store { status: None, .. })
        ));
        assert_eq!(store.request_count(), 3);
    }
}
