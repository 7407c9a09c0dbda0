//! Running document-size statistics per stream, and the chunk size they imply.

use dashmap::DashMap;

/// Size observations for one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamSizeStats {
    pub count: u64,
    /// Mean serialized document size in bytes.
    pub average: f64,
    pub max: usize,
    pub min: usize,
}

impl StreamSizeStats {
    /// Fold one observed size into the running figures.
    pub fn record(&mut self, size: usize) {
        let count = self.count as f64;
        self.average = (self.average * count + size as f64) / (count + 1.0);
        self.max = self.max.max(size);
        self.min = if self.count == 0 { size } else { self.min.min(size) };
        self.count += 1;
    }
}

/// Documents per bulk request so that a request stays near `budget_bytes`.
///
/// Never less than one.
pub fn chunk_size(budget_bytes: usize, average_bytes: f64) -> usize {
    if average_bytes.is_nan() || average_bytes <= 0.0 {
        return budget_bytes.max(1);
    }
    ((budget_bytes as f64 / average_bytes).floor() as usize).max(1)
}

/// Concurrent registry of [`StreamSizeStats`] keyed by stream.
#[derive(Debug, Default)]
pub struct SizeRegistry {
    stats: DashMap<String, StreamSizeStats>,
}

impl SizeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample for `stream` and return the updated stats.
    pub fn record(&self, stream: &str, size: usize) -> StreamSizeStats {
        let mut entry = self.stats.entry(stream.to_string()).or_default();
        entry.record(size);
        *entry
    }

    pub fn get(&self, stream: &str) -> Option<StreamSizeStats> {
        self.stats.get(stream).map(|s| *s)
    }

    pub fn streams(&self) -> usize {
        self.stats.len()
    }
}
