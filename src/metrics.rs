use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing gateway activity.
#[derive(Default)]
pub struct GatewayMetrics {
    documents_ingested: AtomicU64,
    ingest_failures: AtomicU64,
    searches_served: AtomicU64,
    worker_launches: AtomicU64,
}

impl GatewayMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a document that made it into the index.
    pub fn record_document(&self) {
        self.documents_ingested.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an ingest request that failed after validation.
    pub fn record_failure(&self) {
        self.ingest_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed search query.
    pub fn record_search(&self) {
        self.searches_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a worker process launch.
    pub fn record_launch(&self) {
        self.worker_launches.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_ingested: self.documents_ingested.load(Ordering::Relaxed),
            ingest_failures: self.ingest_failures.load(Ordering::Relaxed),
            searches_served: self.searches_served.load(Ordering::Relaxed),
            worker_launches: self.worker_launches.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of gateway counters used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Number of documents indexed since startup.
    pub documents_ingested: u64,
    /// Number of ingest requests that failed during extraction or indexing.
    pub ingest_failures: u64,
    /// Number of search queries answered.
    pub searches_served: u64,
    /// Number of worker processes launched.
    pub worker_launches: u64,
}
