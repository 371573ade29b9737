//! Gateway service tying the worker supervisor, extraction client, and index store together.

use crate::{
    config::Config,
    extraction::{BoxError, ExtractionClient, ExtractionError, Metadata},
    index::{IndexError, IndexStore, SearchResults},
    metrics::{GatewayMetrics, MetricsSnapshot},
    supervisor::{SupervisorSettings, WorkerCommand, WorkerError, WorkerStatus, WorkerSupervisor},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Document bytes as they arrive from a client.
pub type DocumentStream<'a> = BoxStream<'a, Result<Bytes, BoxError>>;

/// Failures surfaced by gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The extraction worker could not be started.
    #[error(transparent)]
    Worker(#[from] WorkerError),
    /// The worker rejected or failed the document.
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    /// Reading or writing the search index failed.
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Metadata stored for an ingested document, echoed back to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestedDocument {
    /// Key the document was stored under.
    pub id: String,
    /// Extracted metadata.
    #[serde(flatten)]
    pub metadata: Metadata,
}

/// Operations exposed to the HTTP surface.
#[async_trait]
pub trait GatewayApi: Send + Sync {
    /// Extract `document` and index it under `id`, replacing any earlier version.
    async fn ingest(
        &self,
        id: String,
        document: DocumentStream<'_>,
    ) -> Result<IngestedDocument, GatewayError>;

    /// Run a free-text query against the index.
    async fn search(&self, query: &str) -> Result<SearchResults, GatewayError>;

    /// Current counters.
    fn metrics_snapshot(&self) -> MetricsSnapshot;

    /// Lifecycle state of the extraction worker.
    fn worker_status(&self) -> WorkerStatus;
}

/// Production implementation of [`GatewayApi`].
///
/// Built once at startup and shared behind an `Arc`.
pub struct GatewayService {
    supervisor: Arc<WorkerSupervisor>,
    extractor: ExtractionClient,
    index: IndexStore,
    metrics: Arc<GatewayMetrics>,
    search_limit: usize,
}

impl GatewayService {
    /// Assemble a service from already-constructed parts.
    pub fn new(
        supervisor: Arc<WorkerSupervisor>,
        extractor: ExtractionClient,
        index: IndexStore,
        metrics: Arc<GatewayMetrics>,
        search_limit: usize,
    ) -> Self {
        Self {
            supervisor,
            extractor,
            index,
            metrics,
            search_limit,
        }
    }

    /// Build every component described by `config`. The worker is not launched here.
    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        let metrics = Arc::new(GatewayMetrics::new());
        let command = WorkerCommand::tika(&config.java_bin, &config.tika_jar, config.tika_port);
        let settings = SupervisorSettings {
            startup_grace: config.startup_grace,
            shutdown_timeout: config.shutdown_timeout,
        };
        let supervisor = Arc::new(WorkerSupervisor::new(command, settings, metrics.clone()));
        let extractor = ExtractionClient::new(config.tika_base_url())?;
        let index = IndexStore::open_or_create(&config.index_path)?;
        Ok(Self::new(
            supervisor,
            extractor,
            index,
            metrics,
            config.search_limit,
        ))
    }

    /// Supervisor owning the extraction worker.
    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        &self.supervisor
    }

    async fn run_ingest(
        &self,
        id: String,
        document: DocumentStream<'_>,
    ) -> Result<IngestedDocument, GatewayError> {
        self.supervisor.ensure_running().await?;
        let extraction = self.extractor.analyze(document).await?;
        self.supervisor.record_activity();
        tracing::debug!(
            id = %id,
            bytes = extraction.document_bytes,
            warnings = extraction.warnings.len(),
            "Document extracted"
        );
        self.index
            .store(&id, &extraction.metadata, &extraction.text)
            .await?;
        Ok(IngestedDocument {
            id,
            metadata: extraction.metadata,
        })
    }
}

#[async_trait]
impl GatewayApi for GatewayService {
    async fn ingest(
        &self,
        id: String,
        document: DocumentStream<'_>,
    ) -> Result<IngestedDocument, GatewayError> {
        tracing::info!(id = %id, "Ingesting document");
        match self.run_ingest(id, document).await {
            Ok(stored) => {
                self.metrics.record_document();
                tracing::info!(id = %stored.id, "Document indexed");
                Ok(stored)
            }
            Err(err) => {
                self.metrics.record_failure();
                Err(err)
            }
        }
    }

    async fn search(&self, query: &str) -> Result<SearchResults, GatewayError> {
        let results = self.index.search(query, self.search_limit).await?;
        self.metrics.record_search();
        tracing::debug!(query, total = results.total, "Search served");
        Ok(results)
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn worker_status(&self) -> WorkerStatus {
        self.supervisor.status()
    }
}
