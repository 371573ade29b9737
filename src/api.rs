//! HTTP surface for the extraction gateway.
//!
//! - `PUT|POST /add` – Extract and index a document. The id comes from `?id=` with the raw
//!   document as the body, or from a multipart form carrying an `id` field and one file.
//!   Returns `201` with the stored metadata.
//! - `GET /search?q=` – Free-text query over the index; returns ranked hits.
//! - `GET /metrics` – Ingestion counters and the worker's lifecycle state.

use crate::extraction::BoxError;
use crate::gateway::{GatewayApi, GatewayError, IngestedDocument};
use crate::index::SearchResults;
use crate::metrics::MetricsSnapshot;
use crate::supervisor::WorkerStatus;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, FromRequest, Multipart, Query, Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, put},
};
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Build the HTTP router exposing the gateway API.
pub fn create_router<S>(service: Arc<S>) -> Router
where
    S: GatewayApi + 'static,
{
    Router::new()
        .route("/add", put(add_document::<S>).post(add_document::<S>))
        .route("/search", get(search::<S>))
        .route("/metrics", get(get_metrics::<S>))
        .layer(DefaultBodyLimit::disable())
        .with_state(service)
}

#[derive(Deserialize)]
struct AddParams {
    #[serde(default)]
    id: Option<String>,
}

/// Ingest a document, either raw (`?id=`) or as a multipart upload.
///
/// The ingest runs on its own task: a client that hangs up does not cancel the worker round
/// trip or the index commit.
async fn add_document<S>(
    State(service): State<Arc<S>>,
    Query(params): Query<AddParams>,
    request: Request,
) -> Result<(StatusCode, Json<IngestedDocument>), AppError>
where
    S: GatewayApi + 'static,
{
    let id = params.id.filter(|id| !id.trim().is_empty());
    let stored = tokio::spawn(ingest_request(service, id, request))
        .await
        .map_err(AppError::Interrupted)??;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn ingest_request<S>(
    service: Arc<S>,
    id: Option<String>,
    request: Request,
) -> Result<IngestedDocument, AppError>
where
    S: GatewayApi,
{
    let stored = if is_multipart(&request) {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
        ingest_multipart(service.as_ref(), id, multipart).await?
    } else {
        let id = id.ok_or_else(|| AppError::BadRequest("missing document id".into()))?;
        let document = request
            .into_body()
            .into_data_stream()
            .map_err(BoxError::from)
            .boxed();
        service.ingest(id, document).await?
    };
    Ok(stored)
}

fn is_multipart(request: &Request) -> bool {
    request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("multipart/form-data"))
}

/// Pull the id and the first file out of a multipart form.
///
/// The file streams straight to the worker when the id is already known; a file that arrives
/// first is buffered until the id field shows up.
async fn ingest_multipart<S>(
    service: &S,
    mut id: Option<String>,
    mut multipart: Multipart,
) -> Result<IngestedDocument, AppError>
where
    S: GatewayApi,
{
    let mut buffered: Option<Bytes> = None;
    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        if field.file_name().is_some() {
            if buffered.is_some() {
                continue;
            }
            if let Some(id) = id.take() {
                let document = field.map_err(BoxError::from).boxed();
                return Ok(service.ingest(id, document).await?);
            }
            buffered = Some(field.bytes().await.map_err(malformed)?);
        } else if field.name() == Some("id") {
            let value = field.text().await.map_err(malformed)?;
            if !value.trim().is_empty() {
                id = Some(value);
            }
        }
    }

    let id = id.ok_or_else(|| AppError::BadRequest("missing document id".into()))?;
    let contents =
        buffered.ok_or_else(|| AppError::BadRequest("missing document file".into()))?;
    let document = futures_util::stream::once(async move { Ok::<_, BoxError>(contents) }).boxed();
    Ok(service.ingest(id, document).await?)
}

fn malformed(err: axum::extract::multipart::MultipartError) -> AppError {
    AppError::BadRequest(err.body_text())
}

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: Option<String>,
}

/// Response body for `GET /search`.
#[derive(Serialize)]
struct SearchResponse {
    query: String,
    #[serde(flatten)]
    results: SearchResults,
}

/// Run a free-text query.
async fn search<S>(
    State(service): State<Arc<S>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, AppError>
where
    S: GatewayApi,
{
    let query = params
        .q
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("missing query parameter `q`".into()))?;
    let results = service.search(&query).await?;
    Ok(Json(SearchResponse { query, results }))
}

/// Response body for `GET /metrics`.
#[derive(Serialize)]
struct MetricsResponse {
    #[serde(flatten)]
    counters: MetricsSnapshot,
    worker: WorkerStatus,
}

/// Return the counters and current worker state.
async fn get_metrics<S>(State(service): State<Arc<S>>) -> Json<MetricsResponse>
where
    S: GatewayApi,
{
    Json(MetricsResponse {
        counters: service.metrics_snapshot(),
        worker: service.worker_status(),
    })
}

enum AppError {
    BadRequest(String),
    Gateway(GatewayError),
    Interrupted(tokio::task::JoinError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            AppError::Gateway(err) => {
                tracing::error!(error = %err, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
            }
            AppError::Interrupted(err) => {
                tracing::error!(error = %err, "Ingest task aborted");
                (StatusCode::INTERNAL_SERVER_ERROR, "ingest task aborted").into_response()
            }
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(inner: GatewayError) -> Self {
        Self::Gateway(inner)
    }
}
