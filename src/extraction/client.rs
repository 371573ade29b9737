//! HTTP client for the extraction worker.
//!
//! A document is sent to the worker twice: once to `/meta` and once to `/tika`. The caller's
//! stream is read a single time; every chunk forwarded to the metadata request is copied into
//! an in-memory buffer, and that buffer becomes the body of the text request.

use crate::extraction::metadata::{Metadata, ParseWarning, read_metadata};
use crate::extraction::BoxError;
use bytes::{Bytes, BytesMut};
use futures_util::{FutureExt, Stream, StreamExt};
use reqwest::{Body, Client, StatusCode};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Number of chunks allowed in flight between the document stream and the metadata request.
const PUMP_DEPTH: usize = 8;

/// Which worker round trip an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// `PUT /meta`.
    Metadata,
    /// `PUT /tika`.
    Text,
}

impl Phase {
    fn path(self) -> &'static str {
        match self {
            Self::Metadata => "meta",
            Self::Text => "tika",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Metadata => "metadata",
            Self::Text => "text",
        })
    }
}

/// Errors returned while talking to the extraction worker.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// The HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    /// Transport failure before or while receiving a response.
    #[error("{phase} request failed: {source}")]
    Http {
        /// Round trip that failed.
        phase: Phase,
        /// Underlying transport error.
        #[source]
        source: reqwest::Error,
    },
    /// The worker answered with a non-success status.
    #[error("Unexpected worker response during {phase} extraction ({status}): {body}")]
    UnexpectedStatus {
        /// Round trip that failed.
        phase: Phase,
        /// HTTP status returned by the worker.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
    /// Reading the caller's document stream failed.
    #[error("Failed to read document: {0}")]
    Source(#[source] BoxError),
    /// Scanning the metadata response failed.
    #[error("Failed to scan metadata response: {0}")]
    MetadataScan(#[from] std::io::Error),
}

/// Output of a complete two-pass extraction.
#[derive(Debug, Clone)]
pub struct Extraction {
    /// Structured metadata from the first pass.
    pub metadata: Metadata,
    /// Plain text from the second pass.
    pub text: String,
    /// Tolerated problems in the metadata response.
    pub warnings: Vec<ParseWarning>,
    /// Size of the document as read from the caller.
    pub document_bytes: usize,
}

/// Lightweight HTTP client for the extraction worker.
#[derive(Clone)]
pub struct ExtractionClient {
    client: Client,
    base_url: String,
}

impl ExtractionClient {
    /// Build a client targeting `base_url` (for example `http://localhost:9998`).
    pub fn new(base_url: impl Into<String>) -> Result<Self, ExtractionError> {
        let client = Client::builder()
            .user_agent("tikagate/0.1")
            .build()
            .map_err(ExtractionError::Client)?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        tracing::debug!(url = %base_url, "Initialized extraction client");
        Ok(Self { client, base_url })
    }

    /// Build a client for a worker listening on `localhost:<port>`.
    pub fn for_port(port: u16) -> Result<Self, ExtractionError> {
        Self::new(format!("http://localhost:{port}"))
    }

    /// Base URL the client talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Extract metadata and text from `document`.
    ///
    /// The stream is consumed exactly once. The metadata request receives the live chunks;
    /// after its response arrives the rest of the stream is drained into the buffer, which is
    /// then sent to the text endpoint. Any failure aborts the extraction without retrying.
    pub async fn analyze<S, E>(&self, document: S) -> Result<Extraction, ExtractionError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Into<BoxError> + Send,
    {
        let (tx, mut rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(PUMP_DEPTH);
        let body = Body::wrap_stream(futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx)));

        let pump = pump_document(document, tx);
        let meta_request = async {
            let response = self
                .client
                .put(self.endpoint(Phase::Metadata))
                .body(body)
                .send()
                .await
                .map_err(|source| ExtractionError::Http {
                    phase: Phase::Metadata,
                    source,
                })?;
            let response = ensure_success(Phase::Metadata, response).await?;
            response
                .bytes()
                .await
                .map_err(|source| ExtractionError::Http {
                    phase: Phase::Metadata,
                    source,
                })
        };

        let mut pump = std::pin::pin!(pump);
        let mut meta_request = std::pin::pin!(meta_request);
        let mut drained = None;
        let meta_result = loop {
            tokio::select! {
                result = &mut meta_request => break result,
                outcome = &mut pump, if drained.is_none() => drained = Some(outcome),
            }
        };

        let payload = match meta_result {
            Ok(payload) => payload,
            Err(err) => {
                // a broken source is the root cause of whatever the request saw
                let drained = drained.or_else(|| pump.as_mut().now_or_never());
                if let Some(Err(source)) = drained {
                    return Err(source);
                }
                return Err(err);
            }
        };

        let buffered = match drained {
            Some(outcome) => outcome?,
            None => pump.await?,
        };

        let parsed = read_metadata(payload.as_ref())?;
        let document_bytes = buffered.len();
        tracing::debug!(
            document_bytes,
            warnings = parsed.warnings.len(),
            content_type = %parsed.metadata.content_type,
            "Metadata extracted"
        );

        let response = self
            .client
            .put(self.endpoint(Phase::Text))
            .body(buffered)
            .send()
            .await
            .map_err(|source| ExtractionError::Http {
                phase: Phase::Text,
                source,
            })?;
        let response = ensure_success(Phase::Text, response).await?;
        let text = response
            .text()
            .await
            .map_err(|source| ExtractionError::Http {
                phase: Phase::Text,
                source,
            })?;
        tracing::debug!(document_bytes, text_bytes = text.len(), "Text extracted");

        Ok(Extraction {
            metadata: parsed.metadata,
            text,
            warnings: parsed.warnings,
            document_bytes,
        })
    }

    fn endpoint(&self, phase: Phase) -> String {
        format!("{}/{}", self.base_url, phase.path())
    }
}

/// Copy every chunk of `document` into a buffer while forwarding it to `tx`.
///
/// Once the receiving request is gone the remaining chunks are only buffered.
async fn pump_document<S, E>(
    document: S,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
) -> Result<Bytes, ExtractionError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<BoxError> + Send,
{
    let mut document = std::pin::pin!(document);
    let mut buffer = BytesMut::new();
    let mut forward = Some(tx);

    while let Some(chunk) = document.next().await {
        match chunk {
            Ok(chunk) => {
                buffer.extend_from_slice(&chunk);
                if let Some(sender) = &forward
                    && sender.send(Ok(chunk)).await.is_err()
                {
                    tracing::trace!(buffered = buffer.len(), "Metadata request done; draining");
                    forward = None;
                }
            }
            Err(err) => {
                let err = err.into();
                if let Some(sender) = forward.take() {
                    let _ = sender
                        .send(Err(std::io::Error::other(err.to_string())))
                        .await;
                }
                return Err(ExtractionError::Source(err));
            }
        }
    }

    Ok(buffer.freeze())
}

async fn ensure_success(
    phase: Phase,
    response: reqwest::Response,
) -> Result<reqwest::Response, ExtractionError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let error = ExtractionError::UnexpectedStatus { phase, status, body };
    tracing::error!(error = %error, "Worker request failed");
    Err(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, routing::put};
    use httpmock::{Method::PUT, MockServer};
    use std::io;
    use tokio::net::TcpListener;

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, io::Error>> + Send {
        futures_util::stream::iter(
            parts
                .iter()
                .map(|part| Ok(Bytes::from_static(part.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn parses_metadata_and_returns_text() {
        let server = MockServer::start_async().await;
        let meta = server
            .mock_async(|when, then| {
                when.method(PUT).path("/meta").body("hello world");
                then.status(200).body(
                    "\"Content-Type\",\"text/plain; charset=ISO-8859-1\"\n\"X-Parsed-By\",\"org.apache.tika.parser.txt.TXTParser\"\n",
                );
            })
            .await;
        let tika = server
            .mock_async(|when, then| {
                when.method(PUT).path("/tika").body("hello world");
                then.status(200).body("hello world\n");
            })
            .await;

        let client = ExtractionClient::new(server.base_url()).expect("client");
        let extraction = client
            .analyze(chunks(&["hello ", "world"]))
            .await
            .expect("analyze succeeds");

        meta.assert_async().await;
        tika.assert_async().await;
        assert_eq!(
            extraction.metadata.content_type,
            "text/plain; charset=ISO-8859-1"
        );
        assert_eq!(
            extraction.metadata.data.get("X-Parsed-By").map(String::as_str),
            Some("org.apache.tika.parser.txt.TXTParser")
        );
        assert_eq!(extraction.text, "hello world\n");
        assert_eq!(extraction.document_bytes, 11);
    }

    #[tokio::test]
    async fn metadata_failure_names_the_phase() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path("/meta");
                then.status(500).body("boom");
            })
            .await;
        let tika = server
            .mock_async(|when, then| {
                when.method(PUT).path("/tika");
                then.status(200).body("unused");
            })
            .await;

        let client = ExtractionClient::new(server.base_url()).expect("client");
        let err = client
            .analyze(chunks(&["payload"]))
            .await
            .expect_err("metadata phase fails");

        assert!(matches!(
            err,
            ExtractionError::UnexpectedStatus { phase: Phase::Metadata, status, ref body }
                if status == StatusCode::INTERNAL_SERVER_ERROR && body == "boom"
        ));
        assert!(err.to_string().contains("metadata"));
        assert_eq!(tika.hits_async().await, 0);
    }

    #[tokio::test]
    async fn text_failure_names_the_phase() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path("/meta");
                then.status(200).body("\"title\",\"x\"\n");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path("/tika");
                then.status(422).body("unprocessable");
            })
            .await;

        let client = ExtractionClient::new(server.base_url()).expect("client");
        let err = client
            .analyze(chunks(&["payload"]))
            .await
            .expect_err("text phase fails");

        assert!(matches!(
            err,
            ExtractionError::UnexpectedStatus {
                phase: Phase::Text,
                ..
            }
        ));
        assert!(err.to_string().contains("text extraction"));
    }

    #[tokio::test]
    async fn unreachable_worker_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let client = ExtractionClient::new(format!("http://{addr}")).expect("client");
        let err = client
            .analyze(chunks(&["payload"]))
            .await
            .expect_err("nothing listens");
        assert!(matches!(
            err,
            ExtractionError::Http {
                phase: Phase::Metadata,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn broken_source_is_reported_as_such() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path("/meta");
                then.status(200).body("");
            })
            .await;

        let client = ExtractionClient::new(server.base_url()).expect("client");
        let document = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::other("client went away")),
        ]);
        let err = client
            .analyze(document)
            .await
            .expect_err("source error aborts");
        assert!(matches!(err, ExtractionError::Source(_)));
        assert!(err.to_string().contains("client went away"));
    }

    async fn spawn_length_echo_worker() -> String {
        async fn meta(body: Bytes) -> String {
            format!(
                "\"Content-Type\",\"application/octet-stream\"\n\"Received-Bytes\",\"{}\"\n",
                body.len()
            )
        }
        async fn tika(body: Bytes) -> String {
            body.len().to_string()
        }

        let app = Router::new()
            .route("/meta", put(meta))
            .route("/tika", put(tika));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn both_phases_see_every_byte() {
        let base_url = spawn_length_echo_worker().await;
        let client = ExtractionClient::new(base_url).expect("client");

        // more chunks than the pump channel holds
        let parts: Vec<Result<Bytes, io::Error>> = (0..32u8)
            .map(|n| Ok(Bytes::from(vec![n; 8 * 1024 + usize::from(n)])))
            .collect();
        let expected: usize = parts
            .iter()
            .map(|part| part.as_ref().map(Bytes::len).unwrap_or(0))
            .sum();

        let extraction = client
            .analyze(futures_util::stream::iter(parts))
            .await
            .expect("analyze succeeds");

        assert_eq!(extraction.document_bytes, expected);
        assert_eq!(
            extraction.metadata.data.get("Received-Bytes"),
            Some(&expected.to_string())
        );
        assert_eq!(extraction.text, expected.to_string());
    }

    #[tokio::test]
    async fn empty_document_is_still_sent_twice() {
        let base_url = spawn_length_echo_worker().await;
        let client = ExtractionClient::new(base_url).expect("client");

        let extraction = client
            .analyze(futures_util::stream::empty::<Result<Bytes, io::Error>>())
            .await
            .expect("analyze succeeds");

        assert_eq!(extraction.document_bytes, 0);
        assert_eq!(extraction.text, "0");
        assert_eq!(
            extraction.metadata.data.get("Received-Bytes").map(String::as_str),
            Some("0")
        );
    }

    #[test]
    fn endpoints_follow_the_worker_protocol() {
        let client = ExtractionClient::for_port(9998).expect("client");
        assert_eq!(client.base_url(), "http://localhost:9998");
        assert_eq!(client.endpoint(Phase::Metadata), "http://localhost:9998/meta");
        assert_eq!(client.endpoint(Phase::Text), "http://localhost:9998/tika");
    }
}
