//! HTTP transport client and the closed upload error taxonomy.
//!
//! One [`Transport::upload`] call performs a single POST to the
//! ingestion endpoint and classifies every outcome into
//! [`TransportError`]. Each variant answers two independent questions
//! the coordinator routes on: is the failure retryable, and does it
//! count toward the circuit breaker.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Applied when a 429 response carries no `Retry-After` header.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;
/// Per-request timeout for the default HTTP client.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Acknowledgement body returned by the ingestion endpoint on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub pipeline_activity_id: String,
    pub data_size_bytes: u64,
    pub data_size: String,
    pub source: String,
    pub message: String,
    pub stream_key: String,
}

/// Error body the endpoint returns for 400-class responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Closed classification of upload outcomes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// 401. Retryable once credentials are fixed; the coordinator
    /// additionally halts its periodic timer.
    #[error("authentication rejected by ingestion endpoint")]
    AuthInvalid,

    /// 400. The payload itself is unacceptable; never retried.
    #[error("bad request: {message}")]
    BadRequest { message: String },

    /// 403. Never retried.
    #[error("forbidden by ingestion endpoint")]
    Forbidden,

    /// 429, with the server's requested delay (default 60s).
    #[error("rate limited; retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Any 5xx response.
    #[error("server error (HTTP {code})")]
    ServerError { code: u16 },

    /// The request exceeded its deadline.
    #[error("upload request timed out")]
    Timeout,

    /// Could not reach the endpoint at all.
    #[error("no connection to ingestion endpoint")]
    NoConnection,

    /// The response body did not parse as an acknowledgement.
    #[error("failed to decode upload response: {0}")]
    DecodingError(String),

    /// Anything the taxonomy does not recognize.
    #[error("unclassified transport failure: {0}")]
    Unknown(String),
}

impl TransportError {
    /// Whether the coordinator should leave the records retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::BadRequest { .. } | Self::Forbidden)
    }

    /// Whether the failure bumps the consecutive-failure counter.
    /// Only infrastructure-level outcomes (5xx, timeout) do; client
    /// errors and missing connectivity are not the server's fault.
    #[must_use]
    pub fn counts_toward_circuit_breaker(&self) -> bool {
        matches!(self, Self::ServerError { .. } | Self::Timeout)
    }

    /// The server-requested soft delay, if the failure carries one.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_secs } => {
                Some(Duration::from_secs(*retry_after_secs))
            }
            _ => None,
        }
    }
}

/// Classify a non-success HTTP status into the taxonomy.
fn classify_status(
    status: StatusCode,
    retry_after_secs: Option<u64>,
    body: Option<&ErrorBody>,
) -> TransportError {
    match status {
        StatusCode::UNAUTHORIZED => TransportError::AuthInvalid,
        StatusCode::BAD_REQUEST => TransportError::BadRequest {
            message: body.map_or_else(
                || "unspecified".to_string(),
                |b| {
                    b.details
                        .as_ref()
                        .map_or_else(|| b.error.clone(), |d| format!("{}: {d}", b.error))
                },
            ),
        },
        StatusCode::FORBIDDEN => TransportError::Forbidden,
        StatusCode::TOO_MANY_REQUESTS => TransportError::RateLimited {
            retry_after_secs: retry_after_secs.unwrap_or(DEFAULT_RETRY_AFTER_SECS),
        },
        s if s.is_server_error() => TransportError::ServerError { code: s.as_u16() },
        s => TransportError::Unknown(format!("unexpected HTTP status {s}")),
    }
}

/// Classify a reqwest-level failure (no HTTP status available).
fn classify_request_error(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::NoConnection
    } else if err.is_decode() {
        TransportError::DecodingError(err.to_string())
    } else {
        TransportError::Unknown(err.to_string())
    }
}

fn parse_retry_after(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.trim().parse::<u64>().ok())
}

/// Future returned by [`Transport::upload`].
pub type UploadFuture<'a> =
    Pin<Box<dyn Future<Output = Result<UploadAck, TransportError>> + Send + 'a>>;

/// One upload call against the ingestion endpoint. Object-safe so the
/// coordinator can take any transport (production HTTP, a test fake)
/// through the same injection seam.
pub trait Transport: Send + Sync {
    /// POST `body` to `endpoint` with a bearer `token`, returning the
    /// parsed acknowledgement or a classified failure.
    fn upload<'a>(
        &'a self,
        endpoint: &'a str,
        token: &'a str,
        body: &'a serde_json::Value,
    ) -> UploadFuture<'a>;
}

/// Production transport over reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport with the given per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Unknown(e.to_string()))?;
        Ok(Self { client })
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Transport for HttpTransport {
    fn upload<'a>(
        &'a self,
        endpoint: &'a str,
        token: &'a str,
        body: &'a serde_json::Value,
    ) -> UploadFuture<'a> {
        Box::pin(async move {
            let response = self
                .client
                .post(endpoint)
                .bearer_auth(token)
                .json(body)
                .send()
                .await
                .map_err(|e| classify_request_error(&e))?;

            let status = response.status();
            if status.is_success() {
                let ack = response
                    .json::<UploadAck>()
                    .await
                    .map_err(|e| TransportError::DecodingError(e.to_string()))?;
                debug!(
                    stream_key = %ack.stream_key,
                    bytes = ack.data_size_bytes,
                    "upload acknowledged"
                );
                return Ok(ack);
            }

            let retry_after = parse_retry_after(
                response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok()),
            );
            let error_body = response.json::<ErrorBody>().await.ok();
            let err = classify_status(status, retry_after, error_body.as_ref());
            warn!(status = status.as_u16(), error = %err, "upload rejected");
            Err(err)
        })
    }
}
