use axum::http::StatusCode;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing_error::SpanTrace;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Failed to connect to analysis API at {url}. Please ensure the backend is running. Error: {message}")]
    UpstreamUnavailable { url: String, message: String },

    #[error("Upstream error (status {0}): {1}")]
    Upstream(StatusCode, String),

    #[error("Stream decode error: {0}")]
    StreamDecode(String),

    #[error("Stream processing failed: {0}")]
    MidStream(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("The analysis API returned an empty response. Please check that the backend is running and try again.")]
    EmptyResponse,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Errors raised before the outbound stream opens become a single JSON response;
    /// everything else can only be reported in-band.
    pub fn is_pre_stream(&self) -> bool {
        matches!(
            self,
            RelayError::Configuration(_)
                | RelayError::Validation(_)
                | RelayError::UpstreamUnavailable { .. }
                | RelayError::Upstream(_, _)
        )
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            RelayError::Configuration(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "CONFIGURATION_ERROR")
            }
            RelayError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            RelayError::UpstreamUnavailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "UPSTREAM_UNAVAILABLE")
            }
            RelayError::Upstream(s, _) => (*s, "UPSTREAM_ERROR"),
            RelayError::StreamDecode(_) => (StatusCode::BAD_GATEWAY, "STREAM_DECODE_ERROR"),
            RelayError::MidStream(_) => (StatusCode::BAD_GATEWAY, "STREAM_ERROR"),
            RelayError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            RelayError::EmptyResponse => (StatusCode::BAD_GATEWAY, "EMPTY_RESPONSE"),
            RelayError::Network(_) => (StatusCode::BAD_GATEWAY, "NETWORK_ERROR"),
            RelayError::Database(_) | RelayError::Migration(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR")
            }
            RelayError::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "SERIALIZATION_ERROR")
            }
            RelayError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            RelayError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let (status, code) = self.inner.status_and_code();
        // Upstream bodies are forwarded verbatim.
        let msg = match &self.inner {
            RelayError::Upstream(_, body) => body.clone(),
            other => other.to_string(),
        };
        (
            status,
            axum::Json(serde_json::json!({
                "error": msg,
                "code": code,
                "span_trace": self.span_trace.to_string(),
            })),
        )
            .into_response()
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: RelayError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<RelayError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// Counters for upstream connection attempts, surfaced by the readiness probe.
pub struct UpstreamHealth {
    pub consecutive_failures: AtomicU32,
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub last_success: std::sync::RwLock<Option<Instant>>,
    pub last_failure: std::sync::RwLock<Option<Instant>>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub failed_requests: u64,
}

impl Default for UpstreamHealth {
    fn default() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            last_success: std::sync::RwLock::new(None),
            last_failure: std::sync::RwLock::new(None),
        }
    }
}

impl UpstreamHealth {
    pub fn record_success(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if let Ok(mut last) = self.last_success.write() {
            *last = Some(Instant::now());
        }
    }

    pub fn record_failure(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_failure.write() {
            *last = Some(Instant::now());
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
