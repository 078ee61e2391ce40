use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::models::ErrorBody;

/// Failures of the record store. Always fatal to the admission call.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Errors surfaced by the coordinator's public operations.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("identifier must not be empty")]
    EmptyIdentifier,

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    // Carries the identifier fingerprint, never the raw identifier
    #[error("admission actor {0} stopped before replying")]
    ActorGone(String),
}

impl AdmissionError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::EmptyIdentifier => StatusCode::BAD_REQUEST,
            // fail closed: a coordinator that cannot answer denies
            Self::Storage(_) | Self::ActorGone(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "admission coordinator unavailable");
        }
        (status, Json(ErrorBody::new(self.to_string()))).into_response()
    }
}

/// Reasons a CAPTCHA verification did not succeed. Reported to the caller
/// as `{success: false, error}`, never raised past the coordinator.
#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("not configured")]
    NotConfigured,

    #[error("missing token")]
    MissingToken,

    #[error("{}", describe_rejection(.0))]
    Rejected(Vec<String>),

    #[error("verification timed out")]
    Timeout,

    #[error("verification request failed: {0}")]
    Transport(String),

    #[error("verification endpoint returned HTTP {0}")]
    Status(u16),

    #[error("malformed verification response: {0}")]
    Malformed(String),
}

fn describe_rejection(codes: &[String]) -> String {
    if codes.is_empty() {
        "verification failed".to_string()
    } else {
        format!("verification failed: {}", codes.join(", "))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
