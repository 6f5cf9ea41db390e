//! Error types for modelgate.
//!
//! The taxonomy has three layers:
//! - [`ProviderError`]: what an adapter reports for a single provider call
//! - [`CandidateError`] / [`CandidateFailure`]: why one candidate of a route was abandoned
//! - [`DispatchError`]: what a caller of the dispatcher can observe

use std::fmt;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::adapter::Feature;
use crate::canonical::CanonicalResponse;
use crate::credentials::CredentialError;

/// Result type alias for modelgate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for modelgate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Missing or invalid master key")]
    Unauthorized,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable kind, used as the `type` of error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config_error",
            Error::Dispatch(e) => e.kind(),
            Error::Unauthorized => "unauthorized",
            Error::BadRequest(_) => "invalid_request",
            Error::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Dispatch(e) => e.status_code(),
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut error = serde_json::json!({
            "message": self.to_string(),
            "type": self.kind(),
            "code": status.as_u16()
        });

        // Attach the details a caller needs to decide what to do next
        match &self {
            Error::Dispatch(DispatchError::AllCandidatesFailed { failures, .. }) => {
                error["attempts"] = failures
                    .iter()
                    .map(CandidateFailure::to_json)
                    .collect::<Vec<_>>()
                    .into();
            }
            Error::Dispatch(DispatchError::SchemaValidation {
                errors,
                raw_response,
                ..
            }) => {
                error["validation_errors"] = serde_json::json!(errors);
                error["raw_response"] =
                    serde_json::to_value(raw_response.as_ref()).unwrap_or_default();
            }
            _ => {}
        }

        (status, axum::Json(serde_json::json!({ "error": error }))).into_response()
    }
}

/// Whether a provider failure may succeed on a different candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    Retryable,
    NonRetryable,
}

/// Provider-agnostic failure categories every adapter maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Provider throttled the call (HTTP 429 or equivalent).
    RateLimited,
    /// Call exceeded its deadline.
    Timeout,
    /// Transient server-side failure (5xx, connection reset).
    Transient,
    /// Provider answered with something that could not be decoded.
    MalformedOutput,
    /// Credentials were rejected.
    AuthFailed,
    /// Provider rejected the request shape.
    MalformedRequest,
    /// Anything else. Not retried.
    Other,
}

impl ProviderErrorKind {
    pub fn retryability(self) -> Retryability {
        match self {
            ProviderErrorKind::RateLimited
            | ProviderErrorKind::Timeout
            | ProviderErrorKind::Transient
            | ProviderErrorKind::MalformedOutput => Retryability::Retryable,
            ProviderErrorKind::AuthFailed
            | ProviderErrorKind::MalformedRequest
            | ProviderErrorKind::Other => Retryability::NonRetryable,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderErrorKind::RateLimited => "rate_limited",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::Transient => "transient",
            ProviderErrorKind::MalformedOutput => "malformed_output",
            ProviderErrorKind::AuthFailed => "auth_failed",
            ProviderErrorKind::MalformedRequest => "malformed_request",
            ProviderErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a [`ProviderAdapter`](crate::adapter::ProviderAdapter).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}{}: {message}", .status.map(|s| format!(" ({})", s)).unwrap_or_default())]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    /// Upstream HTTP status, when there was one.
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::RateLimited, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ProviderErrorKind::Timeout,
            format!("no response within {}ms", after.as_millis()),
        )
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transient, message)
    }

    pub fn malformed_output(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::MalformedOutput, message)
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::AuthFailed, message)
    }

    pub fn malformed_request(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::MalformedRequest, message)
    }

    /// Classify an upstream HTTP error status.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let kind = match status {
            429 => ProviderErrorKind::RateLimited,
            401 | 403 => ProviderErrorKind::AuthFailed,
            400 | 404 | 413 | 422 => ProviderErrorKind::MalformedRequest,
            408 => ProviderErrorKind::Timeout,
            s if is_retryable_status(s) => ProviderErrorKind::Transient,
            _ => ProviderErrorKind::Other,
        };
        Self {
            kind,
            status: Some(status),
            message: body.into(),
        }
    }

    pub fn retryability(&self) -> Retryability {
        self.kind.retryability()
    }

    pub fn is_retryable(&self) -> bool {
        self.retryability() == Retryability::Retryable
    }
}

/// Whether an HTTP status code is a transient server error.
///
/// Returns `true` for 500, 502, 503, 504. 501 Not Implemented is permanent.
pub fn is_retryable_status(status_code: u16) -> bool {
    matches!(status_code, 500 | 502 | 503 | 504)
}

/// Why a single candidate was abandoned during dispatch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CandidateError {
    #[error("missing credential: {0}")]
    MissingCredential(#[from] CredentialError),

    #[error("unsupported feature(s): {}", join_features(.missing))]
    UnsupportedFeature { missing: Vec<Feature> },

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("no adapter registered for provider '{provider_id}'")]
    NoAdapter { provider_id: String },

    #[error("entry misconfigured: {message}")]
    Misconfigured { message: String },
}

fn join_features(features: &[Feature]) -> String {
    features
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl CandidateError {
    pub fn kind(&self) -> &'static str {
        match self {
            CandidateError::MissingCredential(_) => "missing_credential",
            CandidateError::UnsupportedFeature { .. } => "unsupported_feature",
            CandidateError::Provider(e) if e.is_retryable() => "provider_error_retryable",
            CandidateError::Provider(_) => "provider_error_non_retryable",
            CandidateError::NoAdapter { .. } => "no_adapter",
            CandidateError::Misconfigured { .. } => "misconfigured",
        }
    }

    /// The provider error, if this candidate actually reached the provider.
    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            CandidateError::Provider(e) => Some(e),
            _ => None,
        }
    }
}

/// One abandoned candidate, in the order it was tried.
#[derive(Debug, Clone)]
pub struct CandidateFailure {
    pub provider_id: String,
    pub target_model: String,
    /// Redacted description of the credential reference that was used.
    pub credential: String,
    pub cause: CandidateError,
    pub elapsed: Duration,
}

impl CandidateFailure {
    fn to_json(&self) -> serde_json::Value {
        let mut value = serde_json::json!({
            "provider": self.provider_id,
            "model": self.target_model,
            "credential": self.credential,
            "kind": self.cause.kind(),
            "message": self.cause.to_string(),
            "elapsed_ms": self.elapsed.as_millis() as u64,
        });
        if let Some(status) = self.cause.provider_error().and_then(|e| e.status) {
            value["status"] = status.into();
        }
        value
    }
}

impl fmt::Display for CandidateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} [{}]: {}",
            self.provider_id, self.target_model, self.credential, self.cause
        )
    }
}

/// Errors surfaced by the dispatcher.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("No model entry matches alias '{alias}'")]
    UnknownModel { alias: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error(
        "Response from '{provider_id}' failed schema validation: {}",
        .errors.join("; ")
    )]
    SchemaValidation {
        provider_id: String,
        errors: Vec<String>,
        raw_response: Box<CanonicalResponse>,
    },

    #[error(
        "All {} candidate(s) for alias '{alias}' failed: {}",
        .failures.len(),
        .failures.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; ")
    )]
    AllCandidatesFailed {
        alias: String,
        failures: Vec<CandidateFailure>,
    },

    #[error("Dispatch for alias '{alias}' was cancelled")]
    Cancelled { alias: String },
}

impl DispatchError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::UnknownModel { .. } => "unknown_model",
            DispatchError::InvalidRequest { .. } => "invalid_request",
            DispatchError::SchemaValidation { .. } => "schema_validation_error",
            DispatchError::AllCandidatesFailed { .. } => "all_candidates_failed",
            DispatchError::Cancelled { .. } => "cancelled",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::UnknownModel { .. } => StatusCode::BAD_REQUEST,
            DispatchError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            DispatchError::SchemaValidation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            DispatchError::AllCandidatesFailed { .. } => StatusCode::BAD_GATEWAY,
            // nginx convention for "client closed request"
            DispatchError::Cancelled { .. } => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT)
            }
        }
    }
}
