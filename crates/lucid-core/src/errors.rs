use std::time::Duration;

/// Typed error hierarchy for inference-backend operations.
/// Classifies errors as fatal (don't retry) or retryable.
#[derive(Clone, Debug, thiserror::Error)]
pub enum InferenceError {
    // Fatal — don't retry
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid response from backend: {0}")]
    InvalidResponse(String),
    #[error("no models loaded on the backend")]
    NoModels,

    // Retryable
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl InferenceError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ServerError { .. } | Self::NetworkError(_) | Self::Timeout(_)
        )
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidResponse(_) => "invalid_response",
            Self::NoModels => "no_models",
            Self::ServerError { .. } => "server_error",
            Self::NetworkError(_) => "network_error",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            400..=499 => Self::InvalidRequest(format!("status {status}: {body}")),
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidResponse(format!("unexpected status {status}: {body}")),
        }
    }
}
