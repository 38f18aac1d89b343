//! Relay error taxonomy.
//!
//! Errors are `Clone` because a single in-flight credential refresh hands the
//! same outcome to every caller waiting on it.

use std::time::Duration;

use http::StatusCode;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// Provider rejected the credential. Callers see it as an upstream failure.
    #[error("Upstream request failed: authentication rejected ({0})")]
    AuthFailure(String),

    #[error("Upstream request failed: {0}")]
    UpstreamRequestFailed(String),

    #[error("File URL invalid: {0}")]
    FileUrlInvalid(String),

    #[error("File exceeds size limit: {size} bytes > {limit} bytes")]
    FileExceedsSize { size: u64, limit: u64 },

    #[error("File upload failed: {0}")]
    FileUploadFailed(String),

    #[error("File upload timed out after {0:?}")]
    FileUploadTimeout(Duration),

    #[error("Stream decode error: {0}")]
    StreamDecodeError(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl RelayError {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, RelayError::AuthFailure(_))
    }

    /// Malformed provider streams are fatal for the request; everything else
    /// goes back through the orchestrator's retry loop.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RelayError::StreamDecodeError(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::FileUrlInvalid(_) | RelayError::FileExceedsSize { .. } => {
                StatusCode::BAD_REQUEST
            }
            RelayError::Timeout(_) | RelayError::FileUploadTimeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RelayError::Timeout(err.to_string())
        } else {
            RelayError::UpstreamRequestFailed(err.to_string())
        }
    }
}
