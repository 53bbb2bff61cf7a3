//! Control-plane and artifact-store error types.

use thiserror::Error;

/// Service error codes that indicate throttling or a transient server-side fault.
const RETRYABLE_CODES: &[&str] = &[
    "ThrottlingException",
    "Throttling",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "InternalServerError",
    "InternalServerException",
    "InternalFailure",
    "ServiceUnavailable",
    "ServiceUnavailableException",
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ControlPlaneError {
    /// The control plane refused the request. `retryable` separates throttling
    /// and capacity problems from malformed requests.
    #[error("request rejected (retryable: {retryable}): {reason}")]
    Rejected { retryable: bool, reason: String },

    /// The job flow is unknown, usually because the control plane already reaped it.
    #[error("job flow {0} not found")]
    NotFound(String),

    /// Network or transport failure before a response arrived.
    #[error("control plane unavailable: {0}")]
    Unavailable(String),

    /// The call exceeded its time budget.
    #[error("{operation} exceeded its {seconds}s call budget")]
    Timeout { operation: &'static str, seconds: u64 },

    /// The response was missing fields or carried an unknown state.
    #[error("invalid control plane response: {0}")]
    InvalidResponse(String),
}

impl ControlPlaneError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ControlPlaneError::Rejected { retryable, .. } => *retryable,
            ControlPlaneError::Unavailable(_) | ControlPlaneError::Timeout { .. } => true,
            ControlPlaneError::NotFound(_) | ControlPlaneError::InvalidResponse(_) => false,
        }
    }
}

/// Map a service error code and message onto [`ControlPlaneError::Rejected`].
pub fn classify_service_error(code: Option<&str>, message: &str) -> ControlPlaneError {
    let retryable = code.is_some_and(|c| RETRYABLE_CODES.contains(&c));
    let reason = match code {
        Some(c) => format!("{c}: {message}"),
        None => message.to_string(),
    };
    ControlPlaneError::Rejected { retryable, reason }
}

/// EMR answers lookups of reaped or unknown clusters with an
/// `InvalidRequestException` whose message names the id as not valid.
pub fn is_unknown_cluster(code: Option<&str>, message: &str) -> bool {
    if !matches!(code, Some("InvalidRequestException") | Some("ValidationException")) {
        return false;
    }
    let message = message.to_ascii_lowercase();
    message.contains("is not valid")
        || message.contains("does not exist")
        || message.contains("not found")
}

#[derive(Debug, Error)]
pub enum NotebookStoreError {
    #[error("only Jupyter notebooks (.ipynb) can be uploaded, got {0:?}")]
    InvalidName(String),

    #[error("artifact store error: {0}")]
    Backend(String),
}
