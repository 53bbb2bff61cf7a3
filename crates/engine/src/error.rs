use thiserror::Error;
use uuid::Uuid;

use atmo_core::{Identifier, ModelError, Scope};
use atmo_provisioner::{ControlPlaneError, NotebookStoreError};
use atmo_store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A model invariant was violated by the request.
    #[error("invalid request: {0}")]
    Validation(#[from] ModelError),

    #[error("identifier {identifier} is already in use ({scope})")]
    IdentifierConflict { scope: Scope, identifier: Identifier },

    #[error("provisioning rejected (retryable: {retryable}): {reason}")]
    ProvisioningRejected { retryable: bool, reason: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("control plane call timed out: {0}")]
    Timeout(String),

    #[error("control plane unavailable: {0}")]
    ControlPlaneUnavailable(String),

    #[error("control plane returned an invalid response: {0}")]
    InvalidResponse(String),

    /// Another worker holds the entity's lease; skip it this pass.
    #[error("lease {0} is held by another worker")]
    LeaseUnavailable(String),

    #[error("job {0} is not due")]
    NotDue(Uuid),

    #[error("confirmation does not match identifier {0}")]
    ConfirmationMismatch(Identifier),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("notebook store error: {0}")]
    Notebook(#[from] NotebookStoreError),
}

impl EngineError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether the same call may succeed if repeated after a backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::ProvisioningRejected { retryable, .. } => *retryable,
            EngineError::Timeout(_)
            | EngineError::ControlPlaneUnavailable(_)
            | EngineError::LeaseUnavailable(_) => true,
            EngineError::Store(e) => e.is_transient(),
            EngineError::Validation(_)
            | EngineError::IdentifierConflict { .. }
            | EngineError::NotFound { .. }
            | EngineError::InvalidResponse(_)
            | EngineError::NotDue(_)
            | EngineError::ConfirmationMismatch(_)
            | EngineError::Notebook(_) => false,
        }
    }
}

impl From<ControlPlaneError> for EngineError {
    fn from(err: ControlPlaneError) -> Self {
        match err {
            ControlPlaneError::Rejected { retryable, reason } => {
                EngineError::ProvisioningRejected { retryable, reason }
            }
            ControlPlaneError::NotFound(id) => EngineError::not_found("job flow", id),
            ControlPlaneError::Unavailable(reason) => EngineError::ControlPlaneUnavailable(reason),
            e @ ControlPlaneError::Timeout { .. } => EngineError::Timeout(e.to_string()),
            ControlPlaneError::InvalidResponse(reason) => EngineError::InvalidResponse(reason),
        }
    }
}
