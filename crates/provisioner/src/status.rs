//! EMR state vocabulary normalization.

use atmo_core::ObservedState;

use crate::error::ControlPlaneError;

/// Reduce an EMR cluster state string to an [`ObservedState`].
///
/// Starting and bootstrapping collapse into `Bootstrapping`, waiting and
/// running into `Running`. A termination with errors is a failure.
pub fn normalize_state(raw: &str) -> Result<ObservedState, ControlPlaneError> {
    match raw {
        "STARTING" | "BOOTSTRAPPING" => Ok(ObservedState::Bootstrapping),
        "RUNNING" | "WAITING" => Ok(ObservedState::Running),
        "TERMINATING" => Ok(ObservedState::Terminating),
        "TERMINATED" => Ok(ObservedState::Terminated),
        "TERMINATED_WITH_ERRORS" => Ok(ObservedState::Failed),
        other => Err(ControlPlaneError::InvalidResponse(format!(
            "unknown cluster state {other:?}"
        ))),
    }
}

/// Canonical EMR string for an observed state.
pub fn raw_state_for(state: ObservedState) -> &'static str {
    match state {
        ObservedState::Bootstrapping => "BOOTSTRAPPING",
        ObservedState::Running => "WAITING",
        ObservedState::Terminating => "TERMINATING",
        ObservedState::Terminated => "TERMINATED",
        ObservedState::Failed => "TERMINATED_WITH_ERRORS",
    }
}
