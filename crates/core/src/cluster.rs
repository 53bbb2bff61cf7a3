//! Cluster records and the lifecycle state vocabulary.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ModelError;
use crate::identifier::Identifier;

/// Lifecycle state of a cluster as tracked locally.
///
/// Transitions only move forward through [`ClusterState::stage`]; an
/// observation of an earlier stage is ignored rather than applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterState {
    Requested,
    ProvisionSubmitted,
    Bootstrapping,
    Running,
    Terminating,
    Terminated,
    Failed,
}

impl ClusterState {
    /// Ordinal of the lifecycle stage. Both terminal states share the last stage.
    pub fn stage(&self) -> u8 {
        match self {
            ClusterState::Requested => 0,
            ClusterState::ProvisionSubmitted => 1,
            ClusterState::Bootstrapping => 2,
            ClusterState::Running => 3,
            ClusterState::Terminating => 4,
            ClusterState::Terminated | ClusterState::Failed => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ClusterState::Terminated | ClusterState::Failed)
    }

    /// Reported alive by the control plane.
    pub fn is_alive(&self) -> bool {
        matches!(self, ClusterState::Bootstrapping | ClusterState::Running)
    }

    pub fn can_advance_to(&self, next: ClusterState) -> bool {
        !self.is_terminal() && next.stage() > self.stage()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterState::Requested => "REQUESTED",
            ClusterState::ProvisionSubmitted => "PROVISION_SUBMITTED",
            ClusterState::Bootstrapping => "BOOTSTRAPPING",
            ClusterState::Running => "RUNNING",
            ClusterState::Terminating => "TERMINATING",
            ClusterState::Terminated => "TERMINATED",
            ClusterState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REQUESTED" => Ok(ClusterState::Requested),
            "PROVISION_SUBMITTED" => Ok(ClusterState::ProvisionSubmitted),
            "BOOTSTRAPPING" => Ok(ClusterState::Bootstrapping),
            "RUNNING" => Ok(ClusterState::Running),
            "TERMINATING" => Ok(ClusterState::Terminating),
            "TERMINATED" => Ok(ClusterState::Terminated),
            "FAILED" => Ok(ClusterState::Failed),
            other => Err(ModelError::UnknownVariant {
                kind: "cluster state",
                value: other.to_string(),
            }),
        }
    }
}

/// State reported by the control plane, already reduced to the states the
/// core cares about. Produced by the control-plane adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObservedState {
    Bootstrapping,
    Running,
    Terminating,
    Terminated,
    Failed,
}

impl ObservedState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ObservedState::Terminated | ObservedState::Failed)
    }
}

impl From<ObservedState> for ClusterState {
    fn from(observed: ObservedState) -> Self {
        match observed {
            ObservedState::Bootstrapping => ClusterState::Bootstrapping,
            ObservedState::Running => ClusterState::Running,
            ObservedState::Terminating => ClusterState::Terminating,
            ObservedState::Terminated => ClusterState::Terminated,
            ObservedState::Failed => ClusterState::Failed,
        }
    }
}

/// Parameters for a new cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub identifier: Identifier,
    /// Number of worker nodes.
    pub size: u32,
    pub release: String,
    /// Email of the requesting user.
    pub requested_by: String,
    /// SSH public key installed on the master node. Job-run clusters have none.
    pub public_key: Option<String>,
    /// Set when the cluster is created for a scheduled job run.
    pub run_id: Option<Uuid>,
}

impl ClusterSpec {
    pub fn validate(&self, max_size: u32) -> Result<(), ModelError> {
        if self.size == 0 || self.size > max_size {
            return Err(ModelError::InvalidSize {
                size: self.size,
                max: max_size,
            });
        }
        Ok(())
    }
}

/// Outcome of recording the master node address from a status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressChange {
    Unchanged,
    First,
    Changed { previous: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Uuid,
    pub identifier: Identifier,
    pub size: u32,
    pub release: String,
    pub requested_by: String,
    pub public_key: Option<String>,
    /// Public DNS name of the master node, known once bootstrapped.
    pub master_address: Option<String>,
    pub state: ClusterState,
    pub state_change_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Creation time according to the control-plane timeline.
    pub started_at: Option<DateTime<Utc>>,
    pub jobflow_id: Option<String>,
    pub run_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

impl Cluster {
    pub fn new(spec: ClusterSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identifier: spec.identifier,
            size: spec.size,
            release: spec.release,
            requested_by: spec.requested_by,
            public_key: spec.public_key,
            master_address: None,
            state: ClusterState::Requested,
            state_change_reason: None,
            created_at: now,
            started_at: None,
            jobflow_id: None,
            run_id: spec.run_id,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Clusters created by a scheduled job run do not hold a reservation in
    /// the cluster identifier scope.
    pub fn is_user_cluster(&self) -> bool {
        self.run_id.is_none()
    }

    /// Store the control plane's job flow id and move to `ProvisionSubmitted`.
    ///
    /// The id can only be assigned once.
    pub fn assign_jobflow_id(
        &mut self,
        jobflow_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ModelError> {
        if let Some(existing) = &self.jobflow_id {
            return Err(ModelError::JobFlowAlreadyAssigned(existing.clone()));
        }
        self.jobflow_id = Some(jobflow_id.into());
        self.advance(ClusterState::ProvisionSubmitted, None, now);
        Ok(())
    }

    /// Move forward to `next`, ignoring regressions and anything after a
    /// terminal state. Returns whether the state changed.
    pub fn advance(
        &mut self,
        next: ClusterState,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.state.can_advance_to(next) {
            return false;
        }
        self.state = next;
        if reason.is_some() {
            self.state_change_reason = reason;
        }
        self.updated_at = now;
        true
    }

    pub fn record_master_address(&mut self, address: &str) -> AddressChange {
        match self.master_address.replace(address.to_string()) {
            None => AddressChange::First,
            Some(previous) if previous == address => AddressChange::Unchanged,
            Some(previous) => AddressChange::Changed { previous },
        }
    }
}
