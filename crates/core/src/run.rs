//! One execution of a scheduled job.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    PendingCluster,
    Active,
    Completed,
    TimedOut,
    Failed,
    UserTerminated,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::PendingCluster | RunStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::PendingCluster => "PENDING_CLUSTER",
            RunStatus::Active => "ACTIVE",
            RunStatus::Completed => "COMPLETED",
            RunStatus::TimedOut => "TIMED_OUT",
            RunStatus::Failed => "FAILED",
            RunStatus::UserTerminated => "USER_TERMINATED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING_CLUSTER" => Ok(RunStatus::PendingCluster),
            "ACTIVE" => Ok(RunStatus::Active),
            "COMPLETED" => Ok(RunStatus::Completed),
            "TIMED_OUT" => Ok(RunStatus::TimedOut),
            "FAILED" => Ok(RunStatus::Failed),
            "USER_TERMINATED" => Ok(RunStatus::UserTerminated),
            other => Err(ModelError::UnknownVariant {
                kind: "run status",
                value: other.to_string(),
            }),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunOutcome {
    Succeeded,
    TimedOut,
    Failed,
    TerminatedByUser,
}

impl From<RunOutcome> for RunStatus {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Succeeded => RunStatus::Completed,
            RunOutcome::TimedOut => RunStatus::TimedOut,
            RunOutcome::Failed => RunStatus::Failed,
            RunOutcome::TerminatedByUser => RunStatus::UserTerminated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub cluster_id: Option<Uuid>,
    pub status: RunStatus,
    /// Nominal start; the job's interval cadence is anchored here.
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl RunRecord {
    pub fn new(job_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            cluster_id: None,
            status: RunStatus::PendingCluster,
            started_at,
            finished_at: None,
            reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// `PendingCluster` to `Active`. Returns whether anything changed.
    pub fn activate(&mut self) -> bool {
        if self.status != RunStatus::PendingCluster {
            return false;
        }
        self.status = RunStatus::Active;
        true
    }

    /// Record the final outcome. A run that already finished keeps its first outcome.
    pub fn finish(
        &mut self,
        outcome: RunOutcome,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = outcome.into();
        self.finished_at = Some(now);
        self.reason = reason;
        true
    }
}
