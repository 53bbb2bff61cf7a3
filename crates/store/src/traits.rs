//! Persistence seams used by the engine.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use atmo_core::{Cluster, ClusterState, Identifier, RunRecord, ScheduledJob, Scope};

use crate::error::StoreError;

// ── Filters ───────────────────────────────────────────────────

/// States a cluster can be in before it reaches a terminal state.
pub const ACTIVE_CLUSTER_STATES: &[ClusterState] = &[
    ClusterState::Requested,
    ClusterState::ProvisionSubmitted,
    ClusterState::Bootstrapping,
    ClusterState::Running,
    ClusterState::Terminating,
];

#[derive(Debug, Clone, Default)]
pub struct ClusterFilter {
    /// Only clusters in one of these states.
    pub states: Option<Vec<ClusterState>>,
    pub created_after: Option<DateTime<Utc>>,
    /// `Some(false)` for user clusters only, `Some(true)` for job-run clusters only.
    pub job_runs: Option<bool>,
}

impl ClusterFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn active() -> Self {
        Self {
            states: Some(ACTIVE_CLUSTER_STATES.to_vec()),
            ..Self::default()
        }
    }

    pub fn in_state(state: ClusterState) -> Self {
        Self {
            states: Some(vec![state]),
            ..Self::default()
        }
    }

    pub fn created_after(mut self, after: DateTime<Utc>) -> Self {
        self.created_after = Some(after);
        self
    }

    pub fn matches(&self, cluster: &Cluster) -> bool {
        if let Some(states) = &self.states {
            if !states.contains(&cluster.state) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if cluster.created_at < after {
                return false;
            }
        }
        match self.job_runs {
            Some(job_runs) => cluster.run_id.is_some() == job_runs,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JobFilter {
    pub include_deleted: bool,
    pub enabled_only: bool,
}

impl JobFilter {
    /// Enabled jobs that have not been deleted.
    pub fn schedulable() -> Self {
        Self {
            include_deleted: false,
            enabled_only: true,
        }
    }

    pub fn matches(&self, job: &ScheduledJob) -> bool {
        (self.include_deleted || !job.is_deleted()) && (!self.enabled_only || job.enabled)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunFilter {
    pub job_id: Option<Uuid>,
    pub active_only: bool,
}

impl RunFilter {
    pub fn active() -> Self {
        Self {
            job_id: None,
            active_only: true,
        }
    }

    pub fn for_job(job_id: Uuid) -> Self {
        Self {
            job_id: Some(job_id),
            active_only: false,
        }
    }

    pub fn matches(&self, run: &RunRecord) -> bool {
        self.job_id.map_or(true, |id| run.job_id == id) && (!self.active_only || run.is_active())
    }
}

// ── Leases ────────────────────────────────────────────────────

/// Exclusive hold on one entity for the duration of a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

pub fn cluster_lease_key(id: Uuid) -> String {
    format!("cluster:{id}")
}

pub fn job_lease_key(id: Uuid) -> String {
    format!("job:{id}")
}

pub(crate) fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ── Traits ────────────────────────────────────────────────────

/// Load/save/query for the three persisted records. Saves are upserts keyed by id.
#[async_trait]
pub trait Store: Send + Sync {
    async fn load_cluster(&self, id: Uuid) -> Result<Option<Cluster>, StoreError>;
    async fn save_cluster(&self, cluster: &Cluster) -> Result<(), StoreError>;
    async fn list_clusters(&self, filter: &ClusterFilter) -> Result<Vec<Cluster>, StoreError>;

    async fn load_job(&self, id: Uuid) -> Result<Option<ScheduledJob>, StoreError>;
    async fn save_job(&self, job: &ScheduledJob) -> Result<(), StoreError>;
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScheduledJob>, StoreError>;

    async fn load_run(&self, id: Uuid) -> Result<Option<RunRecord>, StoreError>;
    async fn save_run(&self, run: &RunRecord) -> Result<(), StoreError>;
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, StoreError>;
}

/// Uniqueness of human-chosen identifiers within a scope.
#[async_trait]
pub trait IdentifierRegistry: Send + Sync {
    /// Atomically reserve `identifier` for `owner`. Returns false when another
    /// owner holds it. Reserving again for the same owner succeeds.
    async fn reserve(
        &self,
        scope: Scope,
        identifier: &Identifier,
        owner: Uuid,
    ) -> Result<bool, StoreError>;

    /// Drop the reservation if `owner` holds it. Returns whether one was removed.
    async fn release(
        &self,
        scope: Scope,
        identifier: &Identifier,
        owner: Uuid,
    ) -> Result<bool, StoreError>;

    async fn is_taken(&self, scope: Scope, identifier: &Identifier) -> Result<bool, StoreError>;
}

/// Per-entity leases with holder and expiry.
#[async_trait]
pub trait Leases: Send + Sync {
    /// Take the lease for `key` unless an unexpired lease exists, whoever
    /// holds it. Callers use a distinct holder per acquisition.
    async fn acquire_lease(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>, StoreError>;

    /// Release a lease. A lease since taken over by someone else is left alone.
    async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError>;
}

/// Everything the engine needs from persistence.
pub trait Persistence: Store + IdentifierRegistry + Leases {}

impl<T: Store + IdentifierRegistry + Leases> Persistence for T {}
