//! In-process store for tests and single-process deployments.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use atmo_core::{Cluster, Identifier, RunRecord, ScheduledJob, Scope};

use crate::error::StoreError;
use crate::traits::{
    lease_expiry, ClusterFilter, IdentifierRegistry, JobFilter, Lease, Leases, RunFilter, Store,
};

/// All records live in maps behind `tokio` locks. Reservations and leases
/// are check-and-set under a single write lock, so concurrent callers in the
/// same process see the same guarantees as with PostgreSQL.
#[derive(Default)]
pub struct MemoryStore {
    clusters: RwLock<HashMap<Uuid, Cluster>>,
    jobs: RwLock<HashMap<Uuid, ScheduledJob>>,
    runs: RwLock<HashMap<Uuid, RunRecord>>,
    reservations: RwLock<HashMap<(Scope, String), Uuid>>,
    leases: RwLock<HashMap<String, Lease>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_cluster(&self, id: Uuid) -> Result<Option<Cluster>, StoreError> {
        Ok(self.clusters.read().await.get(&id).cloned())
    }

    async fn save_cluster(&self, cluster: &Cluster) -> Result<(), StoreError> {
        self.clusters
            .write()
            .await
            .insert(cluster.id, cluster.clone());
        Ok(())
    }

    async fn list_clusters(&self, filter: &ClusterFilter) -> Result<Vec<Cluster>, StoreError> {
        let mut out: Vec<_> = self
            .clusters
            .read()
            .await
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        out.sort_by_key(|c| c.created_at);
        Ok(out)
    }

    async fn load_job(&self, id: Uuid) -> Result<Option<ScheduledJob>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn save_job(&self, job: &ScheduledJob) -> Result<(), StoreError> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScheduledJob>, StoreError> {
        let mut out: Vec<_> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        out.sort_by_key(|j| j.created_at);
        Ok(out)
    }

    async fn load_run(&self, id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn save_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        self.runs.write().await.insert(run.id, run.clone());
        Ok(())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, StoreError> {
        let mut out: Vec<_> = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.started_at);
        Ok(out)
    }
}

#[async_trait]
impl IdentifierRegistry for MemoryStore {
    async fn reserve(
        &self,
        scope: Scope,
        identifier: &Identifier,
        owner: Uuid,
    ) -> Result<bool, StoreError> {
        let mut reservations = self.reservations.write().await;
        let holder = reservations
            .entry((scope, identifier.to_string()))
            .or_insert(owner);
        Ok(*holder == owner)
    }

    async fn release(
        &self,
        scope: Scope,
        identifier: &Identifier,
        owner: Uuid,
    ) -> Result<bool, StoreError> {
        let mut reservations = self.reservations.write().await;
        let key = (scope, identifier.to_string());
        if reservations.get(&key) == Some(&owner) {
            reservations.remove(&key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn is_taken(&self, scope: Scope, identifier: &Identifier) -> Result<bool, StoreError> {
        Ok(self
            .reservations
            .read()
            .await
            .contains_key(&(scope, identifier.to_string())))
    }
}

#[async_trait]
impl Leases for MemoryStore {
    async fn acquire_lease(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>, StoreError> {
        let mut leases = self.leases.write().await;
        if let Some(existing) = leases.get(key) {
            if !existing.is_expired(now) {
                return Ok(None);
            }
        }
        let lease = Lease {
            key: key.to_string(),
            holder: holder.to_string(),
            expires_at: lease_expiry(now, ttl),
        };
        leases.insert(key.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        let mut leases = self.leases.write().await;
        if leases.get(&lease.key).is_some_and(|l| l.holder == lease.holder) {
            leases.remove(&lease.key);
        }
        Ok(())
    }
}
