//! Cluster lifecycle: request, submission, polling, termination and
//! reconciliation against the control plane.
//!
//! Every mutation of a cluster record happens here, under the cluster's
//! lease, and only ever moves the state forward.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::TryStreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use atmo_core::config::LimitsConfig;
use atmo_core::{AddressChange, Cluster, ClusterSpec, ClusterState, Scope};
use atmo_provisioner::{ControlPlane, ControlPlaneError, LaunchPlanner, LaunchRequest, NotebookStore};
use atmo_store::{cluster_lease_key, ClusterFilter, Persistence};

use crate::error::EngineError;
use crate::lease::LeaseKeeper;

const REASON_VANISHED: &str = "Cluster no longer known to the control plane";
const REASON_UNLISTED: &str = "Cluster missing from control-plane listing";
const REASON_NEVER_LAUNCHED: &str = "Terminated before launch";

/// Creation-time window for a reconciliation sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileWindow {
    /// Start of the listing window.
    pub created_after: DateTime<Utc>,
    /// Local clusters created after this are still settling and are skipped.
    pub settled_before: DateTime<Utc>,
}

impl ReconcileWindow {
    pub fn new(now: DateTime<Utc>, lookback: Duration, settle: Duration) -> Self {
        Self {
            created_after: now - lookback,
            settled_before: now - settle,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Clusters returned by the control-plane listing.
    pub listed: usize,
    /// Local clusters marked terminated because the listing no longer has them.
    pub vanished: Vec<Uuid>,
    /// Local clusters refreshed because the listing reported them terminal.
    pub refreshed: Vec<Uuid>,
    /// Control-plane job flows with no local record.
    pub untracked: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallReport {
    pub cluster_id: Uuid,
    pub identifier: String,
    pub jobflow_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub waiting: Duration,
}

pub struct LifecycleManager {
    store: Arc<dyn Persistence>,
    control_plane: Arc<dyn ControlPlane>,
    notebooks: Arc<dyn NotebookStore>,
    planner: LaunchPlanner,
    limits: LimitsConfig,
    leases: LeaseKeeper,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn Persistence>,
        control_plane: Arc<dyn ControlPlane>,
        notebooks: Arc<dyn NotebookStore>,
        planner: LaunchPlanner,
        limits: LimitsConfig,
        holder: impl Into<String>,
    ) -> Self {
        let leases = LeaseKeeper::new(store.clone(), holder.into(), limits.lease_ttl());
        Self {
            store,
            control_plane,
            notebooks,
            planner,
            limits,
            leases,
        }
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    pub fn control_plane_name(&self) -> &str {
        self.control_plane.name()
    }

    /// Validate, reserve the identifier and launch a new cluster.
    ///
    /// The cluster record is returned on success. On failure the record has
    /// already been persisted: `FAILED` for permanent rejections, `REQUESTED`
    /// for retryable ones (see [`LifecycleManager::submit`]).
    pub async fn request_cluster(
        &self,
        spec: ClusterSpec,
        now: DateTime<Utc>,
    ) -> Result<Cluster, EngineError> {
        let cluster = self.create(spec, now).await?;
        self.submit(cluster.id, now).await
    }

    /// Persist a `REQUESTED` cluster without launching it.
    ///
    /// User clusters reserve their identifier in the cluster scope. Job-run
    /// clusters reuse the job's identifier, which is reserved in the job scope.
    pub async fn create(&self, spec: ClusterSpec, now: DateTime<Utc>) -> Result<Cluster, EngineError> {
        spec.validate(self.limits.max_cluster_size)?;
        let cluster = Cluster::new(spec, now);

        if cluster.is_user_cluster()
            && !self
                .store
                .reserve(Scope::Clusters, &cluster.identifier, cluster.id)
                .await?
        {
            info!(identifier = %cluster.identifier, "Cluster identifier already taken");
            return Err(EngineError::IdentifierConflict {
                scope: Scope::Clusters,
                identifier: cluster.identifier,
            });
        }

        if let Err(e) = self.store.save_cluster(&cluster).await {
            if cluster.is_user_cluster() {
                if let Err(release_err) = self
                    .store
                    .release(Scope::Clusters, &cluster.identifier, cluster.id)
                    .await
                {
                    error!(
                        cluster_id = %cluster.id,
                        identifier = %cluster.identifier,
                        error = %release_err,
                        "Failed to roll back identifier reservation"
                    );
                }
            }
            return Err(e.into());
        }

        info!(
            cluster_id = %cluster.id,
            identifier = %cluster.identifier,
            size = cluster.size,
            release = %cluster.release,
            run_id = ?cluster.run_id,
            "Cluster requested"
        );
        Ok(cluster)
    }

    /// Launch a `REQUESTED` cluster. Clusters past `REQUESTED` are returned unchanged.
    pub async fn submit(&self, cluster_id: Uuid, now: DateTime<Utc>) -> Result<Cluster, EngineError> {
        let lease = self.leases.acquire(cluster_lease_key(cluster_id)).await?;
        let result = self.submit_locked(cluster_id, now).await;
        self.leases.release(lease).await;
        result
    }

    async fn submit_locked(
        &self,
        cluster_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Cluster, EngineError> {
        let mut cluster = self.load(cluster_id).await?;
        if cluster.state != ClusterState::Requested {
            debug!(cluster_id = %cluster.id, state = %cluster.state, "Cluster already submitted");
            return Ok(cluster);
        }

        let request = self.launch_request(&cluster).await?;
        match self.control_plane.launch(&request).await {
            Ok(jobflow_id) => {
                // The launch can outlive the lease's TTL, so re-read before
                // writing over whatever happened meanwhile.
                let current = self.load(cluster_id).await?;
                if current.state != ClusterState::Requested || current.jobflow_id.is_some() {
                    warn!(
                        cluster_id = %cluster.id,
                        jobflow_id = %jobflow_id,
                        state = %current.state,
                        "Cluster changed during launch, terminating the new job flow"
                    );
                    if let Err(e) = self.control_plane.terminate(&jobflow_id).await {
                        error!(jobflow_id = %jobflow_id, error = %e, "Failed to terminate orphaned job flow");
                    }
                    return Ok(current);
                }
                cluster.assign_jobflow_id(jobflow_id, now)?;
                self.store.save_cluster(&cluster).await?;
                info!(
                    cluster_id = %cluster.id,
                    identifier = %cluster.identifier,
                    jobflow_id = ?cluster.jobflow_id,
                    backend = self.control_plane.name(),
                    "Cluster submitted"
                );
                Ok(cluster)
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    cluster_id = %cluster.id,
                    identifier = %cluster.identifier,
                    error = %e,
                    "Launch failed, cluster stays REQUESTED"
                );
                Err(e.into())
            }
            Err(e) => {
                let reason = rejection_reason(&e);
                error!(
                    cluster_id = %cluster.id,
                    identifier = %cluster.identifier,
                    reason = %reason,
                    "Launch rejected, cluster FAILED"
                );
                cluster.advance(ClusterState::Failed, Some(reason.clone()), now);
                self.store.save_cluster(&cluster).await?;
                self.release_identifier(&cluster).await;
                Err(EngineError::ProvisioningRejected {
                    retryable: false,
                    reason,
                })
            }
        }
    }

    async fn launch_request(&self, cluster: &Cluster) -> Result<LaunchRequest, EngineError> {
        let Some(run_id) = cluster.run_id else {
            return Ok(self.planner.cluster_launch(cluster));
        };
        let run = self
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found("run", run_id))?;
        let job = self
            .store
            .load_job(run.job_id)
            .await?
            .ok_or_else(|| EngineError::not_found("job", run.job_id))?;
        let notebook_uri = self.notebooks.uri(&job.notebook);
        Ok(self.planner.job_run_launch(&job, cluster, &notebook_uri))
    }

    /// Poll the control plane and fold the observation into the local record.
    ///
    /// Terminal clusters and clusters that were never launched are returned
    /// unchanged. A job flow the control plane no longer knows is recorded as
    /// `TERMINATED`.
    pub async fn refresh(&self, cluster_id: Uuid, now: DateTime<Utc>) -> Result<Cluster, EngineError> {
        let lease = self.leases.acquire(cluster_lease_key(cluster_id)).await?;
        let result = self.refresh_locked(cluster_id, now).await;
        self.leases.release(lease).await;
        result
    }

    async fn refresh_locked(
        &self,
        cluster_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Cluster, EngineError> {
        let mut cluster = self.load(cluster_id).await?;
        if cluster.state.is_terminal() {
            return Ok(cluster);
        }
        let Some(jobflow_id) = cluster.jobflow_id.clone() else {
            return Ok(cluster);
        };

        let status = match self.control_plane.describe(&jobflow_id).await {
            Ok(status) => status,
            Err(ControlPlaneError::NotFound(_)) => {
                warn!(
                    cluster_id = %cluster.id,
                    jobflow_id = %jobflow_id,
                    previous = %cluster.state,
                    "Job flow vanished from the control plane"
                );
                cluster.advance(
                    ClusterState::Terminated,
                    Some(REASON_VANISHED.to_string()),
                    now,
                );
                self.store.save_cluster(&cluster).await?;
                self.release_identifier(&cluster).await;
                return Ok(cluster);
            }
            Err(e) => return Err(e.into()),
        };

        debug!(
            cluster_id = %cluster.id,
            jobflow_id = %jobflow_id,
            raw_state = %status.raw_state,
            "Described cluster"
        );

        let mut dirty = false;

        if let Some(address) = status.master_address.as_deref() {
            match cluster.record_master_address(address) {
                AddressChange::Unchanged => {}
                AddressChange::First => {
                    info!(cluster_id = %cluster.id, master_address = %address, "Master address known");
                    dirty = true;
                }
                AddressChange::Changed { previous } => {
                    warn!(
                        cluster_id = %cluster.id,
                        previous = %previous,
                        master_address = %address,
                        "Master address changed"
                    );
                    dirty = true;
                }
            }
        }

        if cluster.started_at.is_none() && status.start_time.is_some() {
            cluster.started_at = status.start_time;
            dirty = true;
        }

        let previous = cluster.state;
        let next = ClusterState::from(status.state);
        if cluster.advance(next, status.state_change_reason.clone(), now) {
            info!(
                cluster_id = %cluster.id,
                identifier = %cluster.identifier,
                from = %previous,
                to = %next,
                reason = ?cluster.state_change_reason,
                "Cluster state changed"
            );
            dirty = true;
        } else if next.stage() < previous.stage() {
            debug!(
                cluster_id = %cluster.id,
                state = %previous,
                observed = %next,
                "Ignoring observation of an earlier stage"
            );
        } else if cluster.state == next
            && status.state_change_reason.is_some()
            && cluster.state_change_reason != status.state_change_reason
        {
            cluster.state_change_reason = status.state_change_reason.clone();
            dirty = true;
        }

        if dirty {
            cluster.updated_at = now;
            self.store.save_cluster(&cluster).await?;
        }
        if cluster.state.is_terminal() {
            self.release_identifier(&cluster).await;
        }
        Ok(cluster)
    }

    /// Request termination. Idempotent: terminal clusters are returned
    /// unchanged, and a `TERMINATING` cluster gets the request re-sent.
    ///
    /// The cluster only reaches `TERMINATED` through a later refresh, except
    /// for clusters that were never launched.
    pub async fn terminate(&self, cluster_id: Uuid, now: DateTime<Utc>) -> Result<Cluster, EngineError> {
        let lease = self.leases.acquire(cluster_lease_key(cluster_id)).await?;
        let result = self.terminate_locked(cluster_id, now).await;
        self.leases.release(lease).await;
        result
    }

    async fn terminate_locked(
        &self,
        cluster_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Cluster, EngineError> {
        let mut cluster = self.load(cluster_id).await?;
        if cluster.state.is_terminal() {
            return Ok(cluster);
        }

        let Some(jobflow_id) = cluster.jobflow_id.clone() else {
            cluster.advance(
                ClusterState::Terminated,
                Some(REASON_NEVER_LAUNCHED.to_string()),
                now,
            );
            self.store.save_cluster(&cluster).await?;
            self.release_identifier(&cluster).await;
            info!(cluster_id = %cluster.id, identifier = %cluster.identifier, "Unlaunched cluster terminated");
            return Ok(cluster);
        };

        self.control_plane.terminate(&jobflow_id).await?;

        if cluster.advance(ClusterState::Terminating, None, now) {
            self.store.save_cluster(&cluster).await?;
        }
        info!(
            cluster_id = %cluster.id,
            identifier = %cluster.identifier,
            jobflow_id = %jobflow_id,
            "Cluster termination requested"
        );
        Ok(cluster)
    }

    /// Compare local records with the control-plane listing for `window`.
    pub async fn reconcile(
        &self,
        window: ReconcileWindow,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, EngineError> {
        let listed = self
            .control_plane
            .list(window.created_after, None)
            .try_collect::<Vec<_>>()
            .await?;

        let mut report = ReconcileReport {
            listed: listed.len(),
            ..ReconcileReport::default()
        };

        // Local records are created before the control plane sees the
        // cluster, so look back a little further when matching.
        let known: HashSet<String> = self
            .store
            .list_clusters(
                &ClusterFilter::all()
                    .created_after(window.created_after - self.limits.provision_grace()),
            )
            .await?
            .into_iter()
            .filter_map(|c| c.jobflow_id)
            .collect();

        let listed_ids: HashSet<&str> = listed.iter().map(|c| c.jobflow_id.as_str()).collect();
        report.untracked = listed
            .iter()
            .filter(|c| !known.contains(&c.jobflow_id))
            .map(|c| c.jobflow_id.clone())
            .collect();

        let active = self
            .store
            .list_clusters(&ClusterFilter::active().created_after(window.created_after))
            .await?;

        for cluster in active {
            let Some(jobflow_id) = cluster.jobflow_id.as_deref() else {
                continue;
            };
            if cluster.created_at > window.settled_before {
                continue;
            }

            if !listed_ids.contains(jobflow_id) {
                match self.mark_unlisted(cluster.id, now).await {
                    Ok(true) => report.vanished.push(cluster.id),
                    Ok(false) => {}
                    Err(e) => log_skip(cluster.id, "mark unlisted", &e),
                }
                continue;
            }

            let listed_terminal = listed
                .iter()
                .any(|c| c.jobflow_id == jobflow_id && c.state.is_terminal());
            if listed_terminal && cluster.state.is_alive() {
                match self.refresh(cluster.id, now).await {
                    Ok(_) => report.refreshed.push(cluster.id),
                    Err(e) => log_skip(cluster.id, "refresh", &e),
                }
            }
        }

        info!(
            listed = report.listed,
            vanished = report.vanished.len(),
            refreshed = report.refreshed.len(),
            untracked = report.untracked.len(),
            "Reconciliation finished"
        );
        if !report.untracked.is_empty() {
            warn!(jobflow_ids = ?report.untracked, "Untracked job flows on the control plane");
        }
        Ok(report)
    }

    async fn mark_unlisted(&self, cluster_id: Uuid, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let lease = self.leases.acquire(cluster_lease_key(cluster_id)).await?;
        let result = self.mark_unlisted_locked(cluster_id, now).await;
        self.leases.release(lease).await;
        result
    }

    async fn mark_unlisted_locked(&self, cluster_id: Uuid, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let mut cluster = self.load(cluster_id).await?;
        if !cluster.advance(
            ClusterState::Terminated,
            Some(REASON_UNLISTED.to_string()),
            now,
        ) {
            return Ok(false);
        }
        self.store.save_cluster(&cluster).await?;
        self.release_identifier(&cluster).await;
        warn!(
            cluster_id = %cluster.id,
            jobflow_id = ?cluster.jobflow_id,
            "Cluster missing from listing, marked TERMINATED"
        );
        Ok(true)
    }

    /// Clusters that have sat in `PROVISION_SUBMITTED` longer than the grace
    /// period. Reported only; nothing is changed.
    pub async fn stalled(&self, now: DateTime<Utc>) -> Result<Vec<StallReport>, EngineError> {
        let grace = self.limits.provision_grace();
        let reports: Vec<_> = self
            .store
            .list_clusters(&ClusterFilter::in_state(ClusterState::ProvisionSubmitted))
            .await?
            .into_iter()
            .filter(|c| now - c.updated_at > grace)
            .map(|c| StallReport {
                cluster_id: c.id,
                identifier: c.identifier.to_string(),
                jobflow_id: c.jobflow_id,
                submitted_at: c.updated_at,
                waiting: now - c.updated_at,
            })
            .collect();

        for r in &reports {
            warn!(
                cluster_id = %r.cluster_id,
                identifier = %r.identifier,
                jobflow_id = ?r.jobflow_id,
                waiting_minutes = r.waiting.num_minutes(),
                "Cluster stalled in PROVISION_SUBMITTED"
            );
        }
        Ok(reports)
    }

    pub async fn load(&self, cluster_id: Uuid) -> Result<Cluster, EngineError> {
        self.store
            .load_cluster(cluster_id)
            .await?
            .ok_or_else(|| EngineError::not_found("cluster", cluster_id))
    }

    /// User clusters give their identifier back once terminal.
    async fn release_identifier(&self, cluster: &Cluster) {
        if !cluster.is_user_cluster() || !cluster.state.is_terminal() {
            return;
        }
        match self
            .store
            .release(Scope::Clusters, &cluster.identifier, cluster.id)
            .await
        {
            Ok(true) => debug!(identifier = %cluster.identifier, "Identifier released"),
            Ok(false) => {}
            Err(e) => error!(
                cluster_id = %cluster.id,
                identifier = %cluster.identifier,
                error = %e,
                "Failed to release identifier"
            ),
        }
    }
}

fn rejection_reason(err: &ControlPlaneError) -> String {
    match err {
        ControlPlaneError::Rejected { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}

fn log_skip(cluster_id: Uuid, action: &str, err: &EngineError) {
    if matches!(err, EngineError::LeaseUnavailable(_)) {
        debug!(cluster_id = %cluster_id, action, "Cluster leased elsewhere, skipped");
    } else {
        warn!(cluster_id = %cluster_id, action, error = %err, "Reconciliation step failed");
    }
}
