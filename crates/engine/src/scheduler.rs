//! Recurring job scheduling: due checks, run start, timeouts and completion.
//!
//! [`is_due`] and [`check_timeout`] are pure. The [`Scheduler`] applies
//! their decisions under the job's lease and asks the lifecycle manager for
//! the run's cluster.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use atmo_core::{ClusterSpec, ClusterState, RunOutcome, RunRecord, ScheduledJob, Scope};
use atmo_store::{job_lease_key, JobFilter, Persistence, RunFilter};

use crate::error::EngineError;
use crate::lease::LeaseKeeper;
use crate::lifecycle::LifecycleManager;

/// Whether `job` should start a run at `now`.
///
/// Disabled, deleted and in-flight jobs are never due, nor is anything
/// outside the start/end window. Otherwise a job is due once its interval has
/// elapsed since the last run; a `Once` job is due only before its first run.
pub fn is_due(job: &ScheduledJob, now: DateTime<Utc>) -> bool {
    if !job.enabled || job.is_deleted() || job.active_run_id.is_some() {
        return false;
    }
    if !job.in_window(now) {
        return false;
    }
    match (job.last_run_at, job.interval.duration()) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(last), Some(interval)) => now >= last + interval,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCheck {
    Continue,
    Expire,
}

/// Expire a run once it has been going for the job's full timeout.
pub fn check_timeout(run: &RunRecord, job: &ScheduledJob, now: DateTime<Utc>) -> TimeoutCheck {
    if now - run.started_at >= job.timeout.duration() {
        TimeoutCheck::Expire
    } else {
        TimeoutCheck::Continue
    }
}

pub struct Scheduler {
    store: Arc<dyn Persistence>,
    lifecycle: Arc<LifecycleManager>,
    leases: LeaseKeeper,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Persistence>,
        lifecycle: Arc<LifecycleManager>,
        holder: impl Into<String>,
    ) -> Self {
        let ttl = lifecycle.limits().lease_ttl();
        let leases = LeaseKeeper::new(store.clone(), holder.into(), ttl);
        Self {
            store,
            lifecycle,
            leases,
        }
    }

    /// Enabled, undeleted jobs that are due at `now`.
    pub async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, EngineError> {
        Ok(self
            .store
            .list_jobs(&JobFilter::schedulable())
            .await?
            .into_iter()
            .filter(|job| is_due(job, now))
            .collect())
    }

    /// Start a run of a due job and launch its cluster without waiting for it.
    ///
    /// A permanent launch rejection completes the run as `FAILED`; a
    /// retryable one leaves the cluster `REQUESTED` for the next driver pass.
    pub async fn start_run(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<RunRecord, EngineError> {
        let lease = self.leases.acquire(job_lease_key(job_id)).await?;
        let result = self.start_run_locked(job_id, now).await;
        self.leases.release(lease).await;
        result
    }

    async fn start_run_locked(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<RunRecord, EngineError> {
        let mut job = self.load_job(job_id).await?;
        if !is_due(&job, now) {
            return Err(EngineError::NotDue(job_id));
        }

        let mut run = RunRecord::new(job.id, now);
        self.store.save_run(&run).await?;
        job.active_run_id = Some(run.id);
        self.store.save_job(&job).await?;
        info!(job_id = %job.id, identifier = %job.identifier, run_id = %run.id, "Run started");

        let spec = ClusterSpec {
            identifier: job.identifier.clone(),
            size: job.size,
            release: job.release.clone(),
            requested_by: job.requested_by.clone(),
            public_key: None,
            run_id: Some(run.id),
        };
        let cluster = match self.lifecycle.create(spec, now).await {
            Ok(cluster) => cluster,
            Err(e) => {
                warn!(job_id = %job.id, run_id = %run.id, error = %e, "Could not create run cluster");
                return self
                    .complete_locked(&mut job, run, RunOutcome::Failed, Some(e.to_string()), now)
                    .await;
            }
        };
        run.cluster_id = Some(cluster.id);
        self.store.save_run(&run).await?;

        match self.lifecycle.submit(cluster.id, now).await {
            Ok(cluster) => {
                debug!(run_id = %run.id, cluster_id = %cluster.id, state = %cluster.state, "Run cluster submitted");
                Ok(run)
            }
            Err(e) if e.is_retryable() => {
                warn!(run_id = %run.id, cluster_id = %cluster.id, error = %e, "Run cluster launch deferred");
                Ok(run)
            }
            Err(e) => {
                self.complete_locked(&mut job, run, RunOutcome::Failed, Some(e.to_string()), now)
                    .await
            }
        }
    }

    /// Record a run's outcome and update its job. A run that already
    /// finished keeps its first outcome.
    pub async fn complete_run(
        &self,
        run_id: Uuid,
        outcome: RunOutcome,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<RunRecord, EngineError> {
        let job_id = self.load_run(run_id).await?.job_id;
        let lease = self.leases.acquire(job_lease_key(job_id)).await?;
        let result = self.complete_reloaded(job_id, run_id, outcome, reason, now).await;
        self.leases.release(lease).await;
        result
    }

    async fn complete_reloaded(
        &self,
        job_id: Uuid,
        run_id: Uuid,
        outcome: RunOutcome,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<RunRecord, EngineError> {
        let mut job = self.load_job(job_id).await?;
        // Reload under the lease.
        let run = self.load_run(run_id).await?;
        self.complete_locked(&mut job, run, outcome, reason, now).await
    }

    async fn complete_locked(
        &self,
        job: &mut ScheduledJob,
        mut run: RunRecord,
        outcome: RunOutcome,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<RunRecord, EngineError> {
        if run.finish(outcome, reason, now) {
            self.store.save_run(&run).await?;
            info!(
                job_id = %job.id,
                run_id = %run.id,
                status = %run.status,
                reason = ?run.reason,
                "Run finished"
            );
        }

        if job.active_run_id == Some(run.id) {
            job.active_run_id = None;
            job.last_run_at = Some(run.started_at);
            if job.interval.is_once() && job.enabled {
                job.enabled = false;
                info!(job_id = %job.id, identifier = %job.identifier, "One-off job disabled after its run");
            }
            self.store.save_job(job).await?;
        }
        Ok(run)
    }

    /// Terminate the run's cluster and record the run as `TIMED_OUT`.
    ///
    /// A failed termination is logged and the outcome stands; reconciliation
    /// catches the leftover cluster.
    pub async fn expire_run(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<RunRecord, EngineError> {
        let job_id = self.load_run(run_id).await?.job_id;
        let lease = self.leases.acquire(job_lease_key(job_id)).await?;
        let result = self.expire_reloaded(job_id, run_id, now).await;
        self.leases.release(lease).await;
        result
    }

    async fn expire_reloaded(
        &self,
        job_id: Uuid,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<RunRecord, EngineError> {
        let mut job = self.load_job(job_id).await?;
        let run = self.load_run(run_id).await?;
        self.expire_locked(&mut job, run, now).await
    }

    async fn expire_locked(
        &self,
        job: &mut ScheduledJob,
        run: RunRecord,
        now: DateTime<Utc>,
    ) -> Result<RunRecord, EngineError> {
        if !run.is_active() {
            return Ok(run);
        }
        self.stop_cluster(&run, now, "timeout").await;
        warn!(
            job_id = %job.id,
            run_id = %run.id,
            timeout_hours = job.timeout.as_hours(),
            "Run timed out"
        );
        let reason = format!("Run exceeded its {}h timeout", job.timeout.as_hours());
        self.complete_locked(job, run, RunOutcome::TimedOut, Some(reason), now)
            .await
    }

    /// Fold the state of the run's cluster into the run, then enforce the timeout.
    pub async fn sync_run(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<RunRecord, EngineError> {
        let job_id = self.load_run(run_id).await?.job_id;
        let lease = self.leases.acquire(job_lease_key(job_id)).await?;
        let result = self.sync_reloaded(job_id, run_id, now).await;
        self.leases.release(lease).await;
        result
    }

    async fn sync_reloaded(
        &self,
        job_id: Uuid,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<RunRecord, EngineError> {
        let mut job = self.load_job(job_id).await?;
        let run = self.load_run(run_id).await?;
        self.sync_locked(&mut job, run, now).await
    }

    async fn sync_locked(
        &self,
        job: &mut ScheduledJob,
        mut run: RunRecord,
        now: DateTime<Utc>,
    ) -> Result<RunRecord, EngineError> {
        if !run.is_active() {
            return Ok(run);
        }

        if let Some(cluster_id) = run.cluster_id {
            let cluster = self.lifecycle.load(cluster_id).await?;
            let finished = match cluster.state {
                ClusterState::Terminated => Some(RunOutcome::Succeeded),
                ClusterState::Failed => Some(RunOutcome::Failed),
                _ => None,
            };
            if let Some(outcome) = finished {
                let reason = cluster.state_change_reason.clone();
                return self.complete_locked(job, run, outcome, reason, now).await;
            }
            if cluster.state.is_alive() && run.activate() {
                self.store.save_run(&run).await?;
                info!(run_id = %run.id, cluster_id = %cluster.id, "Run active");
            }
        }

        match check_timeout(&run, job, now) {
            TimeoutCheck::Expire => self.expire_locked(job, run, now).await,
            TimeoutCheck::Continue => Ok(run),
        }
    }

    /// Logically delete a job. An in-flight run is stopped and recorded as
    /// terminated by the user, and the identifier becomes available again.
    pub async fn delete_job(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<ScheduledJob, EngineError> {
        let lease = self.leases.acquire(job_lease_key(job_id)).await?;
        let result = self.delete_locked(job_id, now).await;
        self.leases.release(lease).await;
        result
    }

    async fn delete_locked(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<ScheduledJob, EngineError> {
        let mut job = self.load_job(job_id).await?;
        if job.is_deleted() {
            return Ok(job);
        }

        if let Some(run_id) = job.active_run_id {
            let run = self.load_run(run_id).await?;
            self.stop_cluster(&run, now, "job deletion").await;
            self.complete_locked(
                &mut job,
                run,
                RunOutcome::TerminatedByUser,
                Some("Job deleted".into()),
                now,
            )
            .await?;
        }

        job.deleted_at = Some(now);
        job.enabled = false;
        self.store.save_job(&job).await?;
        self.store.release(Scope::Jobs, &job.identifier, job.id).await?;
        info!(job_id = %job.id, identifier = %job.identifier, "Job deleted");
        Ok(job)
    }

    /// Active runs, for the driver.
    pub async fn active_runs(&self) -> Result<Vec<RunRecord>, EngineError> {
        Ok(self.store.list_runs(&RunFilter::active()).await?)
    }

    async fn stop_cluster(&self, run: &RunRecord, now: DateTime<Utc>, cause: &str) {
        let Some(cluster_id) = run.cluster_id else {
            return;
        };
        if let Err(e) = self.lifecycle.terminate(cluster_id, now).await {
            warn!(
                run_id = %run.id,
                cluster_id = %cluster_id,
                cause,
                error = %e,
                "Failed to terminate run cluster; reconciliation will pick it up"
            );
        }
    }

    async fn load_job(&self, job_id: Uuid) -> Result<ScheduledJob, EngineError> {
        self.store
            .load_job(job_id)
            .await?
            .ok_or_else(|| EngineError::not_found("job", job_id))
    }

    async fn load_run(&self, run_id: Uuid) -> Result<RunRecord, EngineError> {
        self.store
            .load_run(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found("run", run_id))
    }
}
