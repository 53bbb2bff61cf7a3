//! Entry points for the presentation layer.
//!
//! `Atmo` owns the lifecycle manager and scheduler, wraps the calls the
//! dashboard makes in the retry policy, and checks typed confirmations before
//! anything destructive happens.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use atmo_core::{
    Cluster, ClusterSpec, Config, Identifier, JobSpec, NotebookRef, ScheduledJob, Scope,
};
use atmo_provisioner::{ControlPlane, LaunchPlanner, NotebookStore};
use atmo_store::Persistence;

use crate::error::EngineError;
use crate::lifecycle::LifecycleManager;
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;

pub struct Atmo {
    config: Config,
    store: Arc<dyn Persistence>,
    notebooks: Arc<dyn NotebookStore>,
    lifecycle: Arc<LifecycleManager>,
    scheduler: Arc<Scheduler>,
    retry: RetryPolicy,
    holder: String,
}

impl Atmo {
    /// Wire the engine together. `holder` names this process in lease records.
    pub fn new(
        config: Config,
        store: Arc<dyn Persistence>,
        control_plane: Arc<dyn ControlPlane>,
        notebooks: Arc<dyn NotebookStore>,
    ) -> Self {
        let holder = format!("{}-{}", control_plane.name(), Uuid::new_v4().simple());
        let planner = LaunchPlanner::new(config.emr.clone(), config.aws.region.clone());
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            control_plane,
            notebooks.clone(),
            planner,
            config.limits.clone(),
            holder.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            lifecycle.clone(),
            holder.clone(),
        ));
        let retry = RetryPolicy::new(config.retry.clone());

        Self {
            config,
            store,
            notebooks,
            lifecycle,
            scheduler,
            retry,
            holder,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    /// Lease holder name of this process.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Reserve the identifier, persist the cluster and launch it, retrying
    /// retryable launch failures with backoff.
    ///
    /// If the retries run out the cluster stays `REQUESTED` and the driver
    /// keeps resubmitting it; the last error is still returned.
    pub async fn request_cluster(&self, spec: ClusterSpec) -> Result<Cluster, EngineError> {
        let cluster = self.lifecycle.create(spec, Utc::now()).await?;
        let id = cluster.id;
        self.retry
            .run("launch", || self.lifecycle.submit(id, Utc::now()))
            .await
    }

    /// Terminate a cluster once the user has typed its identifier back.
    pub async fn terminate_cluster(
        &self,
        cluster_id: Uuid,
        confirmation: &str,
    ) -> Result<Cluster, EngineError> {
        let cluster = self.lifecycle.load(cluster_id).await?;
        if !cluster.identifier.confirms(confirmation) {
            return Err(EngineError::ConfirmationMismatch(cluster.identifier));
        }
        self.retry
            .run("terminate", || self.lifecycle.terminate(cluster_id, Utc::now()))
            .await
    }

    /// Upload a notebook for a job that is about to be created.
    pub async fn upload_notebook(
        &self,
        job: &Identifier,
        file_name: &str,
        body: Vec<u8>,
    ) -> Result<NotebookRef, EngineError> {
        let notebook = self.notebooks.put(job, file_name, body).await?;
        info!(identifier = %job, key = %notebook.key, "Notebook uploaded");
        Ok(notebook)
    }

    /// Validate the spec, reserve the identifier in the job scope and persist
    /// an enabled job. The driver picks it up once it is due.
    pub async fn create_scheduled_job(&self, spec: JobSpec) -> Result<ScheduledJob, EngineError> {
        spec.validate(self.config.limits.max_cluster_size)?;
        let job = ScheduledJob::new(spec, Utc::now());

        if !self
            .store
            .reserve(Scope::Jobs, &job.identifier, job.id)
            .await?
        {
            info!(identifier = %job.identifier, "Job identifier already taken");
            return Err(EngineError::IdentifierConflict {
                scope: Scope::Jobs,
                identifier: job.identifier,
            });
        }

        if let Err(e) = self.store.save_job(&job).await {
            if let Err(release_err) = self.store.release(Scope::Jobs, &job.identifier, job.id).await {
                error!(
                    job_id = %job.id,
                    identifier = %job.identifier,
                    error = %release_err,
                    "Failed to roll back identifier reservation"
                );
            }
            return Err(e.into());
        }

        info!(
            job_id = %job.id,
            identifier = %job.identifier,
            interval = ?job.interval,
            timeout_hours = job.timeout.as_hours(),
            start = %job.start_date,
            "Scheduled job created"
        );
        Ok(job)
    }

    /// Delete a job once the user has typed its identifier back. A running
    /// run is stopped, and the notebook is removed on a best-effort basis.
    pub async fn delete_scheduled_job(
        &self,
        job_id: Uuid,
        confirmation: &str,
    ) -> Result<ScheduledJob, EngineError> {
        let job = self
            .store
            .load_job(job_id)
            .await?
            .ok_or_else(|| EngineError::not_found("job", job_id))?;
        if !job.identifier.confirms(confirmation) {
            return Err(EngineError::ConfirmationMismatch(job.identifier));
        }

        let job = self
            .retry
            .run("delete job", || self.scheduler.delete_job(job_id, Utc::now()))
            .await?;

        if let Err(e) = self.notebooks.delete(&job.notebook).await {
            warn!(job_id = %job.id, key = %job.notebook.key, error = %e, "Failed to delete notebook");
        }
        Ok(job)
    }

    /// Whether `identifier` is reserved in `scope`. Malformed identifiers are
    /// a validation error rather than "not taken".
    pub async fn is_identifier_taken(
        &self,
        identifier: &str,
        scope: Scope,
    ) -> Result<bool, EngineError> {
        let identifier = Identifier::parse(identifier)?;
        Ok(self.store.is_taken(scope, &identifier).await?)
    }
}
