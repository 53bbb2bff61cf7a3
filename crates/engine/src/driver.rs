//! Periodic driver: one pass over every cluster, run and job per tick.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use atmo_core::ClusterState;
use atmo_store::ClusterFilter;

use crate::error::EngineError;
use crate::lifecycle::{ReconcileReport, ReconcileWindow};
use crate::service::Atmo;

/// What a single tick did. Entities skipped because another worker held
/// their lease are counted in `skipped`.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub resubmitted: usize,
    pub refreshed: usize,
    pub runs_synced: usize,
    pub runs_started: usize,
    pub stalled: usize,
    pub skipped: usize,
    pub errors: usize,
    pub reconcile: Option<ReconcileReport>,
}

impl TickReport {
    fn record<T>(&mut self, step: &'static str, result: Result<T, EngineError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(EngineError::LeaseUnavailable(key)) => {
                debug!(step, key = %key, "Lease held elsewhere, skipping");
                self.skipped += 1;
                None
            }
            Err(EngineError::NotDue(job_id)) => {
                debug!(step, job_id = %job_id, "Job no longer due, skipping");
                self.skipped += 1;
                None
            }
            Err(e) if e.is_retryable() => {
                warn!(step, error = %e, "Retryable failure, will retry next tick");
                self.errors += 1;
                None
            }
            Err(e) => {
                error!(step, error = %e, "Driver step failed");
                self.errors += 1;
                None
            }
        }
    }
}

pub struct Driver {
    atmo: Arc<Atmo>,
    ticks: u64,
}

impl Driver {
    pub fn new(atmo: Arc<Atmo>) -> Self {
        Self { atmo, ticks: 0 }
    }

    /// One full pass. Failures on one entity never stop the pass.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let lifecycle = self.atmo.lifecycle().clone();
        let scheduler = self.atmo.scheduler().clone();
        let store = self.atmo.store().clone();

        // Clusters whose launch was deferred by a retryable failure.
        let requested = store
            .list_clusters(&ClusterFilter::in_state(ClusterState::Requested))
            .await
            .map_err(EngineError::from);
        for cluster in report.record("list requested", requested).unwrap_or_default() {
            if report
                .record("resubmit", lifecycle.submit(cluster.id, now).await)
                .is_some()
            {
                report.resubmitted += 1;
            }
        }

        let active = store
            .list_clusters(&ClusterFilter::active())
            .await
            .map_err(EngineError::from);
        for cluster in report.record("list active", active).unwrap_or_default() {
            if cluster.jobflow_id.is_none() {
                continue;
            }
            if report
                .record("refresh", lifecycle.refresh(cluster.id, now).await)
                .is_some()
            {
                report.refreshed += 1;
            }
        }

        let runs = scheduler.active_runs().await;
        for run in report.record("list runs", runs).unwrap_or_default() {
            if report
                .record("sync run", scheduler.sync_run(run.id, now).await)
                .is_some()
            {
                report.runs_synced += 1;
            }
        }

        let due = scheduler.due_jobs(now).await;
        for job in report.record("due jobs", due).unwrap_or_default() {
            if report
                .record("start run", scheduler.start_run(job.id, now).await)
                .is_some()
            {
                report.runs_started += 1;
            }
        }

        let stalled = lifecycle.stalled(now).await;
        report.stalled = report
            .record("stalled", stalled)
            .map(|s| s.len())
            .unwrap_or_default();

        let every = u64::from(self.atmo.config().scheduler.reconcile_every_ticks.max(1));
        if self.ticks % every == 0 {
            let window = self.reconcile_window(now);
            report.reconcile = report.record("reconcile", lifecycle.reconcile(window, now).await);
        }
        self.ticks += 1;

        info!(
            tick = self.ticks,
            resubmitted = report.resubmitted,
            refreshed = report.refreshed,
            runs_synced = report.runs_synced,
            runs_started = report.runs_started,
            stalled = report.stalled,
            skipped = report.skipped,
            errors = report.errors,
            "Tick complete"
        );
        report
    }

    fn reconcile_window(&self, now: DateTime<Utc>) -> ReconcileWindow {
        let cfg = &self.atmo.config().scheduler;
        ReconcileWindow::new(
            now,
            Duration::hours(i64::from(cfg.reconcile_lookback_hours)),
            Duration::minutes(i64::from(cfg.reconcile_settle_minutes)),
        )
    }

    /// Tick on the configured interval until `shutdown` resolves.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let period = self.atmo.config().scheduler.tick_interval();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            holder = %self.atmo.holder(),
            backend = self.atmo.lifecycle().control_plane_name(),
            tick_secs = period.as_secs(),
            "Driver started"
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
                _ = &mut shutdown => {
                    info!("Shutdown requested, driver stopping");
                    break;
                }
            }
        }
    }
}
