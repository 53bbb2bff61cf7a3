use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use atmo_core::{ClusterState, ObservedState, RunInterval, RunStatus, ScheduledJob};
use atmo_engine::{is_due, EngineError};
use atmo_provisioner::ControlPlaneError;
use atmo_store::{job_lease_key, ClusterFilter, Leases, RunFilter, Store};

use crate::helpers::{harness, job_spec, t0, Harness};

async fn create_job(h: &Harness, identifier: &str, interval: RunInterval) -> ScheduledJob {
    h.atmo
        .create_scheduled_job(job_spec(identifier, interval, 2))
        .await
        .unwrap()
}

async fn reload(h: &Harness, job: &ScheduledJob) -> ScheduledJob {
    h.store.load_job(job.id).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_daily_job_times_out_and_is_due_again_next_day() {
    let h = harness();
    let scheduler = h.atmo.scheduler();
    let lifecycle = h.atmo.lifecycle();
    let job = create_job(&h, "nightly", RunInterval::Daily).await;

    assert!(!is_due(&job, t0() - Duration::minutes(1)));
    assert!(is_due(&job, t0()));

    let run = scheduler.start_run(job.id, t0()).await.unwrap();
    assert_eq!(run.status, RunStatus::PendingCluster);
    assert_eq!(run.started_at, t0());
    let cluster_id = run.cluster_id.unwrap();

    let job_now = reload(&h, &job).await;
    assert_eq!(job_now.active_run_id, Some(run.id));
    assert!(!is_due(&job_now, t0() + Duration::days(2)));

    // The run cluster launches the notebook and shuts down afterwards.
    let launches = h.control_plane.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].identifier, "nightly");
    assert_eq!(launches[0].log_dir, "jobs");
    assert!(!launches[0].keep_alive);

    // T0+1h: cluster is up, the run continues.
    lifecycle
        .refresh(cluster_id, t0() + Duration::hours(1))
        .await
        .unwrap();
    let run = scheduler
        .sync_run(run.id, t0() + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Active);
    assert!(h.control_plane.terminate_calls().is_empty());

    // T0+3h: past the 2h timeout.
    let run = scheduler
        .sync_run(run.id, t0() + Duration::hours(3))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::TimedOut);
    assert_eq!(run.finished_at, Some(t0() + Duration::hours(3)));
    assert_eq!(h.control_plane.terminate_calls().len(), 1);
    assert_eq!(
        lifecycle.load(cluster_id).await.unwrap().state,
        ClusterState::Terminating
    );

    let job_now = reload(&h, &job).await;
    assert_eq!(job_now.last_run_at, Some(t0()));
    assert_eq!(job_now.active_run_id, None);
    assert!(job_now.enabled);
    assert!(!is_due(&job_now, t0() + Duration::hours(23)));
    assert!(is_due(&job_now, t0() + Duration::hours(24)));

    let next = scheduler
        .start_run(job.id, t0() + Duration::hours(24))
        .await
        .unwrap();
    assert_eq!(next.started_at, t0() + Duration::hours(24));
}

#[tokio::test]
async fn test_start_run_refuses_job_that_is_not_due() {
    let h = harness();
    let scheduler = h.atmo.scheduler();
    let job = create_job(&h, "nightly", RunInterval::Daily).await;

    let err = scheduler
        .start_run(job.id, t0() - Duration::hours(1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotDue(id) if id == job.id));

    scheduler.start_run(job.id, t0()).await.unwrap();
    let err = scheduler
        .start_run(job.id, t0() + Duration::minutes(5))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotDue(_)));
    assert_eq!(h.control_plane.launches().len(), 1);
}

#[tokio::test]
async fn test_once_job_runs_a_single_time() {
    let h = harness();
    let scheduler = h.atmo.scheduler();
    let lifecycle = h.atmo.lifecycle();
    let job = create_job(&h, "backfill", RunInterval::Once).await;

    let run = scheduler.start_run(job.id, t0()).await.unwrap();
    let jobflow_id = lifecycle
        .load(run.cluster_id.unwrap())
        .await
        .unwrap()
        .jobflow_id
        .unwrap();

    // The notebook finished and the cluster shut itself down.
    h.control_plane
        .set_state(&jobflow_id, ObservedState::Terminated);
    h.control_plane
        .set_reason(&jobflow_id, "Steps completed");
    lifecycle
        .refresh(run.cluster_id.unwrap(), t0() + Duration::minutes(40))
        .await
        .unwrap();
    let run = scheduler
        .sync_run(run.id, t0() + Duration::minutes(40))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.reason.as_deref(), Some("Steps completed"));

    let job_now = reload(&h, &job).await;
    assert!(!job_now.enabled);
    assert_eq!(job_now.last_run_at, Some(t0()));
    assert!(!is_due(&job_now, t0() + Duration::days(365)));
    assert!(matches!(
        scheduler.start_run(job.id, t0() + Duration::days(1)).await,
        Err(EngineError::NotDue(_))
    ));
}

#[tokio::test]
async fn test_failed_run_cluster_fails_the_run() {
    let h = harness();
    let scheduler = h.atmo.scheduler();
    let lifecycle = h.atmo.lifecycle();
    let job = create_job(&h, "nightly", RunInterval::Daily).await;

    let run = scheduler.start_run(job.id, t0()).await.unwrap();
    let cluster_id = run.cluster_id.unwrap();
    let jobflow_id = lifecycle.load(cluster_id).await.unwrap().jobflow_id.unwrap();
    h.control_plane.set_state(&jobflow_id, ObservedState::Failed);
    h.control_plane
        .set_reason(&jobflow_id, "Step failed: RunNotebookStep");
    lifecycle.refresh(cluster_id, t0()).await.unwrap();

    let run = scheduler
        .sync_run(run.id, t0() + Duration::minutes(30))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let job_now = reload(&h, &job).await;
    assert_eq!(job_now.active_run_id, None);
    assert_eq!(job_now.last_run_at, Some(t0()));
}

#[tokio::test]
async fn test_permanent_launch_rejection_fails_run() {
    let h = harness();
    let scheduler = h.atmo.scheduler();
    let job = create_job(&h, "nightly", RunInterval::Daily).await;
    h.control_plane.fail_next_launch(ControlPlaneError::Rejected {
        retryable: false,
        reason: "ValidationException: instance type not supported".into(),
    });

    let run = scheduler.start_run(job.id, t0()).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.finished_at.is_some());
    let job_now = reload(&h, &job).await;
    assert_eq!(job_now.active_run_id, None);
    assert_eq!(job_now.last_run_at, Some(t0()));
    assert!(is_due(&job_now, t0() + Duration::hours(24)));
}

#[tokio::test]
async fn test_retryable_launch_failure_keeps_run_pending() {
    let h = harness();
    let scheduler = h.atmo.scheduler();
    let lifecycle = h.atmo.lifecycle();
    let job = create_job(&h, "nightly", RunInterval::Daily).await;
    h.control_plane
        .fail_next_launch(ControlPlaneError::Unavailable("throttled".into()));

    let run = scheduler.start_run(job.id, t0()).await.unwrap();

    assert_eq!(run.status, RunStatus::PendingCluster);
    let cluster_id = run.cluster_id.unwrap();
    assert_eq!(
        lifecycle.load(cluster_id).await.unwrap().state,
        ClusterState::Requested
    );

    let submitted = lifecycle.submit(cluster_id, t0()).await.unwrap();
    assert_eq!(submitted.state, ClusterState::ProvisionSubmitted);
}

#[tokio::test]
async fn test_run_clusters_do_not_reserve_cluster_identifiers() {
    let h = harness();
    let job = create_job(&h, "shared-name", RunInterval::Daily).await;
    h.atmo.scheduler().start_run(job.id, t0()).await.unwrap();

    // A user cluster may use the same name as a job.
    let cluster = h
        .atmo
        .lifecycle()
        .request_cluster(crate::helpers::cluster_spec("shared-name"), t0())
        .await
        .unwrap();
    assert_eq!(cluster.state, ClusterState::ProvisionSubmitted);

    let clusters = h.store.list_clusters(&ClusterFilter::all()).await.unwrap();
    assert_eq!(clusters.len(), 2);
}

#[tokio::test]
async fn test_timeout_survives_terminate_failure() {
    let h = harness();
    let scheduler = h.atmo.scheduler();
    let job = create_job(&h, "nightly", RunInterval::Daily).await;
    let run = scheduler.start_run(job.id, t0()).await.unwrap();
    h.control_plane
        .fail_next_terminate(ControlPlaneError::Unavailable("connection reset".into()));

    let run = scheduler
        .expire_run(run.id, t0() + Duration::hours(2))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::TimedOut);
    assert!(h.control_plane.terminate_calls().is_empty());
    assert_eq!(reload(&h, &job).await.active_run_id, None);
}

#[tokio::test]
async fn test_completing_a_finished_run_keeps_first_outcome() {
    let h = harness();
    let scheduler = h.atmo.scheduler();
    let job = create_job(&h, "nightly", RunInterval::Daily).await;
    let run = scheduler.start_run(job.id, t0()).await.unwrap();

    let run = scheduler
        .expire_run(run.id, t0() + Duration::hours(2))
        .await
        .unwrap();
    let again = scheduler
        .complete_run(
            run.id,
            atmo_core::RunOutcome::Succeeded,
            None,
            t0() + Duration::hours(3),
        )
        .await
        .unwrap();

    assert_eq!(again.status, RunStatus::TimedOut);
    assert_eq!(again.finished_at, run.finished_at);
}

#[tokio::test]
async fn test_start_run_skips_job_leased_elsewhere() {
    let h = harness();
    let job = create_job(&h, "nightly", RunInterval::Daily).await;
    h.store
        .acquire_lease(
            &job_lease_key(job.id),
            "other-worker",
            StdDuration::from_secs(60),
            Utc::now(),
        )
        .await
        .unwrap()
        .unwrap();

    let err = h.atmo.scheduler().start_run(job.id, t0()).await.unwrap_err();

    assert!(matches!(err, EngineError::LeaseUnavailable(_)));
    assert!(h
        .store
        .list_runs(&RunFilter::for_job(job.id))
        .await
        .unwrap()
        .is_empty());
    assert!(h.control_plane.launches().is_empty());
    assert_eq!(reload(&h, &job).await.active_run_id, None);
}

#[tokio::test]
async fn test_overlapping_starts_create_one_run() {
    let h = harness();
    let job = create_job(&h, "nightly", RunInterval::Daily).await;
    h.control_plane.hold_launches();
    let first = tokio::spawn({
        let atmo = h.atmo.clone();
        let job_id = job.id;
        async move { atmo.scheduler().start_run(job_id, t0()).await }
    });
    while h.control_plane.parked_launches() == 0 {
        tokio::task::yield_now().await;
    }

    let err = h.atmo.scheduler().start_run(job.id, t0()).await.unwrap_err();
    assert!(matches!(err, EngineError::LeaseUnavailable(_)));

    h.control_plane.release_launches();
    let run = first.await.unwrap().unwrap();

    let runs = h.store.list_runs(&RunFilter::for_job(job.id)).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, run.id);
    assert_eq!(h.control_plane.launches().len(), 1);
    assert_eq!(reload(&h, &job).await.active_run_id, Some(run.id));
}

#[tokio::test]
async fn test_concurrent_starts_have_one_winner() {
    let h = harness();
    let job = create_job(&h, "nightly", RunInterval::Daily).await;
    let scheduler = h.atmo.scheduler();

    let (a, b) = tokio::join!(
        scheduler.start_run(job.id, t0()),
        scheduler.start_run(job.id, t0())
    );

    let started: Vec<_> = [a, b].into_iter().filter_map(Result::ok).collect();
    assert_eq!(started.len(), 1);
    let runs = h.store.list_runs(&RunFilter::for_job(job.id)).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, started[0].id);
    assert_eq!(h.control_plane.launches().len(), 1);
}
