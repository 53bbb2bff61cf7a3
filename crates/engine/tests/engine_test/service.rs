use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Duration;

use atmo_core::{ClusterState, Identifier, ObservedState, RunInterval, RunStatus, Scope};
use atmo_engine::EngineError;
use atmo_provisioner::{ControlPlaneError, FakeControlPlane, MemoryNotebookStore};
use atmo_store::{ClusterFilter, MemoryStore, Store};

use crate::helpers::{cluster_spec, engine, harness, job_spec, t0, test_config, FailingStore};

#[tokio::test]
async fn test_request_cluster_retries_through_throttling() {
    let h = harness();
    h.control_plane.fail_next_launch(ControlPlaneError::Rejected {
        retryable: true,
        reason: "ThrottlingException: Rate exceeded".into(),
    });

    let cluster = h.atmo.request_cluster(cluster_spec("scratch")).await.unwrap();

    assert_eq!(cluster.state, ClusterState::ProvisionSubmitted);
    assert_eq!(h.control_plane.launches().len(), 1);
}

#[tokio::test]
async fn test_request_cluster_gives_up_and_leaves_it_requested() {
    let h = harness();
    for _ in 0..3 {
        h.control_plane
            .fail_next_launch(ControlPlaneError::Unavailable("connection reset".into()));
    }

    let err = h
        .atmo
        .request_cluster(cluster_spec("scratch"))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::ControlPlaneUnavailable(_)));
    let pending = h
        .store
        .list_clusters(&ClusterFilter::in_state(ClusterState::Requested))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    // Still reserved while the driver keeps trying.
    assert!(h
        .atmo
        .is_identifier_taken("scratch", Scope::Clusters)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_terminate_cluster_requires_matching_confirmation() {
    let h = harness();
    let cluster = h.atmo.request_cluster(cluster_spec("scratch")).await.unwrap();

    let err = h
        .atmo
        .terminate_cluster(cluster.id, "Scratch")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ConfirmationMismatch(_)));
    assert!(h.control_plane.terminate_calls().is_empty());

    let terminating = h
        .atmo
        .terminate_cluster(cluster.id, "scratch")
        .await
        .unwrap();
    assert_eq!(terminating.state, ClusterState::Terminating);
}

#[tokio::test]
async fn test_terminate_unknown_cluster_is_not_found() {
    let h = harness();

    let err = h
        .atmo
        .terminate_cluster(uuid::Uuid::new_v4(), "scratch")
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::NotFound { kind: "cluster", .. }));
}

#[tokio::test]
async fn test_identifier_lookup_per_scope() {
    let h = harness();
    h.atmo.request_cluster(cluster_spec("shared")).await.unwrap();

    assert!(h
        .atmo
        .is_identifier_taken("shared", Scope::Clusters)
        .await
        .unwrap());
    assert!(!h
        .atmo
        .is_identifier_taken("shared", Scope::Jobs)
        .await
        .unwrap());
    assert!(!h
        .atmo
        .is_identifier_taken("unused", Scope::Clusters)
        .await
        .unwrap());
    assert!(matches!(
        h.atmo.is_identifier_taken("has space", Scope::Clusters).await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn test_create_job_rejects_duplicates_and_bad_windows() {
    let h = harness();
    h.atmo
        .create_scheduled_job(job_spec("nightly", RunInterval::Daily, 2))
        .await
        .unwrap();

    let err = h
        .atmo
        .create_scheduled_job(job_spec("nightly", RunInterval::Weekly, 4))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::IdentifierConflict {
            scope: Scope::Jobs,
            ..
        }
    ));

    let mut spec = job_spec("backwards", RunInterval::Daily, 2);
    spec.end_date = Some(spec.start_date - Duration::days(1));
    let err = h.atmo.create_scheduled_job(spec).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(!h
        .atmo
        .is_identifier_taken("backwards", Scope::Jobs)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_upload_notebook_stores_under_job_prefix() {
    let h = harness();
    let identifier = Identifier::parse("nightly").unwrap();

    let notebook = h
        .atmo
        .upload_notebook(&identifier, "report.ipynb", b"{\"cells\": []}".to_vec())
        .await
        .unwrap();

    assert_eq!(notebook.key, "jobs/nightly/report.ipynb");
    assert_eq!(h.notebooks.get(&notebook).unwrap(), b"{\"cells\": []}".to_vec());

    let err = h
        .atmo
        .upload_notebook(&identifier, "../escape.ipynb", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Notebook(_)));
}

#[tokio::test]
async fn test_delete_job_stops_active_run_and_frees_identifier() {
    let h = harness();
    let identifier = Identifier::parse("nightly").unwrap();
    let notebook = h
        .atmo
        .upload_notebook(&identifier, "report.ipynb", b"{}".to_vec())
        .await
        .unwrap();
    let mut spec = job_spec("nightly", RunInterval::Daily, 2);
    spec.notebook = notebook.clone();
    let job = h.atmo.create_scheduled_job(spec).await.unwrap();
    let run = h.atmo.scheduler().start_run(job.id, t0()).await.unwrap();

    let err = h
        .atmo
        .delete_scheduled_job(job.id, "nightly-2")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ConfirmationMismatch(_)));

    let deleted = h.atmo.delete_scheduled_job(job.id, "nightly").await.unwrap();
    assert!(deleted.is_deleted());
    assert!(!deleted.enabled);
    assert_eq!(deleted.active_run_id, None);

    let run = h.store.load_run(run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::UserTerminated);
    assert_eq!(h.control_plane.terminate_calls().len(), 1);
    assert!(h.notebooks.get(&notebook).is_none());
    assert!(!h
        .atmo
        .is_identifier_taken("nightly", Scope::Jobs)
        .await
        .unwrap());

    // The name can be used for a new job straight away.
    h.atmo
        .create_scheduled_job(job_spec("nightly", RunInterval::Daily, 2))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_terminate_during_inflight_launch_is_excluded() {
    let h = harness();
    h.control_plane.hold_launches();
    let launching = tokio::spawn({
        let atmo = h.atmo.clone();
        async move { atmo.request_cluster(cluster_spec("foo")).await }
    });
    while h.control_plane.parked_launches() == 0 {
        tokio::task::yield_now().await;
    }
    let cluster_id = h.store.list_clusters(&ClusterFilter::all()).await.unwrap()[0].id;

    // Same engine, same worker name: the launch still holds the cluster.
    let err = h
        .atmo
        .terminate_cluster(cluster_id, "foo")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LeaseUnavailable(_)));
    assert!(h.control_plane.terminate_calls().is_empty());
    assert!(h
        .atmo
        .is_identifier_taken("foo", Scope::Clusters)
        .await
        .unwrap());

    h.control_plane.release_launches();
    let launched = launching.await.unwrap().unwrap();
    assert_eq!(launched.state, ClusterState::ProvisionSubmitted);

    let terminating = h.atmo.terminate_cluster(cluster_id, "foo").await.unwrap();
    assert_eq!(terminating.state, ClusterState::Terminating);
    assert_eq!(terminating.jobflow_id, launched.jobflow_id);
    let stored = h.store.load_cluster(cluster_id).await.unwrap().unwrap();
    assert_eq!(stored.state, ClusterState::Terminating);
}

#[tokio::test]
async fn test_failed_job_save_rolls_back_reservation() {
    let store = Arc::new(FailingStore::default());
    let atmo = engine(
        test_config(),
        store.clone(),
        Arc::new(FakeControlPlane::new()),
        Arc::new(MemoryNotebookStore::new("code")),
    );
    store.fail_saves.store(true, Ordering::SeqCst);

    let err = atmo
        .create_scheduled_job(job_spec("nightly", RunInterval::Daily, 2))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Store(_)));
    assert_eq!(store.release_attempts.load(Ordering::SeqCst), 1);
    assert!(!atmo.is_identifier_taken("nightly", Scope::Jobs).await.unwrap());
}

#[tokio::test]
async fn test_failed_rollback_still_reports_the_save_error() {
    let store = Arc::new(FailingStore::default());
    let control_plane = Arc::new(FakeControlPlane::new());
    let atmo = engine(
        test_config(),
        store.clone(),
        control_plane.clone(),
        Arc::new(MemoryNotebookStore::new("code")),
    );
    store.fail_saves.store(true, Ordering::SeqCst);
    store.fail_releases.store(true, Ordering::SeqCst);

    let err = atmo
        .create_scheduled_job(job_spec("nightly", RunInterval::Daily, 2))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("save job failed"), "{err}");

    let err = atmo
        .request_cluster(cluster_spec("scratch"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("save cluster failed"), "{err}");

    assert_eq!(store.release_attempts.load(Ordering::SeqCst), 2);
    assert!(control_plane.launches().is_empty());
    // The reservations outlive the failed rollback; the error log is the trail.
    assert!(atmo.is_identifier_taken("nightly", Scope::Jobs).await.unwrap());
    assert!(atmo
        .is_identifier_taken("scratch", Scope::Clusters)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_launch_outliving_its_lease_does_not_overwrite_termination() {
    let mut config = test_config();
    config.limits.lease_ttl_secs = 0;
    let store = Arc::new(MemoryStore::new());
    let control_plane = Arc::new(FakeControlPlane::new());
    let atmo = engine(
        config,
        store.clone(),
        control_plane.clone(),
        Arc::new(MemoryNotebookStore::new("code")),
    );
    control_plane.hold_launches();
    let launching = tokio::spawn({
        let atmo = atmo.clone();
        async move { atmo.request_cluster(cluster_spec("foo")).await }
    });
    while control_plane.parked_launches() == 0 {
        tokio::task::yield_now().await;
    }
    let cluster_id = store.list_clusters(&ClusterFilter::all()).await.unwrap()[0].id;

    // The launch's lease has already expired, so termination gets through.
    let terminated = atmo.terminate_cluster(cluster_id, "foo").await.unwrap();
    assert_eq!(terminated.state, ClusterState::Terminated);

    control_plane.release_launches();
    let after_launch = launching.await.unwrap().unwrap();

    assert_eq!(after_launch.state, ClusterState::Terminated);
    assert_eq!(after_launch.jobflow_id, None);
    let stored = store.load_cluster(cluster_id).await.unwrap().unwrap();
    assert_eq!(stored.state, ClusterState::Terminated);
    // The job flow created meanwhile is shut down again.
    let launched = control_plane.terminate_calls();
    assert_eq!(launched.len(), 1);
    assert_eq!(
        control_plane.state_of(&launched[0]),
        Some(ObservedState::Terminated)
    );
}
