use chrono::{Duration, Utc};

use atmo_core::{ClusterState, ObservedState, Scope};
use atmo_engine::{EngineError, ReconcileWindow};
use atmo_provisioner::ControlPlaneError;
use atmo_store::{ClusterFilter, IdentifierRegistry, Store};

use crate::helpers::{cluster_spec, harness, t0};

#[tokio::test]
async fn test_request_cluster_submits_launch() {
    let h = harness();
    let lifecycle = h.atmo.lifecycle();

    let cluster = lifecycle
        .request_cluster(cluster_spec("scratch"), t0())
        .await
        .unwrap();

    assert_eq!(cluster.state, ClusterState::ProvisionSubmitted);
    let jobflow_id = cluster.jobflow_id.clone().unwrap();
    assert_eq!(
        h.control_plane.state_of(&jobflow_id),
        Some(ObservedState::Bootstrapping)
    );

    let launches = h.control_plane.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].identifier, "scratch");
    assert_eq!(launches[0].size, 3);
    assert_eq!(launches[0].log_dir, "clusters");
    assert!(launches[0].keep_alive);

    assert!(h
        .store
        .is_taken(Scope::Clusters, &cluster.identifier)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_second_request_for_same_identifier_conflicts() {
    let h = harness();
    let lifecycle = h.atmo.lifecycle();

    lifecycle
        .request_cluster(cluster_spec("foo"), t0())
        .await
        .unwrap();
    let err = lifecycle
        .request_cluster(cluster_spec("foo"), t0())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::IdentifierConflict {
            scope: Scope::Clusters,
            ..
        }
    ));
    assert_eq!(h.control_plane.launches().len(), 1);
}

#[tokio::test]
async fn test_oversized_request_is_a_validation_error() {
    let h = harness();
    let mut spec = cluster_spec("huge");
    spec.size = 31;

    let err = h
        .atmo
        .lifecycle()
        .request_cluster(spec, t0())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Validation(_)));
    assert!(h.control_plane.launches().is_empty());
    assert!(h
        .store
        .list_clusters(&ClusterFilter::all())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_permanent_rejection_fails_cluster_and_frees_identifier() {
    let h = harness();
    let lifecycle = h.atmo.lifecycle();
    h.control_plane.fail_next_launch(ControlPlaneError::Rejected {
        retryable: false,
        reason: "ValidationException: unknown release label".into(),
    });

    let err = lifecycle
        .request_cluster(cluster_spec("scratch"), t0())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::ProvisioningRejected {
            retryable: false,
            ..
        }
    ));

    let stored = h.store.list_clusters(&ClusterFilter::all()).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].state, ClusterState::Failed);
    assert_eq!(
        stored[0].state_change_reason.as_deref(),
        Some("ValidationException: unknown release label")
    );
    assert!(!h
        .store
        .is_taken(Scope::Clusters, &stored[0].identifier)
        .await
        .unwrap());

    // The identifier is free for a new request.
    let retry = lifecycle
        .request_cluster(cluster_spec("scratch"), t0())
        .await
        .unwrap();
    assert_eq!(retry.state, ClusterState::ProvisionSubmitted);
}

#[tokio::test]
async fn test_retryable_failure_leaves_cluster_requested() {
    let h = harness();
    let lifecycle = h.atmo.lifecycle();
    h.control_plane
        .fail_next_launch(ControlPlaneError::Unavailable("connection reset".into()));

    let err = lifecycle
        .request_cluster(cluster_spec("scratch"), t0())
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let pending = h
        .store
        .list_clusters(&ClusterFilter::in_state(ClusterState::Requested))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].jobflow_id.is_none());

    let submitted = lifecycle.submit(pending[0].id, t0()).await.unwrap();
    assert_eq!(submitted.state, ClusterState::ProvisionSubmitted);

    // Already submitted: no second launch.
    let again = lifecycle.submit(pending[0].id, t0()).await.unwrap();
    assert_eq!(again.jobflow_id, submitted.jobflow_id);
    assert_eq!(h.control_plane.launches().len(), 1);
}

#[tokio::test]
async fn test_refresh_tracks_state_and_master_address() {
    let h = harness();
    let lifecycle = h.atmo.lifecycle();
    let cluster = lifecycle
        .request_cluster(cluster_spec("scratch"), t0())
        .await
        .unwrap();
    let jobflow_id = cluster.jobflow_id.clone().unwrap();

    let booting = lifecycle.refresh(cluster.id, t0()).await.unwrap();
    assert_eq!(booting.state, ClusterState::Bootstrapping);
    assert!(booting.started_at.is_some());

    h.control_plane.set_state(&jobflow_id, ObservedState::Running);
    h.control_plane
        .set_master_address(&jobflow_id, "ec2-10-0-0-1.compute.amazonaws.com");
    let running = lifecycle
        .refresh(cluster.id, t0() + Duration::minutes(8))
        .await
        .unwrap();
    assert_eq!(running.state, ClusterState::Running);
    assert_eq!(
        running.master_address.as_deref(),
        Some("ec2-10-0-0-1.compute.amazonaws.com")
    );

    // A changed address replaces the old one.
    h.control_plane
        .set_master_address(&jobflow_id, "ec2-10-0-0-2.compute.amazonaws.com");
    let moved = lifecycle
        .refresh(cluster.id, t0() + Duration::minutes(9))
        .await
        .unwrap();
    assert_eq!(
        moved.master_address.as_deref(),
        Some("ec2-10-0-0-2.compute.amazonaws.com")
    );

    // An earlier stage never moves the cluster backwards.
    h.control_plane
        .set_state(&jobflow_id, ObservedState::Bootstrapping);
    let still = lifecycle
        .refresh(cluster.id, t0() + Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(still.state, ClusterState::Running);
}

#[tokio::test]
async fn test_refresh_of_vanished_cluster_terminates_it() {
    let h = harness();
    let lifecycle = h.atmo.lifecycle();
    let cluster = lifecycle
        .request_cluster(cluster_spec("scratch"), t0())
        .await
        .unwrap();
    let jobflow_id = cluster.jobflow_id.clone().unwrap();
    h.control_plane.set_state(&jobflow_id, ObservedState::Running);
    lifecycle.refresh(cluster.id, t0()).await.unwrap();

    h.control_plane.forget(&jobflow_id);
    let gone = lifecycle
        .refresh(cluster.id, t0() + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(gone.state, ClusterState::Terminated);
    assert!(gone.state_change_reason.is_some());
    assert!(!h
        .store
        .is_taken(Scope::Clusters, &gone.identifier)
        .await
        .unwrap());

    // Terminal clusters are left alone.
    let again = lifecycle
        .refresh(cluster.id, t0() + Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(again, gone);
}

#[tokio::test]
async fn test_refresh_surfaces_failure_reason() {
    let h = harness();
    let lifecycle = h.atmo.lifecycle();
    let cluster = lifecycle
        .request_cluster(cluster_spec("scratch"), t0())
        .await
        .unwrap();
    let jobflow_id = cluster.jobflow_id.clone().unwrap();

    h.control_plane.set_state(&jobflow_id, ObservedState::Failed);
    h.control_plane
        .set_reason(&jobflow_id, "Bootstrap failure on master");
    let failed = lifecycle.refresh(cluster.id, t0()).await.unwrap();

    assert_eq!(failed.state, ClusterState::Failed);
    assert_eq!(
        failed.state_change_reason.as_deref(),
        Some("Bootstrap failure on master")
    );
}

#[tokio::test]
async fn test_terminate_is_idempotent() {
    let h = harness();
    let lifecycle = h.atmo.lifecycle();
    let cluster = lifecycle
        .request_cluster(cluster_spec("scratch"), t0())
        .await
        .unwrap();
    let jobflow_id = cluster.jobflow_id.clone().unwrap();

    let terminating = lifecycle.terminate(cluster.id, t0()).await.unwrap();
    assert_eq!(terminating.state, ClusterState::Terminating);
    assert_eq!(h.control_plane.terminate_calls(), vec![jobflow_id.clone()]);

    // Confirmed only by a later refresh.
    let terminated = lifecycle.refresh(cluster.id, t0()).await.unwrap();
    assert_eq!(terminated.state, ClusterState::Terminated);
    assert!(!h
        .store
        .is_taken(Scope::Clusters, &terminated.identifier)
        .await
        .unwrap());

    let again = lifecycle.terminate(cluster.id, t0()).await.unwrap();
    assert_eq!(again, terminated);
    assert_eq!(h.control_plane.terminate_calls().len(), 1);
}

#[tokio::test]
async fn test_terminate_unlaunched_cluster_skips_control_plane() {
    let h = harness();
    let lifecycle = h.atmo.lifecycle();
    h.control_plane
        .fail_next_launch(ControlPlaneError::Unavailable("throttled".into()));
    lifecycle
        .request_cluster(cluster_spec("scratch"), t0())
        .await
        .unwrap_err();
    let pending = h
        .store
        .list_clusters(&ClusterFilter::in_state(ClusterState::Requested))
        .await
        .unwrap();

    let terminated = lifecycle.terminate(pending[0].id, t0()).await.unwrap();

    assert_eq!(terminated.state, ClusterState::Terminated);
    assert!(h.control_plane.terminate_calls().is_empty());
}

#[tokio::test]
async fn test_terminate_failure_keeps_state() {
    let h = harness();
    let lifecycle = h.atmo.lifecycle();
    let cluster = lifecycle
        .request_cluster(cluster_spec("scratch"), t0())
        .await
        .unwrap();
    h.control_plane
        .fail_next_terminate(ControlPlaneError::Unavailable("connection reset".into()));

    let err = lifecycle.terminate(cluster.id, t0()).await.unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(
        lifecycle.load(cluster.id).await.unwrap().state,
        ClusterState::ProvisionSubmitted
    );
}

#[tokio::test]
async fn test_reconcile_marks_missing_and_counts_untracked() {
    let h = harness();
    let lifecycle = h.atmo.lifecycle();
    let now = Utc::now();

    let kept = lifecycle
        .request_cluster(cluster_spec("kept"), now)
        .await
        .unwrap();
    let gone = lifecycle
        .request_cluster(cluster_spec("gone"), now)
        .await
        .unwrap();
    h.control_plane.forget(gone.jobflow_id.as_deref().unwrap());

    let ended = lifecycle
        .request_cluster(cluster_spec("ended"), now)
        .await
        .unwrap();
    let ended_jobflow = ended.jobflow_id.clone().unwrap();
    h.control_plane.set_state(&ended_jobflow, ObservedState::Running);
    lifecycle.refresh(ended.id, now).await.unwrap();
    h.control_plane
        .set_state(&ended_jobflow, ObservedState::Terminated);

    let stranger = h.control_plane.insert_untracked(ObservedState::Running, now);

    let later = now + Duration::minutes(1);
    let window = ReconcileWindow::new(later, Duration::hours(48), Duration::zero());
    let report = lifecycle.reconcile(window, later).await.unwrap();

    assert_eq!(report.listed, 3);
    assert_eq!(report.vanished, vec![gone.id]);
    assert_eq!(report.refreshed, vec![ended.id]);
    assert_eq!(report.untracked, vec![stranger]);

    assert_eq!(
        lifecycle.load(gone.id).await.unwrap().state,
        ClusterState::Terminated
    );
    assert_eq!(
        lifecycle.load(ended.id).await.unwrap().state,
        ClusterState::Terminated
    );
    assert_eq!(
        lifecycle.load(kept.id).await.unwrap().state,
        ClusterState::ProvisionSubmitted
    );
}

#[tokio::test]
async fn test_reconcile_skips_clusters_still_settling() {
    let h = harness();
    let lifecycle = h.atmo.lifecycle();
    let now = Utc::now();

    let fresh = lifecycle
        .request_cluster(cluster_spec("fresh"), now)
        .await
        .unwrap();
    h.control_plane.forget(fresh.jobflow_id.as_deref().unwrap());

    let window = ReconcileWindow::new(now, Duration::hours(48), Duration::minutes(10));
    let report = lifecycle.reconcile(window, now).await.unwrap();

    assert!(report.vanished.is_empty());
    assert_eq!(
        lifecycle.load(fresh.id).await.unwrap().state,
        ClusterState::ProvisionSubmitted
    );
}

#[tokio::test]
async fn test_list_failure_aborts_reconcile() {
    let h = harness();
    h.control_plane
        .fail_next_list(ControlPlaneError::Unavailable("throttled".into()));
    let now = Utc::now();
    let window = ReconcileWindow::new(now, Duration::hours(48), Duration::zero());

    let err = h.atmo.lifecycle().reconcile(window, now).await.unwrap_err();

    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_stalled_reports_after_grace_without_changing_state() {
    let h = harness();
    let lifecycle = h.atmo.lifecycle();
    let cluster = lifecycle
        .request_cluster(cluster_spec("slow"), t0())
        .await
        .unwrap();

    assert!(lifecycle
        .stalled(t0() + Duration::minutes(10))
        .await
        .unwrap()
        .is_empty());

    let stalled = lifecycle.stalled(t0() + Duration::minutes(45)).await.unwrap();
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].cluster_id, cluster.id);
    assert_eq!(stalled[0].waiting, Duration::minutes(45));
    assert_eq!(
        lifecycle.load(cluster.id).await.unwrap().state,
        ClusterState::ProvisionSubmitted
    );
}
