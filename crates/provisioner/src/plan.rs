//! Translate clusters and job runs into launch requests.

use atmo_core::config::EmrConfig;
use atmo_core::{Cluster, ResultVisibility, ScheduledJob};

use crate::control_plane::{BootstrapAction, LaunchRequest, LaunchStep, StepFailureAction};

/// Builds [`LaunchRequest`]s for interactive clusters and scheduled job runs.
#[derive(Debug, Clone)]
pub struct LaunchPlanner {
    emr: EmrConfig,
    region: String,
}

impl LaunchPlanner {
    pub fn new(emr: EmrConfig, region: impl Into<String>) -> Self {
        Self {
            emr,
            region: region.into(),
        }
    }

    pub fn emr(&self) -> &EmrConfig {
        &self.emr
    }

    /// Interactive cluster: kept alive with Zeppelin installed by a setup step.
    pub fn cluster_launch(&self, cluster: &Cluster) -> LaunchRequest {
        LaunchRequest {
            requested_by: cluster.requested_by.clone(),
            identifier: cluster.identifier.to_string(),
            release: cluster.release.clone(),
            size: cluster.size,
            public_key: cluster.public_key.clone(),
            bootstrap: BootstrapAction {
                name: "setup-telemetry-cluster".into(),
                script_uri: self.emr.script_uri(),
                args: vec![
                    "--public-key".into(),
                    cluster.public_key.clone().unwrap_or_default(),
                    "--email".into(),
                    cluster.requested_by.clone(),
                    "--efs-dns".into(),
                    self.emr.efs_dns.clone(),
                ],
            },
            steps: vec![LaunchStep {
                name: "setup-zeppelin".into(),
                jar: self.emr.jar_uri(&self.region),
                args: vec![self.emr.zeppelin_uri()],
                on_failure: StepFailureAction::TerminateCluster,
            }],
            keep_alive: true,
            applications: vec!["Zeppelin".into()],
            log_dir: "clusters".into(),
        }
    }

    /// Scheduled job run: executes the notebook once, then the cluster shuts down.
    pub fn job_run_launch(
        &self,
        job: &ScheduledJob,
        cluster: &Cluster,
        notebook_uri: &str,
    ) -> LaunchRequest {
        let data_bucket = match job.result_visibility {
            ResultVisibility::Public => &self.emr.public_data_bucket,
            ResultVisibility::Private => &self.emr.private_data_bucket,
        };

        LaunchRequest {
            requested_by: job.requested_by.clone(),
            identifier: cluster.identifier.to_string(),
            release: cluster.release.clone(),
            size: cluster.size,
            public_key: None,
            bootstrap: BootstrapAction {
                name: "setup-telemetry-spark-job".into(),
                script_uri: self.emr.script_uri(),
                args: vec!["--timeout".into(), job.timeout.as_minutes().to_string()],
            },
            steps: vec![LaunchStep {
                name: "RunNotebookStep".into(),
                jar: self.emr.jar_uri(&self.region),
                args: vec![
                    self.emr.batch_uri(),
                    "--job-name".into(),
                    job.identifier.to_string(),
                    "--notebook".into(),
                    notebook_uri.to_string(),
                    "--data-bucket".into(),
                    data_bucket.clone(),
                ],
                on_failure: StepFailureAction::TerminateCluster,
            }],
            keep_alive: false,
            applications: Vec::new(),
            log_dir: "jobs".into(),
        }
    }
}
