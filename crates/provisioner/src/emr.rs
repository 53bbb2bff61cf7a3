//! AWS EMR implementation of [`ControlPlane`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_emr::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_emr::primitives::DateTime as SmithyDateTime;
use aws_sdk_emr::types::{
    ActionOnFailure, Application, BootstrapActionConfig, HadoopJarStepConfig,
    JobFlowInstancesConfig, ScriptBootstrapActionConfig, StepConfig, Tag,
};
use aws_sdk_emr::Client;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info};

use atmo_core::config::{AwsConfig, EmrConfig};

use crate::aws::load_sdk_config;
use crate::control_plane::{
    ClusterStatus, ClusterStream, ClusterSummary, ControlPlane, LaunchRequest, LaunchStep,
    StepFailureAction,
};
use crate::error::{classify_service_error, is_unknown_cluster, ControlPlaneError};
use crate::status::normalize_state;

/// Applications installed on every cluster.
const BASE_APPLICATIONS: &[&str] = &["Spark", "Hive"];

/// EMR-backed control plane.
pub struct EmrControlPlane {
    client: Client,
    emr: EmrConfig,
    call_timeout: Duration,
}

impl EmrControlPlane {
    pub async fn new(aws: &AwsConfig, emr: &EmrConfig) -> Self {
        let sdk_config = load_sdk_config(aws).await;
        let client = Client::new(&sdk_config);

        info!(
            region = %aws.region,
            call_timeout_secs = emr.call_timeout_secs,
            "EMR control plane initialised"
        );

        Self::from_client(client, emr.clone())
    }

    pub fn from_client(client: Client, emr: EmrConfig) -> Self {
        let call_timeout = emr.call_timeout();
        Self {
            client,
            emr,
            call_timeout,
        }
    }

    /// Run one control-plane call under the configured time budget.
    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> Result<T, ControlPlaneError>
    where
        F: Future<Output = Result<T, ControlPlaneError>>,
    {
        bounded(self.call_timeout, operation, call).await
    }

    fn tag(key: &str, value: &str) -> Tag {
        Tag::builder().key(key).value(value).build()
    }
}

async fn bounded<T, F>(
    budget: Duration,
    operation: &'static str,
    call: F,
) -> Result<T, ControlPlaneError>
where
    F: Future<Output = Result<T, ControlPlaneError>>,
{
    tokio::time::timeout(budget, call)
        .await
        .map_err(|_| ControlPlaneError::Timeout {
            operation,
            seconds: budget.as_secs(),
        })?
}

#[async_trait]
impl ControlPlane for EmrControlPlane {
    async fn launch(&self, request: &LaunchRequest) -> Result<String, ControlPlaneError> {
        let instance_count = i32::try_from(request.size.saturating_add(1)).map_err(|_| {
            ControlPlaneError::Rejected {
                retryable: false,
                reason: format!("cluster size {} is out of range", request.size),
            }
        })?;

        let instances = JobFlowInstancesConfig::builder()
            .master_instance_type(&self.emr.master_instance_type)
            .slave_instance_type(&self.emr.worker_instance_type)
            .instance_count(instance_count)
            .ec2_key_name(&self.emr.ec2_key_name)
            .keep_job_flow_alive_when_no_steps(request.keep_alive)
            .build();

        let bootstrap = BootstrapActionConfig::builder()
            .name(&request.bootstrap.name)
            .script_bootstrap_action(
                ScriptBootstrapActionConfig::builder()
                    .path(&request.bootstrap.script_uri)
                    .set_args(Some(request.bootstrap.args.clone()))
                    .build(),
            )
            .build();

        let mut call = self
            .client
            .run_job_flow()
            .name(&request.identifier)
            .release_label(format!("emr-{}", request.release))
            .log_uri(self.emr.log_uri(&request.log_dir, &request.identifier))
            .instances(instances)
            .bootstrap_actions(bootstrap)
            .service_role(&self.emr.service_role)
            .job_flow_role(&self.emr.job_flow_role)
            .visible_to_all_users(true)
            .tags(Self::tag("Owner", &request.requested_by))
            .tags(Self::tag("Name", &request.identifier))
            .tags(Self::tag("Application", &self.emr.instance_app_tag))
            .tags(Self::tag("App", &self.emr.accounting_app_tag));

        for app in BASE_APPLICATIONS
            .iter()
            .copied()
            .chain(request.applications.iter().map(String::as_str))
        {
            call = call.applications(Application::builder().name(app).build());
        }

        for step in &request.steps {
            call = call.steps(step_config(step));
        }

        info!(
            identifier = %request.identifier,
            release = %request.release,
            size = request.size,
            "Launching EMR cluster"
        );

        let resp = self
            .bounded("launch", async {
                call.send().await.map_err(|e| classify("launch", e))
            })
            .await?;

        let jobflow_id = resp
            .job_flow_id()
            .ok_or_else(|| ControlPlaneError::InvalidResponse("no job flow id returned".into()))?
            .to_string();

        info!(identifier = %request.identifier, jobflow_id = %jobflow_id, "EMR cluster accepted");
        Ok(jobflow_id)
    }

    async fn describe(&self, jobflow_id: &str) -> Result<ClusterStatus, ControlPlaneError> {
        let resp = self
            .bounded("describe", async {
                self.client
                    .describe_cluster()
                    .cluster_id(jobflow_id)
                    .send()
                    .await
                    .map_err(|e| {
                        if sdk_unknown_cluster(&e) {
                            ControlPlaneError::NotFound(jobflow_id.to_string())
                        } else {
                            classify("describe", e)
                        }
                    })
            })
            .await?;

        let cluster = resp
            .cluster()
            .ok_or_else(|| ControlPlaneError::InvalidResponse("no cluster in response".into()))?;
        let status = cluster.status();

        let raw_state = status
            .and_then(|s| s.state())
            .map(|s| s.as_str().to_string())
            .ok_or_else(|| ControlPlaneError::InvalidResponse("no cluster state".into()))?;
        let state = normalize_state(&raw_state)?;

        let state_change_reason = status.and_then(|s| s.state_change_reason()).and_then(|r| {
            match (r.code().map(|c| c.as_str()), r.message()) {
                (Some(code), Some(msg)) => Some(format!("{code}: {msg}")),
                (None, Some(msg)) => Some(msg.to_string()),
                (Some(code), None) => Some(code.to_string()),
                (None, None) => None,
            }
        });

        let start_time = status
            .and_then(|s| s.timeline())
            .and_then(|t| t.creation_date_time())
            .and_then(to_chrono);

        debug!(jobflow_id, raw_state = %raw_state, "Described EMR cluster");

        Ok(ClusterStatus {
            state,
            raw_state,
            state_change_reason,
            start_time,
            master_address: cluster.master_public_dns_name().map(str::to_string),
        })
    }

    fn list(
        &self,
        created_after: DateTime<Utc>,
        created_before: Option<DateTime<Utc>>,
    ) -> ClusterStream {
        enum Cursor {
            Start,
            Next(String),
            Done,
        }

        let client = self.client.clone();
        let budget = self.call_timeout;

        let pages = stream::try_unfold(Cursor::Start, move |cursor| {
            let client = client.clone();
            async move {
                let marker = match cursor {
                    Cursor::Done => return Ok(None),
                    Cursor::Start => None,
                    Cursor::Next(marker) => Some(marker),
                };

                let call = client
                    .list_clusters()
                    .created_after(to_smithy(created_after))
                    .set_created_before(created_before.map(to_smithy))
                    .set_marker(marker);

                let resp = bounded(budget, "list", async move {
                    call.send().await.map_err(|e| classify("list", e))
                })
                .await?;

                let page = resp
                    .clusters()
                    .iter()
                    .map(|c| {
                        let jobflow_id = c.id().ok_or_else(|| {
                            ControlPlaneError::InvalidResponse("listed cluster without id".into())
                        })?;
                        let status = c.status();
                        let raw_state = status
                            .and_then(|s| s.state())
                            .map(|s| s.as_str())
                            .unwrap_or("UNKNOWN");
                        Ok(ClusterSummary {
                            jobflow_id: jobflow_id.to_string(),
                            state: normalize_state(raw_state)?,
                            start_time: status
                                .and_then(|s| s.timeline())
                                .and_then(|t| t.creation_date_time())
                                .and_then(to_chrono),
                        })
                    })
                    .collect::<Result<Vec<_>, ControlPlaneError>>()?;

                debug!(count = page.len(), "Listed EMR clusters page");

                let next = match resp.marker() {
                    Some(m) if !m.is_empty() => Cursor::Next(m.to_string()),
                    _ => Cursor::Done,
                };
                Ok(Some((page, next)))
            }
        });

        pages
            .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, ControlPlaneError>)))
            .try_flatten()
            .boxed()
    }

    async fn terminate(&self, jobflow_id: &str) -> Result<(), ControlPlaneError> {
        info!(jobflow_id, "Terminating EMR cluster");

        let result = self
            .bounded("terminate", async {
                self.client
                    .terminate_job_flows()
                    .job_flow_ids(jobflow_id)
                    .send()
                    .await
                    .map_err(|e| {
                        if sdk_unknown_cluster(&e) {
                            ControlPlaneError::NotFound(jobflow_id.to_string())
                        } else {
                            classify("terminate", e)
                        }
                    })
            })
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(ControlPlaneError::NotFound(_)) => {
                debug!(jobflow_id, "Terminate on unknown job flow treated as done");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &str {
        "emr"
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn step_config(step: &LaunchStep) -> StepConfig {
    let on_failure = match step.on_failure {
        StepFailureAction::TerminateCluster => ActionOnFailure::TerminateJobFlow,
        StepFailureAction::Continue => ActionOnFailure::Continue,
    };
    StepConfig::builder()
        .name(&step.name)
        .action_on_failure(on_failure)
        .hadoop_jar_step(
            HadoopJarStepConfig::builder()
                .jar(&step.jar)
                .set_args(Some(step.args.clone()))
                .build(),
        )
        .build()
}

/// Classify an SDK failure. Service errors are classified by code; transport,
/// timeout and response failures are retryable.
fn classify<E, R>(operation: &'static str, err: SdkError<E, R>) -> ControlPlaneError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    match &err {
        SdkError::ServiceError(service) => {
            let e = service.err();
            classify_service_error(e.code(), e.message().unwrap_or_default())
        }
        SdkError::ConstructionFailure(_) => ControlPlaneError::Rejected {
            retryable: false,
            reason: format!("{operation}: {err:?}"),
        },
        _ => ControlPlaneError::Unavailable(format!("{operation}: {err:?}")),
    }
}

fn sdk_unknown_cluster<E, R>(err: &SdkError<E, R>) -> bool
where
    E: ProvideErrorMetadata,
{
    match err {
        SdkError::ServiceError(service) => {
            let e = service.err();
            is_unknown_cluster(e.code(), e.message().unwrap_or_default())
        }
        _ => false,
    }
}

pub(crate) fn to_chrono(dt: &SmithyDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

pub(crate) fn to_smithy(dt: DateTime<Utc>) -> SmithyDateTime {
    SmithyDateTime::from_secs(dt.timestamp())
}
