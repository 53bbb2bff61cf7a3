//! Control-plane trait and the normalized request/response types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use atmo_core::ObservedState;

use crate::error::ControlPlaneError;

/// Script run on every node before any step executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapAction {
    pub name: String,
    pub script_uri: String,
    pub args: Vec<String>,
}

/// What the control plane does with the cluster when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepFailureAction {
    TerminateCluster,
    Continue,
}

/// A step executed after bootstrap through the script-runner jar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchStep {
    pub name: String,
    pub jar: String,
    pub args: Vec<String>,
    pub on_failure: StepFailureAction,
}

/// Everything the control plane needs to create a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub requested_by: String,
    pub identifier: String,
    pub release: String,
    /// Worker count; the master node comes on top.
    pub size: u32,
    pub public_key: Option<String>,
    pub bootstrap: BootstrapAction,
    pub steps: Vec<LaunchStep>,
    /// Keep the cluster up after the last step finishes.
    pub keep_alive: bool,
    /// Applications installed in addition to Spark and Hive.
    pub applications: Vec<String>,
    /// Log directory under the log bucket (`clusters` or `jobs`).
    pub log_dir: String,
}

/// Result of a describe call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub state: ObservedState,
    /// State string as reported by the control plane, for logs.
    pub raw_state: String,
    pub state_change_reason: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub master_address: Option<String>,
}

/// One entry of a list call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub jobflow_id: String,
    pub state: ObservedState,
    pub start_time: Option<DateTime<Utc>>,
}

/// Lazy, finite, single-pass sequence of listed clusters. Pages are fetched
/// as the stream is polled.
pub type ClusterStream = BoxStream<'static, Result<ClusterSummary, ControlPlaneError>>;

/// Client for the external cluster control plane.
///
/// Implementations hold no mutable state and may be called concurrently.
/// Every call is bounded by a time budget; exceeding it yields a retryable
/// [`ControlPlaneError::Timeout`]. Retrying is the caller's job.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Create a cluster and return the job flow id assigned to it.
    async fn launch(&self, request: &LaunchRequest) -> Result<String, ControlPlaneError>;

    /// Current status of a job flow. [`ControlPlaneError::NotFound`] when the
    /// control plane no longer knows the id.
    async fn describe(&self, jobflow_id: &str) -> Result<ClusterStatus, ControlPlaneError>;

    /// Clusters created inside the given window.
    fn list(
        &self,
        created_after: DateTime<Utc>,
        created_before: Option<DateTime<Utc>>,
    ) -> ClusterStream;

    /// Request termination. Unknown or already terminated ids are not an error.
    async fn terminate(&self, jobflow_id: &str) -> Result<(), ControlPlaneError>;

    /// Backend name for logging (e.g., "emr", "fake").
    fn name(&self) -> &str;
}
