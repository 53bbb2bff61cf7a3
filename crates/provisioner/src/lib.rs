pub mod aws;
pub mod control_plane;
pub mod emr;
pub mod error;
pub mod notebook;
pub mod plan;
pub mod status;

#[cfg(any(test, feature = "test-utils"))]
pub mod fake;

pub use control_plane::{
    BootstrapAction, ClusterStatus, ClusterStream, ClusterSummary, ControlPlane, LaunchRequest,
    LaunchStep, StepFailureAction,
};
pub use emr::EmrControlPlane;
pub use error::{ControlPlaneError, NotebookStoreError};
pub use notebook::{NotebookStore, S3NotebookStore};
pub use plan::LaunchPlanner;
pub use status::normalize_state;

#[cfg(any(test, feature = "test-utils"))]
pub use fake::{FakeControlPlane, MemoryNotebookStore};
