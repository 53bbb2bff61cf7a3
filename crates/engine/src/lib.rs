pub mod driver;
pub mod error;
mod lease;
pub mod lifecycle;
pub mod retry;
pub mod scheduler;
pub mod service;

pub use driver::{Driver, TickReport};
pub use error::EngineError;
pub use lifecycle::{LifecycleManager, ReconcileReport, ReconcileWindow, StallReport};
pub use retry::RetryPolicy;
pub use scheduler::{check_timeout, is_due, Scheduler, TimeoutCheck};
pub use service::Atmo;
