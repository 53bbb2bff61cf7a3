use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("invalid identifier {0:?}: expected 1-100 letters, digits, '_' or '-'")]
    InvalidIdentifier(String),

    #[error("cluster size {size} outside 1..={max}")]
    InvalidSize { size: u32, max: u32 },

    #[error("job timeout must be 1-24 hours, got {0}")]
    InvalidTimeout(u32),

    #[error("unsupported run interval: {0} hours")]
    InvalidInterval(i64),

    #[error("end date {end} is before start date {start}")]
    InvalidWindow { start: String, end: String },

    #[error("job flow id already assigned: {0}")]
    JobFlowAlreadyAssigned(String),

    #[error("unknown {kind} value: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}
