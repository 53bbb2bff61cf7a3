pub mod error;
pub mod memory;
pub mod pg;
pub mod traits;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use pg::PgStore;
pub use traits::{
    cluster_lease_key, job_lease_key, ClusterFilter, IdentifierRegistry, JobFilter, Lease, Leases,
    Persistence, RunFilter, Store,
};
