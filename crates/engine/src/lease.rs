use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use atmo_store::{Lease, Persistence};

use crate::error::EngineError;

/// Takes and returns per-entity leases on behalf of one worker.
///
/// Each acquisition records its own holder token (`<worker>/<uuid>`), so two
/// calls in the same process exclude each other just like two workers do.
#[derive(Clone)]
pub(crate) struct LeaseKeeper {
    store: Arc<dyn Persistence>,
    holder: String,
    ttl: Duration,
}

impl LeaseKeeper {
    pub(crate) fn new(store: Arc<dyn Persistence>, holder: String, ttl: Duration) -> Self {
        Self { store, holder, ttl }
    }

    /// Leases expire on wall-clock time regardless of the logical `now`
    /// passed to engine operations.
    pub(crate) async fn acquire(&self, key: String) -> Result<Lease, EngineError> {
        let token = format!("{}/{}", self.holder, Uuid::new_v4().simple());
        match self
            .store
            .acquire_lease(&key, &token, self.ttl, Utc::now())
            .await?
        {
            Some(lease) => {
                debug!(key = %key, holder = %lease.holder, "Lease acquired");
                Ok(lease)
            }
            None => Err(EngineError::LeaseUnavailable(key)),
        }
    }

    pub(crate) async fn release(&self, lease: Lease) {
        if let Err(e) = self.store.release_lease(&lease).await {
            warn!(key = %lease.key, error = %e, "Failed to release lease; it will expire");
        }
    }
}
