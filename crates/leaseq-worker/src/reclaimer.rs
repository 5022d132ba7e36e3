//! Stale-lease reclaimer.
//!
//! Crash recovery for records whose holder stopped heartbeating. Runs
//! against every record in the store, not only those this worker claimed.

use std::sync::Arc;

use leaseq_core::{Clock, RecordFilter, RecordUpdate, Store};
use tracing::{debug, info};

use crate::{
    error::{Operation, Result, WorkerError},
    events::EventSink,
};

/// Releases every lease whose last heartbeat is older than the lifetime.
#[derive(Clone)]
pub(crate) struct StaleLeaseReclaimer {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    lease_lifetime: chrono::Duration,
    events: EventSink,
}

impl StaleLeaseReclaimer {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        lease_lifetime: chrono::Duration,
        events: EventSink,
    ) -> Self {
        Self { store, clock, lease_lifetime, events }
    }

    /// Runs one reclaim pass, returning how many leases were released.
    ///
    /// Released records become claimable with their `requeued` flag
    /// cleared.
    pub(crate) async fn reclaim(&self) -> Result<u64> {
        let cutoff = self.clock.now_utc() - self.lease_lifetime;
        let reclaimed = self
            .store
            .bulk_conditional_update(&RecordFilter::lease_expired(cutoff), &RecordUpdate::release_stale())
            .await
            .map_err(|error| WorkerError::store(Operation::Reclaim, None, &error))?;

        if reclaimed > 0 {
            info!(reclaimed, cutoff = %cutoff, "released stale leases");
        } else {
            debug!(cutoff = %cutoff, "no stale leases");
        }
        Ok(reclaimed)
    }

    /// Timer entry point: failures go to the event channel.
    pub(crate) async fn tick(&self) {
        if let Err(error) = self.reclaim().await {
            self.events.error(error);
        }
    }
}

impl std::fmt::Debug for StaleLeaseReclaimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaleLeaseReclaimer")
            .field("lease_lifetime", &self.lease_lifetime)
            .finish_non_exhaustive()
    }
}
