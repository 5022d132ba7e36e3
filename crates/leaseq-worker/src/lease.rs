//! Lease operations issued on behalf of a claimed record.
//!
//! Each function is one conditional write against the store. None of them
//! return errors to the caller: failures go to the event channel and the
//! return value says whether the write took effect.

use std::sync::Arc;

use leaseq_core::{Clock, OwnerId, RecordFilter, RecordId, RecordUpdate, Store};
use tracing::{debug, warn};

use crate::{
    error::{Operation, WorkerError},
    events::EventSink,
};

/// Everything a lease operation needs besides the record id.
#[derive(Clone)]
pub(crate) struct LeaseContext {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) owner: OwnerId,
    pub(crate) events: EventSink,
}

impl std::fmt::Debug for LeaseContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseContext").field("owner", &self.owner).finish_non_exhaustive()
    }
}

/// Result of finishing a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The record was deleted.
    Deleted,

    /// The delete did not go through and the record was released for
    /// redelivery instead.
    Requeued,

    /// Neither delete nor requeue matched; the record no longer exists.
    Missing,

    /// The delete did not go through and the requeue fallback failed too.
    /// The failure was reported on the event channel.
    Failed,
}

/// Refreshes the lease on `id` if this worker still holds it.
///
/// Zero matched rows means the lease was lost, usually to the reclaimer;
/// that is reported as [`WorkerError::LeaseLost`].
pub(crate) async fn heartbeat(ctx: &LeaseContext, id: &RecordId) -> bool {
    let now = ctx.clock.now_utc();
    let result = ctx
        .store
        .conditional_update(id, &RecordFilter::held_by(ctx.owner), &RecordUpdate::renew_lease(now))
        .await;

    match result {
        Ok(0) => {
            warn!(record_id = %id, owner = %ctx.owner, "heartbeat matched no held record");
            ctx.events.error(WorkerError::lease_lost(id.clone()));
            false
        },
        Ok(_) => {
            debug!(record_id = %id, lease_timestamp = %now, "lease renewed");
            true
        },
        Err(error) => {
            ctx.events.error(WorkerError::store(Operation::Heartbeat, Some(id), &error));
            false
        },
    }
}

/// Releases `id` for redelivery regardless of who holds it.
///
/// Returns the number of rows affected, or `None` if the store call failed.
pub(crate) async fn requeue(ctx: &LeaseContext, id: &RecordId) -> Option<u64> {
    let result =
        ctx.store.conditional_update(id, &RecordFilter::default(), &RecordUpdate::requeue()).await;

    match result {
        Ok(affected) => {
            debug!(record_id = %id, affected, "record requeued");
            Some(affected)
        },
        Err(error) => {
            ctx.events.error(WorkerError::store(Operation::Requeue, Some(id), &error));
            None
        },
    }
}

/// Deletes `id` unless it has been flagged for redelivery, falling back
/// to a requeue whenever the delete does not go through.
pub(crate) async fn complete(ctx: &LeaseContext, id: &RecordId) -> Completion {
    match ctx.store.delete(id, &RecordFilter::not_requeued()).await {
        Ok(affected) if affected > 0 => {
            debug!(record_id = %id, "record completed");
            return Completion::Deleted;
        },
        Ok(_) => {
            debug!(record_id = %id, "record flagged for redelivery, requeueing instead of delete");
        },
        Err(error) => {
            warn!(record_id = %id, error = %error, "delete failed, falling back to requeue");
        },
    }

    match ctx.store.conditional_update(id, &RecordFilter::default(), &RecordUpdate::requeue()).await
    {
        Ok(0) => {
            debug!(record_id = %id, "record vanished before completion");
            Completion::Missing
        },
        Ok(_) => Completion::Requeued,
        Err(error) => {
            ctx.events.error(WorkerError::store(Operation::Complete, Some(id), &error));
            Completion::Failed
        },
    }
}
