//! Claim scanner: one claim attempt per tick.

use std::sync::Arc;

use leaseq_core::TopicSet;
use tracing::{debug, info, warn};

use crate::{
    delivery::Delivery,
    error::{Operation, WorkerError},
    events::WorkerEvent,
    lease::{self, LeaseContext},
};

/// Claims at most one eligible record per tick and hands it to the caller.
#[derive(Debug)]
pub(crate) struct ClaimScanner {
    ctx: Arc<LeaseContext>,
    topics: TopicSet,
}

impl ClaimScanner {
    pub(crate) fn new(ctx: Arc<LeaseContext>, topics: TopicSet) -> Self {
        Self { ctx, topics }
    }

    /// Runs one scan. Returns whether a record was claimed.
    ///
    /// Waits for room on the event channel before claiming, so a claimed
    /// record is always handed over at once and never sits in progress
    /// unseen by the caller. Store failures are reported on the event
    /// channel and not retried; the next tick tries again. Nothing is
    /// claimed once the caller has dropped the event receiver, and a record
    /// claimed while the receiver goes away is requeued.
    pub(crate) async fn tick(&self) -> bool {
        let Some(slot) = self.ctx.events.reserve().await else {
            debug!("event receiver dropped, skipping claim");
            return false;
        };

        let now = self.ctx.clock.now_utc();
        let claimed = match self.ctx.store.claim_candidate(&self.topics, self.ctx.owner, now).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return false,
            Err(error) => {
                // Frees the slot for the error event.
                drop(slot);
                self.ctx.events.error(WorkerError::store(Operation::Claim, None, &error));
                return false;
            },
        };

        let delivery = Delivery::new(claimed, self.ctx.clone());
        info!(
            record_id = %delivery.id(),
            topic = delivery.topic().unwrap_or("-"),
            redelivered = delivery.redelivered(),
            owner = %self.ctx.owner,
            "claimed record"
        );

        if self.ctx.events.is_closed() {
            warn!(record_id = %delivery.id(), "event receiver closed after claim, requeueing");
            drop(slot);
            lease::requeue(&self.ctx, delivery.id()).await;
            return true;
        }

        slot.send(WorkerEvent::Data(delivery));
        true
    }
}
