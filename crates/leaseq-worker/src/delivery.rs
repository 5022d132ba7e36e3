//! Handle for a claimed record.
//!
//! A [`Delivery`] carries the record together with the worker identity
//! that claimed it, so heartbeat, requeue and completion never need the
//! caller to resupply an identifier. Handles are cheap to clone and safe to
//! move into processing tasks.

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use leaseq_core::{ClaimedRecord, OwnerId, Record, RecordId};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::Result,
    lease::{self, Completion, LeaseContext},
};

/// A record claimed by this worker, with its lease operations bound.
#[derive(Clone)]
pub struct Delivery {
    record: Arc<Record>,
    redelivered: bool,
    ctx: Arc<LeaseContext>,
}

impl Delivery {
    pub(crate) fn new(claimed: ClaimedRecord, ctx: Arc<LeaseContext>) -> Self {
        Self { record: Arc::new(claimed.record), redelivered: claimed.redelivered, ctx }
    }

    /// Content digest identifying the record.
    pub fn id(&self) -> &RecordId {
        &self.record.id
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.record.payload
    }

    /// Payload as an owned buffer.
    pub fn payload_bytes(&self) -> Bytes {
        self.record.payload_bytes()
    }

    /// Decodes a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::Serialization` if the payload is not valid JSON
    /// for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.record.payload)?)
    }

    /// Routing tag, if the record has one.
    pub fn topic(&self) -> Option<&str> {
        self.record.topic.as_deref()
    }

    /// Whether the record had been released for redelivery before this
    /// claim.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Worker identity holding the lease.
    pub fn owner(&self) -> OwnerId {
        self.ctx.owner
    }

    /// Time the lease was taken.
    pub fn claimed_at(&self) -> DateTime<Utc> {
        self.record.lease_timestamp
    }

    /// The record as it was stored right after the claim.
    pub fn record(&self) -> &Record {
        &self.record
    }

    /// Renews the lease.
    ///
    /// Returns `false` if the lease is gone or the store call failed; the
    /// reason is reported on the event channel. Work on a record whose
    /// heartbeat fails should be abandoned.
    pub async fn heartbeat(&self) -> bool {
        lease::heartbeat(&self.ctx, self.id()).await
    }

    /// Releases the record so any worker may claim it again.
    ///
    /// Returns `false` if the store call failed or the record no longer
    /// exists.
    pub async fn requeue(&self) -> bool {
        matches!(lease::requeue(&self.ctx, self.id()).await, Some(affected) if affected > 0)
    }

    /// Finishes the record.
    ///
    /// Deletes it unless a producer flagged it for redelivery in the
    /// meantime; any delete that does not go through falls back to a
    /// requeue, so the record is never silently lost.
    pub async fn remove(&self) -> Completion {
        lease::complete(&self.ctx, self.id()).await
    }

    /// Heartbeats every `interval` in a background task until the returned
    /// guard is dropped or a heartbeat fails.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn keep_alive(&self, interval: Duration) -> KeepAlive {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let delivery = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {},
                    () = cancelled.cancelled() => break,
                }

                if !delivery.heartbeat().await {
                    debug!(record_id = %delivery.id(), "keep-alive stopped after failed heartbeat");
                    break;
                }
            }
        });

        KeepAlive { token, handle }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.record.id)
            .field("topic", &self.record.topic)
            .field("redelivered", &self.redelivered)
            .field("owner", &self.ctx.owner)
            .finish()
    }
}

/// Guard for a background heartbeat task. Dropping it stops the task.
#[derive(Debug)]
pub struct KeepAlive {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl KeepAlive {
    /// Whether the task has stopped, either because a heartbeat failed or
    /// because it was cancelled.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops heartbeating and waits for an in-flight heartbeat to finish.
    pub async fn stop(mut self) {
        self.token.cancel();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
