//! Producer side: idempotent, content-addressed sends.
//!
//! A send inserts a record keyed by the payload digest. If a record with
//! that digest already exists and is being processed, it is flagged so it
//! gets delivered once more after the current attempt. If it exists but is
//! not in progress, the insert is retried, covering the window where the
//! existing record is completed and deleted between the two calls. The
//! insert/flag alternation is bounded by a cycle count; there is no lock.

use std::sync::Arc;

use bytes::Bytes;
use leaseq_core::{Clock, InsertOutcome, Record, RecordFilter, RecordId, RecordUpdate, Store};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Operation, Result, WorkerError};

/// What a successful send did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// A new record was inserted.
    Created(RecordId),

    /// An identical record was already in progress and has been flagged
    /// for redelivery.
    FlaggedForRedelivery(RecordId),
}

impl SendOutcome {
    /// Identifier of the record the send landed on.
    pub fn id(&self) -> &RecordId {
        match self {
            Self::Created(id) | Self::FlaggedForRedelivery(id) => id,
        }
    }
}

/// Inserts work items into the store.
#[derive(Clone)]
pub struct Producer {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    max_send_cycles: u32,
}

impl Producer {
    /// Creates a producer bounded to `max_send_cycles` insert/flag cycles
    /// per send.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::Configuration` if `max_send_cycles` is zero.
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, max_send_cycles: u32) -> Result<Self> {
        if max_send_cycles == 0 {
            return Err(WorkerError::configuration("max_send_cycles must be at least 1"));
        }
        Ok(Self { store, clock, max_send_cycles })
    }

    /// Sends a payload, optionally tagged with a topic.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::SendExhausted` if every cycle conflicted with a
    /// record that was not in progress, or `WorkerError::Store` for any
    /// other store failure. Store failures are not retried.
    pub async fn send(&self, payload: impl Into<Bytes>, topic: Option<&str>) -> Result<SendOutcome> {
        let record = Record::new(payload, topic.map(str::to_string), self.clock.now_utc());
        let id = &record.id;

        for cycle in 1..=self.max_send_cycles {
            let inserted = self
                .store
                .insert(&record)
                .await
                .map_err(|error| WorkerError::store(Operation::Send, Some(id), &error))?;

            if inserted == InsertOutcome::Inserted {
                info!(record_id = %id, topic = topic.unwrap_or("-"), cycle, "record created");
                return Ok(SendOutcome::Created(id.clone()));
            }

            let flagged = self
                .store
                .conditional_update(id, &RecordFilter::in_progress(), &RecordUpdate::flag_redelivery())
                .await
                .map_err(|error| WorkerError::store(Operation::Send, Some(id), &error))?;

            if flagged > 0 {
                info!(record_id = %id, cycle, "in-flight record flagged for redelivery");
                return Ok(SendOutcome::FlaggedForRedelivery(id.clone()));
            }

            debug!(record_id = %id, cycle, "existing record not in progress, retrying insert");
        }

        warn!(record_id = %id, cycles = self.max_send_cycles, "send exhausted");
        Err(WorkerError::send_exhausted(record.id, self.max_send_cycles))
    }

    /// Serialises `value` as JSON and sends it.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::Serialization` if `value` cannot be encoded,
    /// otherwise as [`Producer::send`].
    pub async fn send_json<T: Serialize + ?Sized>(
        &self,
        value: &T,
        topic: Option<&str>,
    ) -> Result<SendOutcome> {
        let payload = serde_json::to_vec(value)?;
        self.send(payload, topic).await
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer").field("max_send_cycles", &self.max_send_cycles).finish()
    }
}
