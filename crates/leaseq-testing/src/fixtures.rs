//! Builders for records in arbitrary protocol states.
//!
//! Tests often need a record that is already claimed, already flagged, or
//! holding a lease that went stale long ago. Building those through the
//! worker would mean driving timers; these builders write them directly.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use leaseq_core::{OwnerId, Record, RecordUpdate};
use rand::{distributions::Alphanumeric, Rng};

/// Builder for a [`Record`] in any state.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    payload: Bytes,
    topic: Option<String>,
    created_at: DateTime<Utc>,
    holder: Option<(OwnerId, DateTime<Utc>)>,
    requeued: bool,
}

impl RecordBuilder {
    /// Starts an available, untagged record with a random payload.
    pub fn new() -> Self {
        Self {
            payload: random_payload(24),
            topic: None,
            created_at: Utc::now(),
            holder: None,
            requeued: false,
        }
    }

    /// Sets the payload, and therefore the identifier.
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Tags the record with a topic.
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Sets the creation time.
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Marks the record as held by `owner` with a lease taken at `at`.
    pub fn held_by(mut self, owner: OwnerId, at: DateTime<Utc>) -> Self {
        self.holder = Some((owner, at));
        self
    }

    /// Marks the record as held by a departed worker whose last heartbeat
    /// was `age` before `now`.
    pub fn stale(self, now: DateTime<Utc>, age: Duration) -> Self {
        let at = now - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
        self.held_by(OwnerId::new(), at)
    }

    /// Sets the redelivery flag.
    pub fn requeued(mut self) -> Self {
        self.requeued = true;
        self
    }

    /// Builds the record.
    pub fn build(self) -> Record {
        let mut record = Record::new(self.payload, self.topic, self.created_at);
        if let Some((owner, at)) = self.holder {
            RecordUpdate::claim(owner, at).apply(&mut record);
        }
        record.requeued = self.requeued;
        record
    }
}

impl Default for RecordBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Random alphanumeric payload of `len` bytes.
pub fn random_payload(len: usize) -> Bytes {
    let bytes: Vec<u8> = rand::thread_rng().sample_iter(&Alphanumeric).take(len).collect();
    Bytes::from(bytes)
}

/// `count` distinct available records, optionally tagged.
pub fn record_batch(count: usize, topic: Option<&str>) -> Vec<Record> {
    (0..count)
        .map(|i| {
            let builder = RecordBuilder::new().payload(format!("job-{i}").into_bytes());
            let builder = match topic {
                Some(topic) => builder.topic(topic),
                None => builder,
            };
            builder.build()
        })
        .collect()
}
