//! Test infrastructure for deterministic queue testing.
//!
//! [`TestEnv`] pairs an in-memory store with a [`TestClock`], so lease
//! expiry is driven by explicit clock advances while loop timing is driven
//! by Tokio's paused clock. Fixture builders and invariant checks live in
//! their own modules.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use leaseq_core::{storage::MemoryStore, Clock, Record, Store};
use leaseq_worker::{
    Delivery, EventReceiver, Producer, Worker, WorkerConfig, WorkerError, WorkerEvent,
};

pub mod fixtures;
pub mod invariants;

pub use fixtures::{random_payload, record_batch, RecordBuilder};
pub use invariants::Invariants;
pub use leaseq_core::TestClock;

/// How long the receive helpers wait for an event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// In-memory store plus controllable clock.
#[derive(Debug, Clone, Default)]
pub struct TestEnv {
    /// Backing store shared by every worker built from this environment.
    pub store: MemoryStore,

    /// Clock shared by every worker built from this environment.
    pub clock: TestClock,
}

impl TestEnv {
    /// Creates an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Worker configuration with short loop periods.
    pub fn config() -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(100),
            lease_lifetime: Duration::from_secs(30),
            reclaim_interval: Duration::from_millis(500),
            event_buffer: 16,
            shutdown_timeout: Duration::from_secs(5),
            ..WorkerConfig::default()
        }
    }

    /// Store handle as the worker sees it.
    pub fn store(&self) -> Arc<dyn Store> {
        Arc::new(self.store.clone())
    }

    /// Clock handle as the worker sees it.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }

    /// Builds an idle worker against this environment.
    pub fn worker(&self, config: WorkerConfig) -> Result<(Worker, EventReceiver)> {
        Worker::new(self.store(), config, self.clock()).context("failed to build test worker")
    }

    /// Builds a standalone producer against this environment.
    pub fn producer(&self, max_send_cycles: u32) -> Result<Producer> {
        Producer::new(self.store(), self.clock(), max_send_cycles)
            .context("failed to build test producer")
    }

    /// Advances the lease clock.
    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Writes records directly into the store.
    pub async fn seed(&self, records: impl IntoIterator<Item = Record>) {
        for record in records {
            self.store.put(record).await;
        }
    }

    /// Current contents of the store.
    pub async fn records(&self) -> Vec<Record> {
        self.store.records().await
    }
}

/// Waits for the next event, failing if none arrives in time.
pub async fn next_event(events: &mut EventReceiver) -> Result<WorkerEvent> {
    match tokio::time::timeout(EVENT_TIMEOUT, events.recv()).await {
        Ok(Some(event)) => Ok(event),
        Ok(None) => bail!("event channel closed"),
        Err(_) => bail!("no event within {EVENT_TIMEOUT:?}"),
    }
}

/// Waits for the next event and expects a delivery.
pub async fn next_delivery(events: &mut EventReceiver) -> Result<Delivery> {
    match next_event(events).await? {
        WorkerEvent::Data(delivery) => Ok(delivery),
        WorkerEvent::Error(error) => bail!("expected delivery, got error: {error}"),
    }
}

/// Waits for the next event and expects an error.
pub async fn next_error(events: &mut EventReceiver) -> Result<WorkerError> {
    match next_event(events).await? {
        WorkerEvent::Error(error) => Ok(error),
        WorkerEvent::Data(delivery) => bail!("expected error, got delivery of {}", delivery.id()),
    }
}

/// Takes every event already queued without waiting.
pub fn drain(events: &mut EventReceiver) -> Vec<WorkerEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}
