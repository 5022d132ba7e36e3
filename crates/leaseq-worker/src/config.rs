//! Worker configuration.

use std::time::Duration;

use leaseq_core::TopicSet;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkerError};

/// Configuration for a worker controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Delay between the end of one claim scan and the start of the next.
    pub poll_interval: Duration,

    /// How long a lease survives without a heartbeat before the reclaimer
    /// may release it.
    pub lease_lifetime: Duration,

    /// Delay between stale-lease reclaim passes.
    pub reclaim_interval: Duration,

    /// Topics this worker claims, in addition to untagged records.
    pub topics: TopicSet,

    /// Upper bound on insert/flag cycles for a single send.
    pub max_send_cycles: u32,

    /// Capacity of the event channel.
    pub event_buffer: usize,

    /// Maximum time to wait for in-flight ticks on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            lease_lifetime: Duration::from_secs(60),
            reclaim_interval: Duration::from_secs(15),
            topics: TopicSet::new(),
            max_send_cycles: crate::DEFAULT_MAX_SEND_CYCLES,
            event_buffer: crate::DEFAULT_EVENT_BUFFER,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Checks every field before the worker touches the store.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::Configuration` naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(WorkerError::configuration("poll_interval must be greater than zero"));
        }
        if self.reclaim_interval.is_zero() {
            return Err(WorkerError::configuration("reclaim_interval must be greater than zero"));
        }
        if self.lease_lifetime.is_zero() {
            return Err(WorkerError::configuration("lease_lifetime must be greater than zero"));
        }
        self.lease_lifetime_chrono()?;
        if self.max_send_cycles == 0 {
            return Err(WorkerError::configuration("max_send_cycles must be at least 1"));
        }
        if self.event_buffer == 0 {
            return Err(WorkerError::configuration("event_buffer must be at least 1"));
        }
        if self.topics.iter().any(str::is_empty) {
            return Err(WorkerError::configuration("topics must not contain an empty name"));
        }
        Ok(())
    }

    /// Lease lifetime as a signed duration for timestamp arithmetic.
    pub(crate) fn lease_lifetime_chrono(&self) -> Result<chrono::Duration> {
        chrono::Duration::from_std(self.lease_lifetime).map_err(|_| {
            WorkerError::configuration(format!(
                "lease_lifetime {:?} is out of range",
                self.lease_lifetime
            ))
        })
    }
}
