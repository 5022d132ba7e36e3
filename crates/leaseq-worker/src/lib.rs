//! Lease-based coordination for the leaseq job queue.
//!
//! Workers poll a shared store, claim one record at a time under a lease,
//! keep the lease alive with heartbeats, and either delete the record or
//! release it for redelivery. A second loop releases leases whose holder
//! stopped heartbeating. Producers insert records idempotently, keyed by
//! payload digest.
//!
//! # Architecture
//!
//! Every step is a conditional write against a [`leaseq_core::Store`]; no
//! in-process lock coordinates workers. A [`Worker`] drives two repeating
//! loops:
//!
//! 1. **Claim scanner** - claims one random eligible record per tick and
//!    emits it as a [`Delivery`]
//! 2. **Stale-lease reclaimer** - releases every lease older than the
//!    configured lifetime
//!
//! Results and errors reach the caller through an event channel rather than
//! return values, so a failing heartbeat never interrupts processing code.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use leaseq_core::{storage::MemoryStore, RealClock};
//! use leaseq_worker::{Worker, WorkerConfig, WorkerError, WorkerEvent};
//!
//! # async fn example() -> Result<(), WorkerError> {
//! let store = Arc::new(MemoryStore::new());
//! let (mut worker, mut events) =
//!     Worker::new(store, WorkerConfig::default(), Arc::new(RealClock::new()))?;
//!
//! worker.send(&b"resize image 42"[..], None).await?;
//! worker.listen();
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         WorkerEvent::Data(delivery) => {
//!             delivery.remove().await;
//!         },
//!         WorkerEvent::Error(error) => eprintln!("worker error: {error}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod controller;
pub mod delivery;
pub mod error;
pub mod events;
mod lease;
pub mod producer;
mod reclaimer;
mod scanner;
mod timer;

pub use config::WorkerConfig;
pub use controller::{Worker, WorkerState};
pub use delivery::{Delivery, KeepAlive};
pub use error::{Operation, Result, WorkerError};
pub use events::{EventReceiver, WorkerEvent};
pub use lease::Completion;
pub use producer::{Producer, SendOutcome};

/// Default bound on insert/flag cycles per send.
pub const DEFAULT_MAX_SEND_CYCLES: u32 = 10;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 64;
