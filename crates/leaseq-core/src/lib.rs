//! Core domain model and store abstraction for the leaseq job queue.
//!
//! A work item is a [`Record`] keyed by the SHA-256 digest of its payload.
//! Workers claim records under a time-bounded lease, renew it with
//! heartbeats, and either delete the record or release it for redelivery.
//! Every coordination step is a conditional write against a shared
//! [`Store`], so correctness across processes rests on the store applying
//! each conditional update or delete atomically per row.
//!
//! This crate holds the types every other crate shares:
//!
//! - [`models`] - records, identifiers, and topic routing
//! - [`storage`] - the [`Store`] trait, match predicates, field updates, and
//!   the PostgreSQL and in-memory implementations
//! - [`time`] - the [`Clock`] used for every lease timestamp

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{ClaimedRecord, OwnerId, Record, RecordId, TopicSet};
pub use storage::{InsertOutcome, RecordFilter, RecordUpdate, Store, StoreFuture};
pub use time::{Clock, RealClock, TestClock};
