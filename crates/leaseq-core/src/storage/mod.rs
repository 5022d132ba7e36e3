//! Store abstraction for the coordination protocol.
//!
//! The protocol needs exactly five primitives from its backing store:
//! selecting a claimable candidate, a conditional single-row update, an
//! insert that reports uniqueness conflicts, a conditional delete, and a
//! conditional bulk update. Each conditional write must be atomic per row;
//! that guarantee is what keeps concurrent workers from double-processing.
//!
//! [`Store::claim_candidate`] folds selection and ownership into one step.
//! Its default composes `select_candidate` with a `conditional_update`
//! guarded by `in_progress = false`, so a worker that loses the race simply
//! claims nothing this tick. Backends that can do better in one statement
//! override it, as [`postgres::PostgresStore`] does.

use std::{fmt, future::Future, pin::Pin};

use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    models::{ClaimedRecord, OwnerId, Record, RecordId, TopicSet},
};

pub mod memory;
pub mod postgres;
mod predicate;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use predicate::{RecordFilter, RecordUpdate};

/// Boxed future returned by every store operation.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Outcome of an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new record was created.
    Inserted,

    /// A record with the same identifier already exists.
    Conflict,
}

/// Names each store primitive, for logging and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    /// [`Store::select_candidate`]
    SelectCandidate,
    /// [`Store::claim_candidate`]
    ClaimCandidate,
    /// [`Store::conditional_update`]
    ConditionalUpdate,
    /// [`Store::insert`]
    Insert,
    /// [`Store::delete`]
    Delete,
    /// [`Store::bulk_conditional_update`]
    BulkConditionalUpdate,
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelectCandidate => write!(f, "select_candidate"),
            Self::ClaimCandidate => write!(f, "claim_candidate"),
            Self::ConditionalUpdate => write!(f, "conditional_update"),
            Self::Insert => write!(f, "insert"),
            Self::Delete => write!(f, "delete"),
            Self::BulkConditionalUpdate => write!(f, "bulk_conditional_update"),
        }
    }
}

/// Transactional keyed record collection backing the queue.
pub trait Store: Send + Sync + 'static {
    /// Picks one claimable record uniformly at random.
    ///
    /// A record is claimable when it is not in progress and its topic is
    /// absent or contained in `topics`. Does not mark the record owned.
    fn select_candidate<'a>(&'a self, topics: &'a TopicSet) -> StoreFuture<'a, Option<Record>>;

    /// Applies `update` to the record `id` if it currently matches
    /// `filter`. Returns the number of rows affected (0 or 1).
    fn conditional_update<'a>(
        &'a self,
        id: &'a RecordId,
        filter: &'a RecordFilter,
        update: &'a RecordUpdate,
    ) -> StoreFuture<'a, u64>;

    /// Inserts a new record, reporting an identifier collision as
    /// [`InsertOutcome::Conflict`] rather than an error.
    fn insert<'a>(&'a self, record: &'a Record) -> StoreFuture<'a, InsertOutcome>;

    /// Deletes the record `id` if it currently matches `filter`. Returns the
    /// number of rows affected (0 or 1).
    fn delete<'a>(&'a self, id: &'a RecordId, filter: &'a RecordFilter) -> StoreFuture<'a, u64>;

    /// Applies `update` to every record matching `filter`. Returns the
    /// number of rows affected.
    fn bulk_conditional_update<'a>(
        &'a self,
        filter: &'a RecordFilter,
        update: &'a RecordUpdate,
    ) -> StoreFuture<'a, u64>;

    /// Selects a claimable record and marks it owned by `owner` as of
    /// `now`.
    ///
    /// Returns `None` when nothing is claimable or when another worker
    /// claimed the selected candidate first.
    fn claim_candidate<'a>(
        &'a self,
        topics: &'a TopicSet,
        owner: OwnerId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Option<ClaimedRecord>> {
        Box::pin(async move {
            let Some(mut record) = self.select_candidate(topics).await? else {
                return Ok(None);
            };

            let update = RecordUpdate::claim(owner, now);
            let claimed =
                self.conditional_update(&record.id, &RecordFilter::available(), &update).await?;
            if claimed == 0 {
                return Ok(None);
            }

            let redelivered = record.requeued;
            update.apply(&mut record);
            Ok(Some(ClaimedRecord { record, redelivered }))
        })
    }
}
