//! In-process store implementation.
//!
//! Holds records in a map behind a single async lock, so each operation is
//! atomic with respect to every other. Used by tests and by embedders that
//! want the coordination protocol without a database. Faults can be
//! injected per operation to exercise error paths.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use rand::seq::IteratorRandom;
use tokio::sync::{Mutex, RwLock};

use super::{InsertOutcome, RecordFilter, RecordUpdate, Store, StoreFuture, StoreOperation};
use crate::{
    error::{CoreError, Result},
    models::{ClaimedRecord, OwnerId, Record, RecordId, TopicSet},
};

/// In-memory store with fault injection.
///
/// Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<RwLock<HashMap<RecordId, Record>>>,
    faults: Arc<Mutex<HashMap<StoreOperation, String>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call of `operation` fail with a database error
    /// carrying `message`. The fault is consumed by that call.
    pub async fn fail_next(&self, operation: StoreOperation, message: impl Into<String>) {
        self.faults.lock().await.insert(operation, message.into());
    }

    /// Stores a record as-is, replacing any record with the same id.
    pub async fn put(&self, record: Record) {
        self.records.write().await.insert(record.id.clone(), record);
    }

    /// Returns a snapshot of one record.
    pub async fn get(&self, id: &RecordId) -> Option<Record> {
        self.records.read().await.get(id).cloned()
    }

    /// Returns a snapshot of every record, ordered by id.
    pub async fn records(&self) -> Vec<Record> {
        let mut records: Vec<Record> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the store holds no records.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    async fn check_fault(&self, operation: StoreOperation) -> Result<()> {
        match self.faults.lock().await.remove(&operation) {
            Some(message) => Err(CoreError::Database(message)),
            None => Ok(()),
        }
    }
}

fn claimable(record: &Record, topics: &TopicSet) -> bool {
    !record.in_progress && topics.admits(record.topic.as_deref())
}

fn reject_empty(update: &RecordUpdate) -> Result<()> {
    if update.is_empty() {
        return Err(CoreError::InvalidInput("update assigns no fields".to_string()));
    }
    Ok(())
}

impl Store for MemoryStore {
    fn select_candidate<'a>(&'a self, topics: &'a TopicSet) -> StoreFuture<'a, Option<Record>> {
        Box::pin(async move {
            self.check_fault(StoreOperation::SelectCandidate).await?;

            let records = self.records.read().await;
            let candidate = records
                .values()
                .filter(|record| claimable(record, topics))
                .choose(&mut rand::thread_rng())
                .cloned();
            Ok(candidate)
        })
    }

    fn conditional_update<'a>(
        &'a self,
        id: &'a RecordId,
        filter: &'a RecordFilter,
        update: &'a RecordUpdate,
    ) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            self.check_fault(StoreOperation::ConditionalUpdate).await?;
            reject_empty(update)?;

            let mut records = self.records.write().await;
            match records.get_mut(id) {
                Some(record) if filter.matches(record) => {
                    update.apply(record);
                    Ok(1)
                },
                _ => Ok(0),
            }
        })
    }

    fn insert<'a>(&'a self, record: &'a Record) -> StoreFuture<'a, InsertOutcome> {
        Box::pin(async move {
            self.check_fault(StoreOperation::Insert).await?;

            let mut records = self.records.write().await;
            if records.contains_key(&record.id) {
                return Ok(InsertOutcome::Conflict);
            }
            records.insert(record.id.clone(), record.clone());
            Ok(InsertOutcome::Inserted)
        })
    }

    fn delete<'a>(&'a self, id: &'a RecordId, filter: &'a RecordFilter) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            self.check_fault(StoreOperation::Delete).await?;

            let mut records = self.records.write().await;
            if records.get(id).is_some_and(|record| filter.matches(record)) {
                records.remove(id);
                return Ok(1);
            }
            Ok(0)
        })
    }

    fn bulk_conditional_update<'a>(
        &'a self,
        filter: &'a RecordFilter,
        update: &'a RecordUpdate,
    ) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            self.check_fault(StoreOperation::BulkConditionalUpdate).await?;
            reject_empty(update)?;
            if filter.is_unconstrained() {
                return Err(CoreError::InvalidInput(
                    "bulk update requires at least one constraint".to_string(),
                ));
            }

            let mut records = self.records.write().await;
            let mut affected = 0;
            for record in records.values_mut().filter(|record| filter.matches(record)) {
                update.apply(record);
                affected += 1;
            }
            Ok(affected)
        })
    }

    fn claim_candidate<'a>(
        &'a self,
        topics: &'a TopicSet,
        owner: OwnerId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Option<ClaimedRecord>> {
        Box::pin(async move {
            self.check_fault(StoreOperation::ClaimCandidate).await?;

            let mut records = self.records.write().await;
            let Some(record) = records
                .values_mut()
                .filter(|record| claimable(record, topics))
                .choose(&mut rand::thread_rng())
            else {
                return Ok(None);
            };

            let redelivered = record.requeued;
            RecordUpdate::claim(owner, now).apply(record);
            Ok(Some(ClaimedRecord { record: record.clone(), redelivered }))
        })
    }
}
