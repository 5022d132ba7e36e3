//! Match predicates and field updates for conditional writes.
//!
//! A [`RecordFilter`] is a conjunction of optional column constraints; a
//! [`RecordUpdate`] is a set of optional column assignments. Both are plain
//! data so every store renders them the same way: the in-memory store
//! evaluates them directly, the PostgreSQL store binds them as parameters.

use chrono::{DateTime, Utc};

use crate::models::{OwnerId, Record};

/// Conjunction of column constraints a record must satisfy.
///
/// Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    /// Required `in_progress` value.
    pub in_progress: Option<bool>,

    /// Required leaseholder.
    pub owner: Option<OwnerId>,

    /// Required `requeued` value.
    pub requeued: Option<bool>,

    /// Matches records whose lease timestamp is strictly before this
    /// instant.
    pub lease_before: Option<DateTime<Utc>>,
}

impl RecordFilter {
    /// Records no worker currently holds.
    pub fn available() -> Self {
        Self { in_progress: Some(false), ..Self::default() }
    }

    /// Records currently held by any worker.
    pub fn in_progress() -> Self {
        Self { in_progress: Some(true), ..Self::default() }
    }

    /// Records currently held by `owner`.
    pub fn held_by(owner: OwnerId) -> Self {
        Self { in_progress: Some(true), owner: Some(owner), ..Self::default() }
    }

    /// Records that have not been flagged for redelivery.
    pub fn not_requeued() -> Self {
        Self { requeued: Some(false), ..Self::default() }
    }

    /// Held records whose last heartbeat is older than `cutoff`.
    pub fn lease_expired(cutoff: DateTime<Utc>) -> Self {
        Self { in_progress: Some(true), lease_before: Some(cutoff), ..Self::default() }
    }

    /// Whether no constraint is set.
    pub fn is_unconstrained(&self) -> bool {
        self == &Self::default()
    }

    /// Evaluates the filter against a record.
    pub fn matches(&self, record: &Record) -> bool {
        self.in_progress.map_or(true, |v| record.in_progress == v)
            && self.owner.map_or(true, |owner| record.owner == Some(owner))
            && self.requeued.map_or(true, |v| record.requeued == v)
            && self.lease_before.map_or(true, |cutoff| record.lease_timestamp < cutoff)
    }
}

/// Column assignments applied by a conditional write.
///
/// Unset fields are left untouched. `owner: Some(None)` clears the owner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    /// New `in_progress` value.
    pub in_progress: Option<bool>,

    /// New leaseholder; `Some(None)` clears it.
    pub owner: Option<Option<OwnerId>>,

    /// New `requeued` value.
    pub requeued: Option<bool>,

    /// New lease timestamp.
    pub lease_timestamp: Option<DateTime<Utc>>,
}

impl RecordUpdate {
    /// Takes the lease for `owner` and consumes any pending redelivery
    /// flag.
    pub fn claim(owner: OwnerId, now: DateTime<Utc>) -> Self {
        Self {
            in_progress: Some(true),
            owner: Some(Some(owner)),
            requeued: Some(false),
            lease_timestamp: Some(now),
        }
    }

    /// Refreshes the lease timestamp.
    pub fn renew_lease(now: DateTime<Utc>) -> Self {
        Self { lease_timestamp: Some(now), ..Self::default() }
    }

    /// Releases ownership and flags the record for redelivery.
    pub fn requeue() -> Self {
        Self {
            in_progress: Some(false),
            owner: Some(None),
            requeued: Some(true),
            lease_timestamp: None,
        }
    }

    /// Forcibly releases an expired lease.
    pub fn release_stale() -> Self {
        Self {
            in_progress: Some(false),
            owner: Some(None),
            requeued: Some(false),
            lease_timestamp: None,
        }
    }

    /// Flags an in-flight record so it is delivered again after the
    /// current attempt.
    pub fn flag_redelivery() -> Self {
        Self { requeued: Some(true), ..Self::default() }
    }

    /// Whether the update assigns nothing.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Applies the assignments to a record in place.
    pub fn apply(&self, record: &mut Record) {
        if let Some(in_progress) = self.in_progress {
            record.in_progress = in_progress;
        }
        if let Some(owner) = self.owner {
            record.owner = owner;
        }
        if let Some(requeued) = self.requeued {
            record.requeued = requeued;
        }
        if let Some(lease_timestamp) = self.lease_timestamp {
            record.lease_timestamp = lease_timestamp;
        }
    }
}
