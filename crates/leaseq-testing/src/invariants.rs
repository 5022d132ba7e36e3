//! Checks for the protocol invariants over a store snapshot.

use std::collections::HashSet;

use anyhow::{ensure, Result};
use chrono::{DateTime, Utc};
use leaseq_core::{OwnerId, Record, RecordId};

/// Protocol invariants that must hold for any reachable store state.
pub struct Invariants;

impl Invariants {
    /// Identifiers are unique and always equal the payload digest.
    pub fn content_addressed(records: &[Record]) -> Result<()> {
        let mut seen = HashSet::new();
        for record in records {
            ensure!(seen.insert(&record.id), "duplicate record {}", record.id);
            ensure!(
                record.id == RecordId::from_payload(&record.payload),
                "record {} does not match its payload digest",
                record.id
            );
        }
        Ok(())
    }

    /// A held record has an owner; a released one has none.
    pub fn ownership_consistent(records: &[Record]) -> Result<()> {
        for record in records {
            ensure!(
                record.in_progress == record.owner.is_some(),
                "record {} has in_progress={} but owner={:?}",
                record.id,
                record.in_progress,
                record.owner
            );
        }
        Ok(())
    }

    /// No record is held longer than `lifetime` without a heartbeat.
    ///
    /// Only holds right after a reclaim pass at `now`.
    pub fn no_stale_leases(
        records: &[Record],
        now: DateTime<Utc>,
        lifetime: std::time::Duration,
    ) -> Result<()> {
        for record in records {
            ensure!(
                !record.lease_expired(now, lifetime),
                "record {} still holds a lease from {}",
                record.id,
                record.lease_timestamp
            );
        }
        Ok(())
    }

    /// None of `records` is held by `owner`.
    pub fn not_held_by(records: &[Record], owner: OwnerId) -> Result<()> {
        for record in records {
            ensure!(record.owner != Some(owner), "record {} still held by {}", record.id, owner);
        }
        Ok(())
    }

    /// Every identifier in `expected` is still present in `records`.
    pub fn none_lost(records: &[Record], expected: &[RecordId]) -> Result<()> {
        let present: HashSet<&RecordId> = records.iter().map(|r| &r.id).collect();
        for id in expected {
            ensure!(present.contains(id), "record {id} was lost");
        }
        Ok(())
    }

    /// Runs every snapshot-only invariant.
    pub fn check_all(records: &[Record]) -> Result<()> {
        Self::content_addressed(records)?;
        Self::ownership_consistent(records)
    }
}
