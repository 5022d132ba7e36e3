//! Property-based tests for identifiers, predicates and updates.
//!
//! Uses deterministic, in-memory testing without external dependencies.

use chrono::{DateTime, Duration, TimeZone, Utc};
use leaseq_core::{OwnerId, Record, RecordFilter, RecordId, RecordUpdate, TopicSet};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};
use uuid::Uuid;

fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 100,
        failure_persistence: None,
        source_file: None,
        ..ProptestConfig::default()
    }
}

fn timestamp_strategy() -> impl Strategy<Value = DateTime<Utc>> {
    (1_600_000_000i64..1_900_000_000).prop_map(|secs| Utc.timestamp_opt(secs, 0).unwrap())
}

fn owner_strategy() -> impl Strategy<Value = OwnerId> {
    prop::sample::select(vec![
        OwnerId(Uuid::from_u128(1)),
        OwnerId(Uuid::from_u128(2)),
        OwnerId(Uuid::from_u128(3)),
    ])
}

/// Arbitrary record state, including states only reachable through races.
fn record_strategy() -> impl Strategy<Value = Record> {
    (
        prop::collection::vec(any::<u8>(), 0..64),
        prop::option::of(prop::sample::select(vec!["t1".to_string(), "t2".to_string()])),
        any::<bool>(),
        owner_strategy(),
        timestamp_strategy(),
        any::<bool>(),
    )
        .prop_map(|(payload, topic, in_progress, owner, lease, requeued)| {
            let mut record = Record::new(payload, topic, lease);
            record.in_progress = in_progress;
            record.owner = in_progress.then_some(owner);
            record.requeued = requeued;
            record
        })
}

fn filter_strategy() -> impl Strategy<Value = RecordFilter> {
    (
        prop::option::of(any::<bool>()),
        prop::option::of(owner_strategy()),
        prop::option::of(any::<bool>()),
        prop::option::of(timestamp_strategy()),
    )
        .prop_map(|(in_progress, owner, requeued, lease_before)| RecordFilter {
            in_progress,
            owner,
            requeued,
            lease_before,
        })
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn digest_is_deterministic_and_hex(payload in prop::collection::vec(any::<u8>(), 0..512)) {
        let a = RecordId::from_payload(&payload);
        let b = RecordId::from_payload(&payload);

        prop_assert_eq!(&a, &b);
        prop_assert_eq!(a.as_str().len(), 64);
        prop_assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn distinct_payloads_get_distinct_ids(
        a in prop::collection::vec(any::<u8>(), 0..64),
        b in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        prop_assume!(a != b);
        prop_assert_ne!(RecordId::from_payload(&a), RecordId::from_payload(&b));
    }

    #[test]
    fn filter_is_conjunction_of_constraints(record in record_strategy(), filter in filter_strategy()) {
        let expected = filter.in_progress.map_or(true, |v| record.in_progress == v)
            && filter.owner.map_or(true, |o| record.owner == Some(o))
            && filter.requeued.map_or(true, |v| record.requeued == v)
            && filter.lease_before.map_or(true, |c| record.lease_timestamp < c);

        prop_assert_eq!(filter.matches(&record), expected);
    }

    #[test]
    fn claim_always_yields_held_record(record in record_strategy(), owner in owner_strategy(), now in timestamp_strategy()) {
        let mut claimed = record.clone();
        RecordUpdate::claim(owner, now).apply(&mut claimed);

        prop_assert!(RecordFilter::held_by(owner).matches(&claimed));
        prop_assert!(!claimed.requeued);
        prop_assert_eq!(claimed.id, record.id);
        prop_assert_eq!(claimed.payload, record.payload);
    }

    #[test]
    fn released_records_are_available(record in record_strategy()) {
        for update in [RecordUpdate::requeue(), RecordUpdate::release_stale()] {
            let mut released = record.clone();
            update.apply(&mut released);

            prop_assert!(RecordFilter::available().matches(&released));
            prop_assert_eq!(released.owner, None);
            prop_assert_eq!(released.lease_timestamp, record.lease_timestamp);
        }
    }

    #[test]
    fn expired_filter_agrees_with_record_lease_check(
        record in record_strategy(),
        now in timestamp_strategy(),
        lifetime_secs in 1u64..3600,
    ) {
        let lifetime = std::time::Duration::from_secs(lifetime_secs);
        let cutoff = now - Duration::seconds(lifetime_secs as i64);

        prop_assert_eq!(
            RecordFilter::lease_expired(cutoff).matches(&record),
            record.lease_expired(now, lifetime)
        );
    }

    #[test]
    fn topic_admission(topic in prop::option::of("[a-z]{1,8}"), subscribed in prop::collection::btree_set("[a-z]{1,8}", 0..4)) {
        let topics: TopicSet = subscribed.iter().cloned().collect();
        let admitted = topics.admits(topic.as_deref());

        match topic {
            None => prop_assert!(admitted),
            Some(t) => prop_assert_eq!(admitted, subscribed.contains(&t)),
        }
    }
}
