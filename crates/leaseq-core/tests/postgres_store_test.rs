//! Integration tests for the PostgreSQL store.
//!
//! Run only when `DATABASE_URL` points at a disposable database. Each test
//! recreates its own table, and tests are serialised so they never observe
//! each other's rows.

use std::collections::HashSet;

use chrono::{Duration, Utc};
use leaseq_core::{
    storage::PostgresStore, InsertOutcome, OwnerId, Record, RecordFilter, RecordUpdate, Store,
    TopicSet,
};
use serial_test::serial;

const TABLE: &str = "leaseq_store_test";

async fn store() -> anyhow::Result<Option<PostgresStore>> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping PostgreSQL test");
        return Ok(None);
    };

    let store = PostgresStore::connect(&url, TABLE).await?;
    sqlx::query(&format!("DROP TABLE IF EXISTS {TABLE}")).execute(&*store.pool()).await?;
    store.migrate().await?;
    Ok(Some(store))
}

#[tokio::test]
#[serial]
async fn migrate_is_idempotent() -> anyhow::Result<()> {
    let Some(store) = store().await? else { return Ok(()) };

    store.migrate().await?;
    store.health_check().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn insert_conflicts_on_duplicate_payload() -> anyhow::Result<()> {
    let Some(store) = store().await? else { return Ok(()) };

    let record = Record::new(&b"A"[..], Some("t1".into()), Utc::now());
    assert_eq!(store.insert(&record).await?, InsertOutcome::Inserted);

    let same_payload = Record::new(&b"A"[..], Some("t2".into()), Utc::now());
    assert_eq!(store.insert(&same_payload).await?, InsertOutcome::Conflict);
    Ok(())
}

#[tokio::test]
#[serial]
async fn claim_round_trip() -> anyhow::Result<()> {
    let Some(store) = store().await? else { return Ok(()) };

    let mut record = Record::new(&b"redeliver me"[..], None, Utc::now());
    record.requeued = true;
    store.insert(&record).await?;

    let owner = OwnerId::new();
    let claimed = store
        .claim_candidate(&TopicSet::new(), owner, Utc::now())
        .await?
        .expect("record should be claimable");

    assert!(claimed.redelivered);
    assert_eq!(claimed.record.id, record.id);
    assert_eq!(claimed.record.payload, record.payload);
    assert_eq!(claimed.record.owner, Some(owner));
    assert!(claimed.record.in_progress);
    assert!(!claimed.record.requeued);

    assert!(store.claim_candidate(&TopicSet::new(), owner, Utc::now()).await?.is_none());
    Ok(())
}

#[tokio::test]
#[serial]
async fn claim_respects_topics() -> anyhow::Result<()> {
    let Some(store) = store().await? else { return Ok(()) };

    store.insert(&Record::new(&b"for t2"[..], Some("t2".into()), Utc::now())).await?;
    let topics: TopicSet = ["t1"].into_iter().collect();
    assert!(store.select_candidate(&topics).await?.is_none());
    assert!(store.claim_candidate(&topics, OwnerId::new(), Utc::now()).await?.is_none());

    store.insert(&Record::new(&b"for t1"[..], Some("t1".into()), Utc::now())).await?;
    let claimed = store.claim_candidate(&topics, OwnerId::new(), Utc::now()).await?;
    assert_eq!(claimed.map(|c| c.record.topic), Some(Some("t1".to_string())));
    Ok(())
}

#[tokio::test]
#[serial]
async fn concurrent_claims_are_exclusive() -> anyhow::Result<()> {
    let Some(store) = store().await? else { return Ok(()) };

    for i in 0..10 {
        store.insert(&Record::new(format!("job-{i}").into_bytes(), None, Utc::now())).await?;
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let owner = OwnerId::new();
            let mut ids = Vec::new();
            for _ in 0..10 {
                if let Ok(Some(c)) = store.claim_candidate(&TopicSet::new(), owner, Utc::now()).await
                {
                    ids.push(c.record.id);
                }
            }
            ids
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await? {
            assert!(seen.insert(id), "record claimed twice");
        }
    }
    Ok(())
}

#[tokio::test]
#[serial]
async fn conditional_writes_report_affected_rows() -> anyhow::Result<()> {
    let Some(store) = store().await? else { return Ok(()) };

    let now = Utc::now();
    let owner = OwnerId::new();
    store.insert(&Record::new(&b"work"[..], None, now)).await?;
    let claimed = store.claim_candidate(&TopicSet::new(), owner, now).await?.expect("claimable");
    let id = claimed.record.id;

    let renew = RecordUpdate::renew_lease(now + Duration::seconds(5));
    assert_eq!(store.conditional_update(&id, &RecordFilter::held_by(OwnerId::new()), &renew).await?, 0);
    assert_eq!(store.conditional_update(&id, &RecordFilter::held_by(owner), &renew).await?, 1);

    let flag = RecordUpdate::flag_redelivery();
    assert_eq!(store.conditional_update(&id, &RecordFilter::in_progress(), &flag).await?, 1);
    assert_eq!(store.delete(&id, &RecordFilter::not_requeued()).await?, 0);

    assert_eq!(store.conditional_update(&id, &RecordFilter::default(), &RecordUpdate::requeue()).await?, 1);
    let requeued = store.select_candidate(&TopicSet::new()).await?.expect("available again");
    assert!(requeued.requeued);
    assert_eq!(requeued.owner, None);

    assert_eq!(store.delete(&id, &RecordFilter::default()).await?, 1);
    assert!(store.select_candidate(&TopicSet::new()).await?.is_none());
    Ok(())
}

#[tokio::test]
#[serial]
async fn expired_leases_are_released() -> anyhow::Result<()> {
    let Some(store) = store().await? else { return Ok(()) };

    let now = Utc::now();
    store.insert(&Record::new(&b"stale"[..], None, now)).await?;
    store.claim_candidate(&TopicSet::new(), OwnerId::new(), now - Duration::seconds(120)).await?;

    let fresh_cutoff = now - Duration::seconds(180);
    let released = store
        .bulk_conditional_update(&RecordFilter::lease_expired(fresh_cutoff), &RecordUpdate::release_stale())
        .await?;
    assert_eq!(released, 0);

    let cutoff = now - Duration::seconds(60);
    let released = store
        .bulk_conditional_update(&RecordFilter::lease_expired(cutoff), &RecordUpdate::release_stale())
        .await?;
    assert_eq!(released, 1);
    assert!(store.select_candidate(&TopicSet::new()).await?.is_some());
    Ok(())
}

#[tokio::test]
#[serial]
async fn claims_spread_across_candidates() -> anyhow::Result<()> {
    let Some(store) = store().await? else { return Ok(()) };

    for payload in ["a", "b", "c"] {
        store.insert(&Record::new(payload.as_bytes(), None, Utc::now())).await?;
    }

    let owner = OwnerId::new();
    let mut seen = HashSet::new();
    for _ in 0..150 {
        let claimed = store
            .claim_candidate(&TopicSet::new(), owner, Utc::now())
            .await?
            .expect("a candidate is always available");
        let released = store
            .conditional_update(
                &claimed.record.id,
                &RecordFilter::held_by(owner),
                &RecordUpdate::release_stale(),
            )
            .await?;
        assert_eq!(released, 1);
        seen.insert(claimed.record.id);
    }

    assert_eq!(seen.len(), 3, "claims always landed on the same rows: {seen:?}");
    Ok(())
}
