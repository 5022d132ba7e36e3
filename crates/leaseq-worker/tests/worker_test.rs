//! Worker controller: claim scanning, loops, pause/resume and shutdown.

use std::{sync::Arc, time::Duration};

use leaseq_core::{
    storage::{MemoryStore, StoreOperation},
    ClaimedRecord, Clock, InsertOutcome, OwnerId, Record, RecordFilter, RecordId, RecordUpdate, Store,
    StoreFuture, TestClock, TopicSet,
};
use leaseq_testing::{
    drain, next_delivery, next_error, record_batch, Invariants, RecordBuilder, TestEnv,
};
use leaseq_worker::{Operation, Worker, WorkerConfig, WorkerError, WorkerEvent, WorkerState};
use tokio::sync::Notify;

#[tokio::test]
async fn invalid_config_fails_construction() {
    let env = TestEnv::new();
    let config = WorkerConfig { poll_interval: Duration::ZERO, ..TestEnv::config() };

    let error = Worker::new(env.store(), config, env.clock()).unwrap_err();
    assert!(matches!(error, WorkerError::Configuration { .. }));
}

#[tokio::test]
async fn each_worker_gets_its_own_owner() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let (a, _a_events) = env.worker(TestEnv::config())?;
    let (b, _b_events) = env.worker(TestEnv::config())?;

    assert_ne!(a.owner(), b.owner());
    assert_eq!(a.state(), WorkerState::Idle);
    Ok(())
}

#[tokio::test]
async fn check_now_claims_one_record() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.seed(record_batch(3, None)).await;
    let (worker, mut events) = env.worker(TestEnv::config())?;

    assert!(worker.check_now().await);
    let delivery = next_delivery(&mut events).await?;
    assert_eq!(delivery.owner(), worker.owner());

    let records = env.records().await;
    let held: Vec<_> = records.iter().filter(|r| r.in_progress).collect();
    assert_eq!(held.len(), 1);
    assert_eq!(&held[0].id, delivery.id());
    assert_eq!(held[0].owner, Some(worker.owner()));
    Invariants::check_all(&records)?;
    Ok(())
}

#[tokio::test]
async fn check_now_on_empty_store_emits_nothing() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let (worker, mut events) = env.worker(TestEnv::config())?;

    assert!(!worker.check_now().await);
    assert!(drain(&mut events).is_empty());
    Ok(())
}

#[tokio::test]
async fn scanner_respects_topics() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.seed([
        RecordBuilder::new().payload(&b"other"[..]).topic("t2").build(),
        RecordBuilder::new().payload(&b"untagged"[..]).build(),
        RecordBuilder::new().payload(&b"mine"[..]).topic("t1").build(),
    ])
    .await;

    let config = WorkerConfig { topics: ["t1"].into_iter().collect(), ..TestEnv::config() };
    let (worker, mut events) = env.worker(config)?;

    let mut delivered = Vec::new();
    while worker.check_now().await {
        delivered.push(next_delivery(&mut events).await?.topic().map(str::to_string));
    }

    delivered.sort();
    assert_eq!(delivered, vec![None, Some("t1".to_string())]);
    let remaining = env.store.get(&RecordId::from_payload(b"other")).await.expect("kept");
    assert!(!remaining.in_progress);
    Ok(())
}

#[tokio::test]
async fn claim_failure_is_surfaced_not_retried() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.seed(record_batch(1, None)).await;
    let (worker, mut events) = env.worker(TestEnv::config())?;

    env.store.fail_next(StoreOperation::ClaimCandidate, "connection reset").await;
    assert!(!worker.check_now().await);

    let error = next_error(&mut events).await?;
    assert!(matches!(error, WorkerError::Store { operation: Operation::Claim, .. }));
    assert!(drain(&mut events).is_empty());

    assert!(worker.check_now().await);
    next_delivery(&mut events).await?;
    Ok(())
}

#[tokio::test]
async fn abandoned_record_is_redelivered_to_another_worker() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let config = TestEnv::config();
    env.seed(record_batch(1, None)).await;

    let (first, mut first_events) = env.worker(config.clone())?;
    assert!(first.check_now().await);
    let abandoned = next_delivery(&mut first_events).await?;

    env.advance(Duration::from_secs(1));
    assert!(abandoned.heartbeat().await);
    let t1 = env.store.get(abandoned.id()).await.expect("kept").lease_timestamp;
    env.advance(Duration::from_secs(1));
    assert!(abandoned.heartbeat().await);
    let t2 = env.store.get(abandoned.id()).await.expect("kept").lease_timestamp;
    assert!(t1 < t2);
    drop(first);

    let (second, mut second_events) = env.worker(config.clone())?;
    assert!(!second.check_now().await);
    assert_eq!(second.reclaim_now().await?, 0);

    env.advance(config.lease_lifetime + Duration::from_millis(1));
    assert_eq!(second.reclaim_now().await?, 1);
    Invariants::no_stale_leases(&env.records().await, env.clock.now_utc(), config.lease_lifetime)?;

    assert!(second.check_now().await);
    let redelivered = next_delivery(&mut second_events).await?;
    assert_eq!(redelivered.id(), abandoned.id());
    assert_eq!(redelivered.owner(), second.owner());
    assert!(!redelivered.redelivered());
    Ok(())
}

#[tokio::test]
async fn reclaim_ignores_fresh_leases() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let now = env.clock.now_utc();
    let lifetime = TestEnv::config().lease_lifetime;
    env.seed([
        RecordBuilder::new().payload(&b"stale"[..]).stale(now, lifetime * 2).requeued().build(),
        RecordBuilder::new().payload(&b"fresh"[..]).held_by(OwnerId::new(), now).build(),
        RecordBuilder::new().payload(&b"idle"[..]).build(),
    ])
    .await;
    let (worker, _events) = env.worker(TestEnv::config())?;

    assert_eq!(worker.reclaim_now().await?, 1);

    let stale = env.store.get(&RecordId::from_payload(b"stale")).await.expect("kept");
    assert!(!stale.in_progress);
    assert!(!stale.requeued);
    assert!(env.store.get(&RecordId::from_payload(b"fresh")).await.expect("kept").in_progress);
    Invariants::check_all(&env.records().await)?;
    Ok(())
}

#[tokio::test]
async fn reclaim_failure_is_returned() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let (worker, _events) = env.worker(TestEnv::config())?;

    env.store.fail_next(StoreOperation::BulkConditionalUpdate, "lock timeout").await;
    let error = worker.reclaim_now().await.unwrap_err();
    assert!(matches!(error, WorkerError::Store { operation: Operation::Reclaim, .. }));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn listen_delivers_on_each_poll() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.seed(record_batch(5, None)).await;
    let (mut worker, mut events) = env.worker(TestEnv::config())?;

    worker.listen();
    assert_eq!(worker.state(), WorkerState::Polling);

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(drain(&mut events).len(), 3);

    worker.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn pause_and_resume_are_idempotent() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.seed(record_batch(5, None)).await;
    let (mut worker, mut events) = env.worker(TestEnv::config())?;

    worker.listen();
    worker.listen();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(drain(&mut events).len(), 1);

    worker.pause_polling();
    worker.pause_polling();
    assert_eq!(worker.state(), WorkerState::Idle);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(drain(&mut events).is_empty());

    worker.resume_polling();
    worker.resume_polling();
    assert_eq!(worker.state(), WorkerState::Polling);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(drain(&mut events).len(), 1);

    worker.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reclaim_loop_runs_on_its_own_period() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let lifetime = TestEnv::config().lease_lifetime;
    let now = env.clock.now_utc();
    env.seed([RecordBuilder::new()
        .payload(&b"stale"[..])
        .topic("elsewhere")
        .stale(now, lifetime * 2)
        .build()])
    .await;

    // The scanner only takes untagged records here, so it never claims this one back.
    let config = WorkerConfig { topics: TopicSet::new(), ..TestEnv::config() };
    let (mut worker, _events) = env.worker(config.clone())?;

    worker.listen();
    tokio::time::sleep(config.reclaim_interval / 2).await;
    assert!(env.records().await[0].in_progress);

    tokio::time::sleep(config.reclaim_interval).await;
    assert!(!env.records().await[0].in_progress);

    worker.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn dropped_receiver_stops_claims() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.seed(record_batch(1, None)).await;
    let (worker, events) = env.worker(TestEnv::config())?;
    drop(events);

    assert!(!worker.check_now().await);
    assert!(!env.records().await[0].in_progress);
    Ok(())
}

#[tokio::test]
async fn full_channel_holds_claim_until_caller_catches_up() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.seed(record_batch(2, None)).await;
    let config = WorkerConfig { event_buffer: 1, ..TestEnv::config() };
    let (worker, mut events) = env.worker(config)?;
    let worker = Arc::new(worker);

    assert!(worker.check_now().await);
    let blocked = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.check_now().await })
    };

    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    assert!(!blocked.is_finished());
    assert_eq!(env.records().await.iter().filter(|r| r.in_progress).count(), 1);

    let first = next_delivery(&mut events).await?;
    assert!(blocked.await?);
    let second = next_delivery(&mut events).await?;

    assert_ne!(first.id(), second.id());
    assert!(env.records().await.iter().all(|r| r.in_progress && r.owner == Some(worker.owner())));
    Ok(())
}

#[tokio::test]
async fn tick_waiting_for_room_claims_nothing_once_receiver_drops() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.seed(record_batch(2, None)).await;
    let config = WorkerConfig { event_buffer: 1, ..TestEnv::config() };
    let (worker, events) = env.worker(config)?;
    let worker = Arc::new(worker);

    assert!(worker.check_now().await);
    let blocked = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.check_now().await })
    };
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }

    drop(events);
    assert!(!blocked.await?);
    assert_eq!(env.records().await.iter().filter(|r| r.in_progress).count(), 1);
    Ok(())
}

#[tokio::test]
async fn claim_resolving_after_receiver_drops_is_requeued() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.seed(record_batch(1, None)).await;
    let store = Arc::new(GatedStore::new(env.store.clone()));
    let (worker, events) = Worker::new(store.clone(), TestEnv::config(), env.clock())?;

    let tick = tokio::spawn(async move { worker.check_now().await });
    store.entered.notified().await;

    drop(events);
    store.gate.notify_one();
    assert!(tick.await?);

    let records = env.records().await;
    let record = &records[0];
    assert!(!record.in_progress);
    assert!(record.requeued);
    assert_eq!(record.owner, None);
    Ok(())
}

/// Store whose claims wait until the gate is opened.
struct GatedStore {
    inner: MemoryStore,
    entered: Notify,
    gate: Notify,
}

impl GatedStore {
    fn new(inner: MemoryStore) -> Self {
        Self { inner, entered: Notify::new(), gate: Notify::new() }
    }
}

impl Store for GatedStore {
    fn select_candidate<'a>(&'a self, topics: &'a TopicSet) -> StoreFuture<'a, Option<Record>> {
        self.inner.select_candidate(topics)
    }

    fn conditional_update<'a>(
        &'a self,
        id: &'a RecordId,
        filter: &'a RecordFilter,
        update: &'a RecordUpdate,
    ) -> StoreFuture<'a, u64> {
        self.inner.conditional_update(id, filter, update)
    }

    fn insert<'a>(&'a self, record: &'a Record) -> StoreFuture<'a, InsertOutcome> {
        self.inner.insert(record)
    }

    fn delete<'a>(&'a self, id: &'a RecordId, filter: &'a RecordFilter) -> StoreFuture<'a, u64> {
        self.inner.delete(id, filter)
    }

    fn bulk_conditional_update<'a>(
        &'a self,
        filter: &'a RecordFilter,
        update: &'a RecordUpdate,
    ) -> StoreFuture<'a, u64> {
        self.inner.bulk_conditional_update(filter, update)
    }

    fn claim_candidate<'a>(
        &'a self,
        topics: &'a TopicSet,
        owner: OwnerId,
        now: chrono::DateTime<chrono::Utc>,
    ) -> StoreFuture<'a, Option<ClaimedRecord>> {
        Box::pin(async move {
            self.entered.notify_one();
            self.gate.notified().await;
            self.inner.claim_candidate(topics, owner, now).await
        })
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_times_out_on_stuck_tick() -> anyhow::Result<()> {
    let store = Arc::new(GatedStore::new(MemoryStore::new()));
    let config = WorkerConfig { shutdown_timeout: Duration::from_secs(2), ..TestEnv::config() };
    let (mut worker, _events) = Worker::new(store, config, Arc::new(TestClock::new()))?;

    worker.listen();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let error = worker.shutdown().await.unwrap_err();
    assert!(matches!(error, WorkerError::ShutdownTimeout { timeout } if timeout == Duration::from_secs(2)));
    Ok(())
}

#[tokio::test]
async fn idle_shutdown_is_immediate() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let (worker, _events) = env.worker(TestEnv::config())?;
    worker.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn events_carry_both_kinds() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.seed(record_batch(1, None)).await;
    let (worker, mut events) = env.worker(TestEnv::config())?;

    env.store.fail_next(StoreOperation::ClaimCandidate, "boom").await;
    worker.check_now().await;
    worker.check_now().await;

    let kinds: Vec<&str> = drain(&mut events)
        .iter()
        .map(|event| match event {
            WorkerEvent::Data(_) => "data",
            WorkerEvent::Error(_) => "error",
        })
        .collect();
    assert_eq!(kinds, vec!["error", "data"]);
    Ok(())
}
