//! Worker controller: owns the claim and reclaim loops.
//!
//! The controller holds no work itself; everything lives in the store. It
//! owns the session identity stamped on every claim, the two repeating
//! loops, and the sending half of the event channel.

use std::sync::Arc;

use bytes::Bytes;
use leaseq_core::{Clock, OwnerId, Store};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
    config::WorkerConfig,
    error::{Result, WorkerError},
    events::{EventReceiver, EventSink},
    lease::LeaseContext,
    producer::{Producer, SendOutcome},
    reclaimer::StaleLeaseReclaimer,
    scanner::ClaimScanner,
    timer::RepeatingTask,
};

/// Whether the background loops are running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No loop is scheduled.
    Idle,

    /// Both loops are scheduled.
    Polling,
}

struct Loops {
    scanner: RepeatingTask,
    reclaimer: RepeatingTask,
}

/// Queue worker bound to one store and one session identity.
///
/// Created idle. [`Worker::listen`] starts the claim scanner and the
/// stale-lease reclaimer; claimed records and errors arrive on the
/// [`EventReceiver`] returned by [`Worker::new`].
pub struct Worker {
    config: WorkerConfig,
    ctx: Arc<LeaseContext>,
    scanner: Arc<ClaimScanner>,
    reclaimer: Arc<StaleLeaseReclaimer>,
    producer: Producer,
    loops: Option<Loops>,
}

impl Worker {
    /// Creates an idle worker and the receiver for its events.
    ///
    /// A fresh owner identity is generated for this instance. No store call
    /// is made here.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::Configuration` if `config` is invalid.
    pub fn new(
        store: Arc<dyn Store>,
        config: WorkerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, EventReceiver)> {
        config.validate()?;
        let lease_lifetime = config.lease_lifetime_chrono()?;

        let (events, receiver) = EventSink::channel(config.event_buffer);
        let ctx = Arc::new(LeaseContext {
            store: store.clone(),
            clock: clock.clone(),
            owner: OwnerId::new(),
            events: events.clone(),
        });

        let scanner = Arc::new(ClaimScanner::new(ctx.clone(), config.topics.clone()));
        let reclaimer =
            Arc::new(StaleLeaseReclaimer::new(store.clone(), clock.clone(), lease_lifetime, events));
        let producer = Producer::new(store, clock, config.max_send_cycles)?;

        info!(
            owner = %ctx.owner,
            topics = ?config.topics,
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            lease_lifetime_ms = config.lease_lifetime.as_millis() as u64,
            "worker created"
        );

        Ok((Self { config, ctx, scanner, reclaimer, producer, loops: None }, receiver))
    }

    /// Session identity stamped on every record this worker claims.
    pub fn owner(&self) -> OwnerId {
        self.ctx.owner
    }

    /// Configuration the worker was built with.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Current loop state.
    pub fn state(&self) -> WorkerState {
        if self.loops.is_some() {
            WorkerState::Polling
        } else {
            WorkerState::Idle
        }
    }

    /// Starts both loops. Does nothing if they are already running.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn listen(&mut self) {
        if self.loops.is_some() {
            return;
        }

        let scanner = self.scanner.clone();
        let scanner = RepeatingTask::spawn("claim_scanner", self.config.poll_interval, move || {
            let scanner = scanner.clone();
            async move {
                scanner.tick().await;
            }
        });

        let reclaimer = self.reclaimer.clone();
        let reclaimer =
            RepeatingTask::spawn("stale_reclaimer", self.config.reclaim_interval, move || {
                let reclaimer = reclaimer.clone();
                async move { reclaimer.tick().await }
            });

        self.loops = Some(Loops { scanner, reclaimer });
        info!(owner = %self.ctx.owner, "worker polling");
    }

    /// Cancels both loops. A tick already in progress still completes and
    /// may still emit its event. Does nothing when idle.
    pub fn pause_polling(&mut self) {
        if let Some(loops) = self.loops.take() {
            loops.scanner.cancel();
            loops.reclaimer.cancel();
            info!(owner = %self.ctx.owner, "worker paused");
        }
    }

    /// Restarts both loops after a pause. Does nothing while polling.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn resume_polling(&mut self) {
        self.listen();
    }

    /// Runs one claim scan immediately, independent of the loop.
    ///
    /// A claimed record is emitted as a data event, a store failure as an
    /// error event. Returns whether a record was claimed.
    pub async fn check_now(&self) -> bool {
        self.scanner.tick().await
    }

    /// Runs one stale-lease pass immediately, returning how many leases
    /// were released.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::Store` if the bulk update fails.
    pub async fn reclaim_now(&self) -> Result<u64> {
        self.reclaimer.reclaim().await
    }

    /// Producer sharing this worker's store and clock.
    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    /// Sends a payload through this worker's producer.
    ///
    /// Store failures are returned and also reported on the event channel;
    /// an exhausted send is only returned.
    ///
    /// # Errors
    ///
    /// As [`Producer::send`].
    pub async fn send(&self, payload: impl Into<Bytes>, topic: Option<&str>) -> Result<SendOutcome> {
        let result = self.producer.send(payload, topic).await;
        self.report_send_failure(result)
    }

    /// Sends a value as JSON through this worker's producer.
    ///
    /// # Errors
    ///
    /// As [`Producer::send_json`].
    pub async fn send_json<T: Serialize + ?Sized>(
        &self,
        value: &T,
        topic: Option<&str>,
    ) -> Result<SendOutcome> {
        let result = self.producer.send_json(value, topic).await;
        self.report_send_failure(result)
    }

    fn report_send_failure(&self, result: Result<SendOutcome>) -> Result<SendOutcome> {
        if let Err(error @ WorkerError::Store { .. }) = &result {
            self.ctx.events.error(error.clone());
        }
        result
    }

    /// Stops both loops and waits for in-flight ticks to finish.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::ShutdownTimeout` if the loops do not stop
    /// within the configured shutdown timeout.
    pub async fn shutdown(mut self) -> Result<()> {
        let Some(loops) = self.loops.take() else {
            info!(owner = %self.ctx.owner, "worker was idle, shutdown completed immediately");
            return Ok(());
        };

        let timeout = self.config.shutdown_timeout;
        info!(owner = %self.ctx.owner, timeout_ms = timeout.as_millis() as u64, "shutting down worker");

        let stop_all = async {
            for task in [loops.scanner, loops.reclaimer] {
                let name = task.name();
                if let Err(join_error) = task.stop().await {
                    error!(task = name, error = %join_error, "loop panicked during shutdown");
                }
            }
        };

        match tokio::time::timeout(timeout, stop_all).await {
            Ok(()) => {
                info!(owner = %self.ctx.owner, "worker shutdown completed");
                Ok(())
            },
            Err(_elapsed) => {
                error!(timeout_ms = timeout.as_millis() as u64, "worker shutdown timed out");
                Err(WorkerError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(loops) = self.loops.take() {
            let running = [&loops.scanner, &loops.reclaimer]
                .iter()
                .filter(|task| !task.is_finished())
                .count();
            warn!(
                owner = %self.ctx.owner,
                running,
                "worker dropped while polling, cancelling loops; call shutdown() for a clean stop"
            );
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("owner", &self.ctx.owner)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
