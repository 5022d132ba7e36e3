//! Event channel between a worker and its caller.
//!
//! The channel carries exactly two kinds of event: a claimed record ready
//! for processing, and an error. Events arrive in the order their store
//! calls resolved.

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::{delivery::Delivery, error::WorkerError};

/// Receiving half handed to the caller by [`crate::Worker::new`].
pub type EventReceiver = mpsc::Receiver<WorkerEvent>;

/// Notification emitted by a worker.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A record was claimed and is ready for processing.
    Data(Delivery),

    /// A store call or lease check failed.
    Error(WorkerError),
}

/// Sending half shared by the loops and every delivery handle.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::Sender<WorkerEvent>,
}

impl EventSink {
    pub(crate) fn channel(capacity: usize) -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Whether the caller has dropped the receiver.
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Waits for room for one data event.
    ///
    /// Returns `None` if the receiver is gone. Holding the permit keeps the
    /// slot, so whatever is sent through it reaches the caller without
    /// waiting.
    pub(crate) async fn reserve(&self) -> Option<mpsc::Permit<'_, WorkerEvent>> {
        self.tx.reserve().await.ok()
    }

    /// Reports an error without waiting.
    ///
    /// A full or closed channel drops the event; the drop is logged.
    pub(crate) fn error(&self, error: WorkerError) {
        let Err(rejected) = self.tx.try_send(WorkerEvent::Error(error)) else {
            return;
        };

        let reason = match rejected {
            TrySendError::Full(_) => "event channel full",
            TrySendError::Closed(_) => "event receiver closed",
        };
        if let WorkerEvent::Error(error) = rejected.into_inner() {
            warn!(error = %error, reason, "dropping error event");
        }
    }
}
