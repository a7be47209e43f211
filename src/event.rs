//! Session events
//!
//! Each session publishes its state transitions on one bounded, ordered
//! channel. Publishing waits while the channel is full: a consumer that
//! stops reading stalls the session instead of losing events.
//!
//! A sync run normally ends with exactly one `SyncFinished` or
//! `SyncFailed`. A run cut short by close, revocation or a mode switch
//! ends with no terminal event at all; a revoked run is followed by
//! `UserDeauth`.

use crate::mode::AddressMode;
use futures::Stream;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Opens a sync run. See the module docs for how a run ends.
    SyncStarted {
        user_id: String,
    },
    SyncProgress {
        user_id: String,
        /// Fraction in `0.0..=1.0`, never decreasing within a run.
        progress: f64,
        synced: usize,
        total: usize,
        elapsed: Duration,
        remaining: Duration,
    },
    SyncFinished {
        user_id: String,
    },
    SyncFailed {
        user_id: String,
        error: String,
    },
    /// The remote session was revoked; the session is gone for good.
    UserDeauth {
        user_id: String,
    },
    AddressModeChanged {
        user_id: String,
        mode: AddressMode,
    },
}

impl Event {
    #[must_use]
    pub fn user_id(&self) -> &str {
        match self {
            Self::SyncStarted { user_id }
            | Self::SyncProgress { user_id, .. }
            | Self::SyncFinished { user_id }
            | Self::SyncFailed { user_id, .. }
            | Self::UserDeauth { user_id }
            | Self::AddressModeChanged { user_id, .. } => user_id,
        }
    }
}

/// Producer side owned by a session.
#[derive(Debug)]
pub(crate) struct EventBus {
    tx: Mutex<Option<mpsc::Sender<Event>>>,
    rx: EventStream,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
            rx: EventStream {
                rx: Arc::new(Mutex::new(rx)),
            },
        }
    }

    pub(crate) fn stream(&self) -> EventStream {
        self.rx.clone()
    }

    /// Publish `event` unless `scope` is cancelled first.
    ///
    /// Publishers are serialized, so once a scope is cancelled no event
    /// from it can land after events published afterwards by another
    /// scope. Returns whether the event was queued.
    pub(crate) async fn publish(&self, event: Event, scope: &CancellationToken) -> bool {
        let guard = tokio::select! {
            biased;
            () = scope.cancelled() => return false,
            guard = self.tx.lock() => guard,
        };

        let Some(tx) = guard.as_ref() else {
            return false;
        };
        if scope.is_cancelled() {
            return false;
        }

        debug!(?event, "Publishing event");
        tokio::select! {
            biased;
            () = scope.cancelled() => false,
            sent = tx.send(event) => sent.is_ok(),
        }
    }

    /// Drop the sender so readers see the end of the stream once the
    /// queue drains.
    pub(crate) async fn close(&self) {
        self.tx.lock().await.take();
    }
}

/// Read side of a session's events. Clones share one queue: every
/// event is delivered to exactly one reader.
#[derive(Debug, Clone)]
pub struct EventStream {
    rx: Arc<Mutex<mpsc::Receiver<Event>>>,
}

impl EventStream {
    /// Next event, or `None` once the session is closed and drained.
    pub async fn recv(&self) -> Option<Event> {
        self.rx.lock().await.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = Event> {
        futures::stream::unfold(self, |events| async move {
            let event = events.recv().await?;
            Some((event, events))
        })
    }
}
