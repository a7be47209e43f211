//! Updates delivered to protocol connectors
//!
//! Every [`Update`] carries an [`Ack`]. Acknowledging consumes it, so
//! an update can be acknowledged at most once; dropping it without
//! acknowledging abandons the update, and the bridge will not advance
//! the position of the source that produced it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;

/// A mailbox as seen by the local protocol server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mailbox {
    /// Remote label id.
    pub id: String,
    /// Hierarchical name, e.g. `["Folders", "Work"]`.
    pub name: Vec<String>,
    /// Placeholder parents cannot hold messages.
    pub selectable: bool,
}

/// A message as seen by the local protocol server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: String,
    pub address_id: String,
    pub mailbox_ids: Vec<String>,
    pub seen: bool,
    pub flagged: bool,
    pub subject: String,
    pub sender: String,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdateKind {
    MailboxCreated(Mailbox),
    MailboxUpdated {
        id: String,
        name: Vec<String>,
    },
    MailboxDeleted {
        id: String,
    },
    /// Applied as an upsert: messages the connector already knows are
    /// replaced, not duplicated.
    MessagesCreated(Vec<Message>),
    MessageUpdated {
        id: String,
        mailbox_ids: Vec<String>,
        seen: bool,
        flagged: bool,
    },
    MessageDeleted {
        id: String,
    },
}

/// What the connector reports back for one update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Failed(String),
}

/// Completion token of one update.
#[derive(Debug)]
#[must_use = "dropping an Ack abandons its update"]
pub struct Ack {
    tx: oneshot::Sender<Outcome>,
}

impl Ack {
    /// Report that the update was applied.
    pub fn done(self) {
        let _ = self.tx.send(Outcome::Applied);
    }

    /// Report that the update was processed but could not be applied.
    pub fn fail(self, reason: impl Into<String>) {
        let _ = self.tx.send(Outcome::Failed(reason.into()));
    }
}

/// Receiving half of an [`Ack`], held by the propagator.
#[derive(Debug)]
pub(crate) struct Pending {
    rx: oneshot::Receiver<Outcome>,
}

impl Pending {
    /// Wait for the acknowledgement. `None` if the update was dropped.
    pub(crate) async fn wait(self) -> Option<Outcome> {
        self.rx.await.ok()
    }
}

/// One unit of change for a connector.
#[derive(Debug)]
#[must_use = "an Update must be acknowledged with done() or fail()"]
pub struct Update {
    kind: UpdateKind,
    ack: Ack,
}

impl Update {
    pub(crate) fn new(kind: UpdateKind) -> (Self, Pending) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                kind,
                ack: Ack { tx },
            },
            Pending { rx },
        )
    }

    #[must_use]
    pub const fn kind(&self) -> &UpdateKind {
        &self.kind
    }

    /// Split the update so it can be applied while the token is carried
    /// along separately.
    pub fn into_parts(self) -> (UpdateKind, Ack) {
        (self.kind, self.ack)
    }

    pub fn done(self) {
        self.ack.done();
    }

    pub fn fail(self, reason: impl Into<String>) {
        self.ack.fail(reason);
    }
}
