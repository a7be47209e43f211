//! Local mailbox state rebuilt from connector updates
//!
//! A [`LocalView`] is the simplest possible consumer of a connector: it
//! applies every update to an in-memory model. Applying the same update
//! twice leaves the view unchanged, so it tolerates the redelivery that
//! follows an abandoned batch.

use crate::update::{Mailbox, Message, UpdateKind};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LocalView {
    mailboxes: BTreeMap<String, Mailbox>,
    messages: BTreeMap<String, Message>,
}

impl LocalView {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, update: &UpdateKind) {
        match update {
            UpdateKind::MailboxCreated(mailbox) => {
                self.mailboxes.insert(mailbox.id.clone(), mailbox.clone());
            }
            UpdateKind::MailboxUpdated { id, name } => {
                if let Some(mailbox) = self.mailboxes.get_mut(id) {
                    mailbox.name.clone_from(name);
                }
            }
            UpdateKind::MailboxDeleted { id } => {
                self.mailboxes.remove(id);
                for message in self.messages.values_mut() {
                    message.mailbox_ids.retain(|m| m != id);
                }
            }
            UpdateKind::MessagesCreated(messages) => {
                for message in messages {
                    self.messages.insert(message.id.clone(), message.clone());
                }
            }
            UpdateKind::MessageUpdated {
                id,
                mailbox_ids,
                seen,
                flagged,
            } => {
                if let Some(message) = self.messages.get_mut(id) {
                    message.mailbox_ids.clone_from(mailbox_ids);
                    message.seen = *seen;
                    message.flagged = *flagged;
                }
            }
            UpdateKind::MessageDeleted { id } => {
                self.messages.remove(id);
            }
        }
    }

    pub fn mailboxes(&self) -> impl Iterator<Item = &Mailbox> {
        self.mailboxes.values()
    }

    #[must_use]
    pub fn mailbox_names(&self) -> Vec<String> {
        self.mailboxes.values().map(|m| m.name.join("/")).collect()
    }

    #[must_use]
    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.get(id)
    }

    /// Messages in ascending id order.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.values()
    }

    /// Messages filed in `mailbox_id`.
    pub fn messages_in<'a>(&'a self, mailbox_id: &'a str) -> impl Iterator<Item = &'a Message> {
        self.messages
            .values()
            .filter(move |m| m.mailbox_ids.iter().any(|id| id == mailbox_id))
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn unread_count(&self) -> usize {
        self.messages.values().filter(|m| !m.seen).count()
    }
}
