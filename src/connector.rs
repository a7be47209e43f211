//! Protocol connectors
//!
//! A [`Connector`] is what the local IMAP server holds for one mailbox
//! namespace: an ordered stream of updates to apply, plus the write
//! path back to the remote service for changes made by mail clients.

use crate::error::{Error, Result};
use crate::mode::AddressMode;
use crate::remote::{Address, RemoteClient, labels};
use crate::update::Update;
use futures::Stream;
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Session state shared by every connector of a session.
#[derive(Clone)]
pub(crate) struct ConnectorContext {
    pub(crate) client: Arc<dyn RemoteClient>,
    pub(crate) bridge_pass: String,
    pub(crate) addresses: Arc<RwLock<Vec<Address>>>,
}

/// Consumer side of one namespace's update queue.
#[derive(Clone)]
pub struct Connector {
    address_id: String,
    mode: AddressMode,
    updates: Arc<Mutex<mpsc::UnboundedReceiver<Update>>>,
    token: CancellationToken,
    ctx: ConnectorContext,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("address_id", &self.address_id)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Connector {
    pub(crate) fn new(
        address_id: String,
        mode: AddressMode,
        updates: Arc<Mutex<mpsc::UnboundedReceiver<Update>>>,
        token: CancellationToken,
        ctx: ConnectorContext,
    ) -> Self {
        Self {
            address_id,
            mode,
            updates,
            token,
            ctx,
        }
    }

    /// Address keying this namespace (the primary address in combined
    /// mode).
    #[must_use]
    pub fn address_id(&self) -> &str {
        &self.address_id
    }

    /// Addresses served by this namespace.
    #[must_use]
    pub fn emails(&self) -> Vec<String> {
        let addresses = self
            .ctx
            .addresses
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        addresses
            .iter()
            .filter(|a| self.mode == AddressMode::Combined || a.id == self.address_id)
            .map(|a| a.email.clone())
            .collect()
    }

    /// Check credentials presented by a local mail client.
    #[must_use]
    pub fn authorize(&self, username: &str, password: &[u8]) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        let known = self
            .emails()
            .iter()
            .any(|email| email.eq_ignore_ascii_case(username));
        known && password == self.ctx.bridge_pass.as_bytes()
    }

    /// Whether this connector's generation has been torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Next update in delivery order, or `None` once the connector is
    /// torn down.
    pub async fn next_update(&self) -> Option<Update> {
        let mut updates = tokio::select! {
            biased;
            () = self.token.cancelled() => return None,
            guard = self.updates.lock() => guard,
        };
        tokio::select! {
            biased;
            () = self.token.cancelled() => None,
            update = updates.recv() => update,
        }
    }

    pub fn updates(&self) -> impl Stream<Item = Update> + use<> {
        futures::stream::unfold(self.clone(), |connector| async move {
            let update = connector.next_update().await?;
            Some((update, connector))
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(Error::Terminated)
        } else {
            Ok(())
        }
    }

    pub async fn mark_messages_seen(&self, ids: &[String], seen: bool) -> Result<()> {
        self.ensure_open()?;
        debug!("Marking {} message(s) seen={}", ids.len(), seen);
        if seen {
            self.ctx.client.mark_messages_read(ids).await
        } else {
            self.ctx.client.mark_messages_unread(ids).await
        }
    }

    pub async fn mark_messages_flagged(&self, ids: &[String], flagged: bool) -> Result<()> {
        self.ensure_open()?;
        debug!("Marking {} message(s) flagged={}", ids.len(), flagged);
        if flagged {
            self.ctx.client.label_messages(ids, labels::STARRED).await
        } else {
            self.ctx.client.unlabel_messages(ids, labels::STARRED).await
        }
    }

    pub async fn add_messages_to_mailbox(&self, ids: &[String], mailbox_id: &str) -> Result<()> {
        self.ensure_open()?;
        self.ctx.client.label_messages(ids, mailbox_id).await
    }

    pub async fn remove_messages_from_mailbox(
        &self,
        ids: &[String],
        mailbox_id: &str,
    ) -> Result<()> {
        self.ensure_open()?;
        if mailbox_id == labels::ALL_MAIL {
            return Err(Error::Remote("Messages cannot leave All Mail".into()));
        }
        self.ctx.client.unlabel_messages(ids, mailbox_id).await
    }
}
