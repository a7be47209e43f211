//! Remote service interface
//!
//! The bridge talks to the encrypted mail service through
//! [`RemoteClient`], one authenticated handle per account, obtained
//! from a [`RemoteManager`]. Message content stays opaque here: the
//! session core only needs metadata, labels and the change feed.

pub mod memory;

use crate::error::{Error, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Well-known remote label identifiers.
pub mod labels {
    pub const INBOX: &str = "0";
    pub const ALL_DRAFTS: &str = "1";
    pub const ALL_SENT: &str = "2";
    pub const TRASH: &str = "3";
    pub const SPAM: &str = "4";
    pub const ALL_MAIL: &str = "5";
    pub const ARCHIVE: &str = "6";
    pub const SENT: &str = "7";
    pub const DRAFTS: &str = "8";
    pub const STARRED: &str = "10";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub id: String,
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiUser {
    pub id: String,
    pub name: String,
    pub keys: Vec<Key>,
}

impl ApiUser {
    /// The key whose salt derives the mailbox key password.
    #[must_use]
    pub fn primary_key(&self) -> Option<&Key> {
        self.keys
            .iter()
            .find(|k| k.primary)
            .or_else(|| self.keys.first())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub id: String,
    pub email: String,
    /// Display position; the lowest order is the primary address.
    pub order: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelType {
    System,
    Folder,
    Label,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
    /// Slash separated hierarchy, e.g. `Work/Reports`.
    pub path: String,
    pub kind: LabelType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub id: String,
    pub address_id: String,
    pub label_ids: Vec<String>,
    pub subject: String,
    pub sender: String,
    /// Unix timestamp in seconds.
    pub time: i64,
    pub unread: bool,
}

impl MessageMetadata {
    #[must_use]
    pub fn has_label(&self, label_id: &str) -> bool {
        self.label_ids.iter().any(|id| id == label_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salt {
    pub key_id: String,
    /// Base64 encoded.
    pub salt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salts(pub Vec<Salt>);

impl Salts {
    /// Derive the key password for `key_id` from the account password.
    ///
    /// # Errors
    ///
    /// Returns an error if no salt exists for the key, the salt is not
    /// valid base64, or key derivation fails.
    pub fn salt_for_key(&self, password: &[u8], key_id: &str) -> Result<Vec<u8>> {
        let salt = self
            .0
            .iter()
            .find(|s| s.key_id == key_id)
            .ok_or_else(|| Error::Auth(format!("No salt for key {key_id}")))?;

        let raw = STANDARD
            .decode(&salt.salt)
            .map_err(|e| Error::Remote(format!("Invalid salt for key {key_id}: {e}")))?;

        argon2::hash_raw(password, &raw, &argon2::Config::default())
            .map_err(|e| Error::Auth(format!("Key derivation failed: {e}")))
    }
}

/// Tokens returned by a successful authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct Auth {
    pub uid: String,
    pub refresh_token: String,
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("uid", &self.uid)
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// A single remote-side change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RemoteEvent {
    /// The server lost track of our cursor; rebuild everything.
    Refresh,
    User(ApiUser),
    AddressCreated(Address),
    AddressUpdated(Address),
    AddressDeleted(String),
    LabelCreated(Label),
    LabelUpdated(Label),
    LabelDeleted(String),
    MessageCreated(MessageMetadata),
    MessageUpdated(MessageMetadata),
    MessageDeleted(String),
}

/// One page of the remote change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPage {
    /// Cursor to resume from once this page has been applied.
    pub event_id: String,
    pub events: Vec<RemoteEvent>,
    /// More events are immediately available after `event_id`.
    pub more: bool,
}

/// Authenticated channel to the remote service for one account.
///
/// Every call on a revoked client fails with [`Error::Revoked`].
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn get_user(&self) -> Result<ApiUser>;

    /// Addresses in display order.
    async fn get_addresses(&self) -> Result<Vec<Address>>;

    async fn get_salts(&self) -> Result<Salts>;

    async fn get_labels(&self) -> Result<Vec<Label>>;

    async fn count_messages(&self) -> Result<usize>;

    /// Up to `limit` messages with an id greater than `after`, in
    /// ascending id order.
    async fn get_messages(&self, after: Option<&str>, limit: usize)
    -> Result<Vec<MessageMetadata>>;

    async fn get_latest_event_id(&self) -> Result<String>;

    /// Changes recorded after `since`.
    async fn get_events(&self, since: &str) -> Result<EventPage>;

    async fn mark_messages_read(&self, ids: &[String]) -> Result<()>;

    async fn mark_messages_unread(&self, ids: &[String]) -> Result<()>;

    async fn label_messages(&self, ids: &[String], label_id: &str) -> Result<()>;

    async fn unlabel_messages(&self, ids: &[String], label_id: &str) -> Result<()>;

    /// Flips to `true` once the server revokes this client's token.
    fn deauth_signal(&self) -> watch::Receiver<bool>;
}

/// Entry point that turns credentials into authenticated clients.
#[async_trait]
pub trait RemoteManager: Send + Sync {
    async fn login(&self, username: &str, password: &[u8])
    -> Result<(Arc<dyn RemoteClient>, Auth)>;

    /// Re-authenticate with a stored refresh token.
    async fn resume(&self, uid: &str, refresh_token: &str)
    -> Result<(Arc<dyn RemoteClient>, Auth)>;
}
