//! In-process remote service
//!
//! [`MemoryServer`] keeps users, addresses, labels and message metadata
//! in memory and records every mutation in a per-user event log, which
//! is what a [`RemoteClient`] polls for live updates. It backs the
//! integration tests and the CLI's offline `simulate` command.
//!
//! ```
//! use protonmail_bridge::remote::memory::MemoryServer;
//!
//! let server = MemoryServer::new();
//! let (user_id, addr_ids) = server
//!     .create_user("alice", b"password", &["alice@pm.me", "alias@pm.me"])
//!     .unwrap();
//! server.create_message(&user_id, &addr_ids[0], "Hello", &["0"]).unwrap();
//! assert_eq!(server.message_count(&user_id).unwrap(), 1);
//! ```

use super::{
    Address, ApiUser, Auth, EventPage, Key, Label, LabelType, MessageMetadata, RemoteClient,
    RemoteEvent, RemoteManager, Salt, Salts, labels,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info};

/// Events returned by a single `get_events` call at most.
const EVENT_PAGE_SIZE: usize = 50;

const SYSTEM_LABELS: [(&str, &str); 10] = [
    (labels::INBOX, "Inbox"),
    (labels::ALL_DRAFTS, "All Drafts"),
    (labels::ALL_SENT, "All Sent"),
    (labels::TRASH, "Trash"),
    (labels::SPAM, "Spam"),
    (labels::ALL_MAIL, "All Mail"),
    (labels::ARCHIVE, "Archive"),
    (labels::SENT, "Sent"),
    (labels::DRAFTS, "Drafts"),
    (labels::STARRED, "Starred"),
];

#[derive(Debug)]
struct UserRecord {
    username: String,
    password: Vec<u8>,
    user: ApiUser,
    salt: Vec<u8>,
    addresses: Vec<Address>,
    labels: Vec<Label>,
    messages: BTreeMap<String, MessageMetadata>,
    events: Vec<(String, RemoteEvent)>,
    failing_listings: u32,
}

impl UserRecord {
    fn push_event(&mut self, event: RemoteEvent) {
        let id = format!("event-{:08}", self.events.len() + 1);
        self.events.push((id, event));
    }

    fn latest_event_id(&self) -> String {
        self.events
            .last()
            .map_or_else(|| "event-00000000".to_string(), |(id, _)| id.clone())
    }

    fn label_id_by_name(&self, name: &str) -> Option<String> {
        self.labels
            .iter()
            .find(|l| l.name.eq_ignore_ascii_case(name) || l.id == name)
            .map(|l| l.id.clone())
    }
}

#[derive(Debug)]
struct AuthSession {
    user_id: String,
    refresh_token: String,
    revoked: watch::Sender<bool>,
}

#[derive(Debug, Default)]
struct State {
    users: HashMap<String, UserRecord>,
    sessions: HashMap<String, AuthSession>,
    next_id: u64,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:08}", self.next_id)
    }

    fn user_mut(&mut self, user_id: &str) -> Result<&mut UserRecord> {
        self.users
            .get_mut(user_id)
            .ok_or_else(|| Error::UnknownUser(user_id.to_string()))
    }

    fn user(&self, user_id: &str) -> Result<&UserRecord> {
        self.users
            .get(user_id)
            .ok_or_else(|| Error::UnknownUser(user_id.to_string()))
    }

    fn open_session(&mut self, user_id: &str) -> (String, Auth) {
        let uid = self.next_id("uid");
        let refresh_token = self.next_id("refresh");
        let (revoked, _) = watch::channel(false);
        self.sessions.insert(
            uid.clone(),
            AuthSession {
                user_id: user_id.to_string(),
                refresh_token: refresh_token.clone(),
                revoked,
            },
        );
        (
            uid.clone(),
            Auth {
                uid,
                refresh_token,
            },
        )
    }
}

/// An in-memory remote mail service.
#[derive(Debug, Clone, Default)]
pub struct MemoryServer {
    state: Arc<Mutex<State>>,
}

impl MemoryServer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Create a user whose first email becomes the primary address.
    ///
    /// Returns the user id and the address ids in the order given.
    pub fn create_user(
        &self,
        username: &str,
        password: &[u8],
        emails: &[&str],
    ) -> Result<(String, Vec<String>)> {
        let mut state = self.lock();

        if state.users.values().any(|u| u.username == username) {
            return Err(Error::Remote(format!("Username {username} is taken")));
        }

        let user_id = state.next_id("user");
        let key_id = state.next_id("key");

        let mut addresses = Vec::with_capacity(emails.len());
        for (order, email) in (1u32..).zip(emails) {
            addresses.push(Address {
                id: state.next_id("addr"),
                email: (*email).to_string(),
                order,
            });
        }
        let addr_ids = addresses.iter().map(|a| a.id.clone()).collect();

        let labels = SYSTEM_LABELS
            .iter()
            .map(|(id, name)| Label {
                id: (*id).to_string(),
                name: (*name).to_string(),
                path: (*name).to_string(),
                kind: LabelType::System,
            })
            .collect();

        let record = UserRecord {
            username: username.to_string(),
            password: password.to_vec(),
            user: ApiUser {
                id: user_id.clone(),
                name: username.to_string(),
                keys: vec![Key {
                    id: key_id,
                    primary: true,
                }],
            },
            salt: rand::random::<[u8; 16]>().to_vec(),
            addresses,
            labels,
            messages: BTreeMap::new(),
            events: Vec::new(),
            failing_listings: 0,
        };

        state.users.insert(user_id.clone(), record);
        info!("Created remote user {} ({})", username, user_id);
        Ok((user_id, addr_ids))
    }

    pub fn create_address(&self, user_id: &str, email: &str) -> Result<String> {
        let mut state = self.lock();
        let id = state.next_id("addr");
        let user = state.user_mut(user_id)?;
        let order = user.addresses.iter().map(|a| a.order).max().unwrap_or(0) + 1;
        let address = Address {
            id: id.clone(),
            email: email.to_string(),
            order,
        };
        user.addresses.push(address.clone());
        user.push_event(RemoteEvent::AddressCreated(address));
        Ok(id)
    }

    pub fn delete_address(&self, user_id: &str, address_id: &str) -> Result<()> {
        let mut state = self.lock();
        let user = state.user_mut(user_id)?;
        user.addresses.retain(|a| a.id != address_id);
        user.push_event(RemoteEvent::AddressDeleted(address_id.to_string()));
        Ok(())
    }

    /// Create a folder or label; `path` may contain `/` separators.
    pub fn create_label(&self, user_id: &str, path: &str, kind: LabelType) -> Result<String> {
        let mut state = self.lock();
        let id = state.next_id("label");
        let user = state.user_mut(user_id)?;
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        let label = Label {
            id: id.clone(),
            name,
            path: path.to_string(),
            kind,
        };
        user.labels.push(label.clone());
        user.push_event(RemoteEvent::LabelCreated(label));
        Ok(id)
    }

    /// Create an unread message in the given labels. Every message is
    /// also in All Mail.
    pub fn create_message(
        &self,
        user_id: &str,
        address_id: &str,
        subject: &str,
        label_ids: &[&str],
    ) -> Result<String> {
        let mut state = self.lock();
        let id = state.next_id("msg");
        let user = state.user_mut(user_id)?;

        let sender = user
            .addresses
            .iter()
            .find(|a| a.id == address_id)
            .map(|a| a.email.clone())
            .ok_or_else(|| Error::Remote(format!("Unknown address {address_id}")))?;

        let mut ids: Vec<String> = label_ids.iter().map(|l| (*l).to_string()).collect();
        if !ids.iter().any(|l| l == labels::ALL_MAIL) {
            ids.push(labels::ALL_MAIL.to_string());
        }

        let message = MessageMetadata {
            id: id.clone(),
            address_id: address_id.to_string(),
            label_ids: ids,
            subject: subject.to_string(),
            sender,
            time: chrono::Utc::now().timestamp(),
            unread: true,
        };
        user.messages.insert(id.clone(), message.clone());
        user.push_event(RemoteEvent::MessageCreated(message));
        Ok(id)
    }

    pub fn delete_message(&self, user_id: &str, message_id: &str) -> Result<()> {
        let mut state = self.lock();
        let user = state.user_mut(user_id)?;
        if user.messages.remove(message_id).is_some() {
            user.push_event(RemoteEvent::MessageDeleted(message_id.to_string()));
        }
        Ok(())
    }

    /// Ask every client of the user to rebuild from scratch.
    pub fn refresh(&self, user_id: &str) -> Result<()> {
        self.lock().user_mut(user_id)?.push_event(RemoteEvent::Refresh);
        Ok(())
    }

    /// Invalidate every session of the user.
    pub fn revoke_user(&self, user_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.user(user_id)?;
        let mut revoked = 0;
        state.sessions.retain(|_, session| {
            if session.user_id == user_id {
                session.revoked.send_replace(true);
                revoked += 1;
                false
            } else {
                true
            }
        });
        info!("Revoked {} session(s) of {}", revoked, user_id);
        Ok(())
    }

    /// Make the next `count` message listings fail with a transient
    /// error.
    pub fn fail_next_listings(&self, user_id: &str, count: u32) -> Result<()> {
        self.lock().user_mut(user_id)?.failing_listings = count;
        Ok(())
    }

    pub fn message_count(&self, user_id: &str) -> Result<usize> {
        Ok(self.lock().user(user_id)?.messages.len())
    }

    pub fn message(&self, user_id: &str, message_id: &str) -> Result<Option<MessageMetadata>> {
        Ok(self.lock().user(user_id)?.messages.get(message_id).cloned())
    }

    /// Load users from a JSON fixture file.
    pub fn from_fixture(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_fixture_str(&raw)
    }

    /// Load users from a JSON fixture.
    ///
    /// ```json
    /// {"users": [{"username": "alice", "password": "secret",
    ///   "addresses": ["alice@pm.me"], "folders": ["Work"],
    ///   "labels": ["Important"],
    ///   "messages": [{"address": "alice@pm.me", "subject": "Hi",
    ///                 "mailboxes": ["Inbox", "Work"], "unread": false}]}]}
    /// ```
    pub fn from_fixture_str(raw: &str) -> Result<Self> {
        let fixture: Fixture = serde_json::from_str(raw)?;
        let server = Self::new();

        for entry in fixture.users {
            let emails: Vec<&str> = entry.addresses.iter().map(String::as_str).collect();
            let (user_id, addr_ids) =
                server.create_user(&entry.username, entry.password.as_bytes(), &emails)?;

            for folder in &entry.folders {
                server.create_label(&user_id, folder, LabelType::Folder)?;
            }
            for label in &entry.labels {
                server.create_label(&user_id, label, LabelType::Label)?;
            }

            for message in entry.messages {
                let address_id = entry
                    .addresses
                    .iter()
                    .position(|a| *a == message.address)
                    .map(|i| addr_ids[i].clone())
                    .ok_or_else(|| {
                        Error::Config(format!("Fixture address {} not found", message.address))
                    })?;

                let label_ids = {
                    let state = server.lock();
                    let user = state.user(&user_id)?;
                    message
                        .mailboxes
                        .iter()
                        .map(|name| {
                            user.label_id_by_name(name).ok_or_else(|| {
                                Error::Config(format!("Fixture mailbox {name} not found"))
                            })
                        })
                        .collect::<Result<Vec<_>>>()?
                };
                let refs: Vec<&str> = label_ids.iter().map(String::as_str).collect();
                let id = server.create_message(&user_id, &address_id, &message.subject, &refs)?;

                if !message.unread {
                    server.set_unread(&user_id, &[id], false)?;
                }
            }
        }

        Ok(server)
    }

    fn set_unread(&self, user_id: &str, ids: &[String], unread: bool) -> Result<()> {
        let mut state = self.lock();
        let user = state.user_mut(user_id)?;
        let mut changed = Vec::new();
        for id in ids {
            if let Some(message) = user.messages.get_mut(id) {
                message.unread = unread;
                changed.push(message.clone());
            }
        }
        for message in changed {
            user.push_event(RemoteEvent::MessageUpdated(message));
        }
        Ok(())
    }

    fn set_label(&self, user_id: &str, ids: &[String], label_id: &str, add: bool) -> Result<()> {
        let mut state = self.lock();
        let user = state.user_mut(user_id)?;
        if !user.labels.iter().any(|l| l.id == label_id) {
            return Err(Error::Remote(format!("Unknown label {label_id}")));
        }
        let mut changed = Vec::new();
        for id in ids {
            if let Some(message) = user.messages.get_mut(id) {
                let present = message.has_label(label_id);
                if add && !present {
                    message.label_ids.push(label_id.to_string());
                } else if !add && present {
                    message.label_ids.retain(|l| l != label_id);
                } else {
                    continue;
                }
                changed.push(message.clone());
            }
        }
        for message in changed {
            user.push_event(RemoteEvent::MessageUpdated(message));
        }
        Ok(())
    }

    fn client_for(&self, uid: String, user_id: String) -> Result<Arc<dyn RemoteClient>> {
        let deauth = self
            .lock()
            .sessions
            .get(&uid)
            .map(|s| s.revoked.subscribe())
            .ok_or(Error::Revoked)?;

        Ok(Arc::new(MemoryClient {
            server: self.clone(),
            uid,
            user_id,
            deauth,
        }))
    }
}

#[async_trait]
impl RemoteManager for MemoryServer {
    async fn login(
        &self,
        username: &str,
        password: &[u8],
    ) -> Result<(Arc<dyn RemoteClient>, Auth)> {
        let (user_id, auth) = {
            let mut state = self.lock();
            let user_id = state
                .users
                .iter()
                .find(|(_, u)| u.username == username && u.password == password)
                .map(|(id, _)| id.clone())
                .ok_or_else(|| Error::Auth("Incorrect login credentials".into()))?;
            let (_, auth) = state.open_session(&user_id);
            (user_id, auth)
        };

        debug!("Opened remote session {} for {}", auth.uid, user_id);
        let client = self.client_for(auth.uid.clone(), user_id)?;
        Ok((client, auth))
    }

    async fn resume(
        &self,
        uid: &str,
        refresh_token: &str,
    ) -> Result<(Arc<dyn RemoteClient>, Auth)> {
        let (user_id, auth) = {
            let mut state = self.lock();
            let session = state
                .sessions
                .remove(uid)
                .ok_or_else(|| Error::Auth("Unknown session".into()))?;
            if session.refresh_token != refresh_token {
                state.sessions.insert(uid.to_string(), session);
                return Err(Error::Auth("Invalid refresh token".into()));
            }
            let (_, auth) = state.open_session(&session.user_id);
            (session.user_id, auth)
        };

        let client = self.client_for(auth.uid.clone(), user_id)?;
        Ok((client, auth))
    }
}

struct MemoryClient {
    server: MemoryServer,
    uid: String,
    user_id: String,
    deauth: watch::Receiver<bool>,
}

impl MemoryClient {
    /// Run `f` against the user's record, failing if the session was
    /// revoked.
    fn with_user<T>(&self, f: impl FnOnce(&mut UserRecord) -> Result<T>) -> Result<T> {
        let mut state = self.server.lock();
        if !state.sessions.contains_key(&self.uid) {
            return Err(Error::Revoked);
        }
        f(state.user_mut(&self.user_id)?)
    }
}

#[async_trait]
impl RemoteClient for MemoryClient {
    async fn get_user(&self) -> Result<ApiUser> {
        self.with_user(|u| Ok(u.user.clone()))
    }

    async fn get_addresses(&self) -> Result<Vec<Address>> {
        self.with_user(|u| {
            let mut addresses = u.addresses.clone();
            addresses.sort_by_key(|a| a.order);
            Ok(addresses)
        })
    }

    async fn get_salts(&self) -> Result<Salts> {
        self.with_user(|u| {
            Ok(Salts(
                u.user
                    .keys
                    .iter()
                    .map(|k| Salt {
                        key_id: k.id.clone(),
                        salt: STANDARD.encode(&u.salt),
                    })
                    .collect(),
            ))
        })
    }

    async fn get_labels(&self) -> Result<Vec<Label>> {
        self.with_user(|u| Ok(u.labels.clone()))
    }

    async fn count_messages(&self) -> Result<usize> {
        self.with_user(|u| Ok(u.messages.len()))
    }

    async fn get_messages(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MessageMetadata>> {
        self.with_user(|u| {
            if u.failing_listings > 0 {
                u.failing_listings -= 1;
                return Err(Error::Transient("Service unavailable".into()));
            }
            let iter: Box<dyn Iterator<Item = &MessageMetadata>> = match after {
                Some(after) => Box::new(
                    u.messages
                        .range::<str, _>((
                            std::ops::Bound::Excluded(after),
                            std::ops::Bound::Unbounded,
                        ))
                        .map(|(_, m)| m),
                ),
                None => Box::new(u.messages.values()),
            };
            Ok(iter.take(limit).cloned().collect())
        })
    }

    async fn get_latest_event_id(&self) -> Result<String> {
        self.with_user(|u| Ok(u.latest_event_id()))
    }

    async fn get_events(&self, since: &str) -> Result<EventPage> {
        self.with_user(|u| {
            let pending: Vec<&(String, RemoteEvent)> = u
                .events
                .iter()
                .filter(|(id, _)| id.as_str() > since)
                .collect();
            let more = pending.len() > EVENT_PAGE_SIZE;
            let page: Vec<&(String, RemoteEvent)> =
                pending.into_iter().take(EVENT_PAGE_SIZE).collect();
            let event_id = page
                .last()
                .map_or_else(|| since.to_string(), |(id, _)| id.clone());
            Ok(EventPage {
                event_id,
                events: page.into_iter().map(|(_, e)| e.clone()).collect(),
                more,
            })
        })
    }

    async fn mark_messages_read(&self, ids: &[String]) -> Result<()> {
        self.with_user(|_| Ok(()))?;
        self.server.set_unread(&self.user_id, ids, false)
    }

    async fn mark_messages_unread(&self, ids: &[String]) -> Result<()> {
        self.with_user(|_| Ok(()))?;
        self.server.set_unread(&self.user_id, ids, true)
    }

    async fn label_messages(&self, ids: &[String], label_id: &str) -> Result<()> {
        self.with_user(|_| Ok(()))?;
        self.server.set_label(&self.user_id, ids, label_id, true)
    }

    async fn unlabel_messages(&self, ids: &[String], label_id: &str) -> Result<()> {
        self.with_user(|_| Ok(()))?;
        self.server.set_label(&self.user_id, ids, label_id, false)
    }

    fn deauth_signal(&self) -> watch::Receiver<bool> {
        self.deauth.clone()
    }
}

#[derive(Debug, Deserialize)]
struct Fixture {
    users: Vec<FixtureUser>,
}

#[derive(Debug, Deserialize)]
struct FixtureUser {
    username: String,
    password: String,
    addresses: Vec<String>,
    #[serde(default)]
    folders: Vec<String>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    messages: Vec<FixtureMessage>,
}

#[derive(Debug, Deserialize)]
struct FixtureMessage {
    address: String,
    subject: String,
    #[serde(default)]
    mailboxes: Vec<String>,
    #[serde(default = "default_unread")]
    unread: bool,
}

const fn default_unread() -> bool {
    true
}
