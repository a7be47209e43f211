//! Durable per-account credential store
//!
//! The vault keeps one record per account: remote auth tokens, the
//! derived key password, the local bridge password, the address mode,
//! and the sync bookkeeping that lets an interrupted sync resume. Every
//! mutation is written through to disk before it returns.

use crate::error::{Error, Result};
use crate::mode::AddressMode;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

const VAULT_FILE: &str = "vault.json";

/// Progress of the initial sync, persisted so a failed or interrupted
/// run resumes where it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub has_labels: bool,
    pub has_messages: bool,
    /// Highest remote message id already delivered to connectors.
    pub last_message_id: Option<String>,
    pub synced_messages: usize,
}

impl SyncStatus {
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.has_labels && self.has_messages
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRecord {
    user_id: String,
    username: String,
    bridge_pass: String,
    address_mode: AddressMode,
    auth_uid: String,
    auth_ref: String,
    /// Base64 encoded.
    key_pass: String,
    sync_status: SyncStatus,
    event_id: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VaultData {
    users: Vec<UserRecord>,
}

/// Store of every bridged account.
#[derive(Debug)]
pub struct Vault {
    path: Option<PathBuf>,
    data: Mutex<VaultData>,
}

impl Vault {
    /// Open (or create) the vault stored in `dir`.
    pub fn open(dir: &Path) -> Result<Arc<Self>> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(VAULT_FILE);

        let data = if path.exists() {
            let raw = std::fs::read(&path)?;
            serde_json::from_slice(&raw)
                .map_err(|e| Error::Vault(format!("Corrupt vault {}: {e}", path.display())))?
        } else {
            VaultData::default()
        };

        info!("Opened vault at {} ({} user(s))", path.display(), data.users.len());
        Ok(Arc::new(Self {
            path: Some(path),
            data: Mutex::new(data),
        }))
    }

    /// A vault that never touches the disk.
    #[must_use]
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            path: None,
            data: Mutex::new(VaultData::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, VaultData> {
        self.data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Add an account, or refresh the tokens of an existing one.
    pub fn add_user(
        self: &Arc<Self>,
        user_id: &str,
        username: &str,
        auth_uid: &str,
        auth_ref: &str,
        key_pass: &[u8],
    ) -> Result<VaultUser> {
        let mut data = self.lock();

        if let Some(user) = data.users.iter_mut().find(|u| u.user_id == user_id) {
            debug!("Refreshing vault record of {}", user_id);
            user.auth_uid = auth_uid.to_string();
            user.auth_ref = auth_ref.to_string();
            user.key_pass = STANDARD.encode(key_pass);
        } else {
            debug!("Adding vault record for {}", user_id);
            data.users.push(UserRecord {
                user_id: user_id.to_string(),
                username: username.to_string(),
                bridge_pass: new_bridge_pass(),
                address_mode: AddressMode::Combined,
                auth_uid: auth_uid.to_string(),
                auth_ref: auth_ref.to_string(),
                key_pass: STANDARD.encode(key_pass),
                sync_status: SyncStatus::default(),
                event_id: String::new(),
            });
        }

        self.persist(&data)?;
        drop(data);

        Ok(VaultUser {
            vault: Arc::clone(self),
            user_id: user_id.to_string(),
        })
    }

    pub fn user(self: &Arc<Self>, user_id: &str) -> Result<VaultUser> {
        if !self.lock().users.iter().any(|u| u.user_id == user_id) {
            return Err(Error::UnknownUser(user_id.to_string()));
        }
        Ok(VaultUser {
            vault: Arc::clone(self),
            user_id: user_id.to_string(),
        })
    }

    #[must_use]
    pub fn user_ids(&self) -> Vec<String> {
        self.lock().users.iter().map(|u| u.user_id.clone()).collect()
    }

    pub fn delete_user(&self, user_id: &str) -> Result<()> {
        let mut data = self.lock();
        let before = data.users.len();
        data.users.retain(|u| u.user_id != user_id);
        if data.users.len() == before {
            return Err(Error::UnknownUser(user_id.to_string()));
        }
        self.persist(&data)
    }

    /// Write the whole vault to a temporary file, fsync it and move it
    /// over the previous copy.
    fn persist(&self, data: &VaultData) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let dir = path
            .parent()
            .ok_or_else(|| Error::Vault(format!("Vault path {} has no parent", path.display())))?;

        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut file, data)?;
        file.flush()?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    fn read<T>(&self, user_id: &str, f: impl FnOnce(&UserRecord) -> T) -> Result<T> {
        self.lock()
            .users
            .iter()
            .find(|u| u.user_id == user_id)
            .map(f)
            .ok_or_else(|| Error::UnknownUser(user_id.to_string()))
    }

    fn modify(&self, user_id: &str, f: impl FnOnce(&mut UserRecord)) -> Result<()> {
        let mut data = self.lock();
        let user = data
            .users
            .iter_mut()
            .find(|u| u.user_id == user_id)
            .ok_or_else(|| Error::UnknownUser(user_id.to_string()))?;
        f(user);
        self.persist(&data)
    }
}

/// Handle on one account's vault record.
#[derive(Debug, Clone)]
pub struct VaultUser {
    vault: Arc<Vault>,
    user_id: String,
}

impl VaultUser {
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn username(&self) -> Result<String> {
        self.vault.read(&self.user_id, |u| u.username.clone())
    }

    /// Password local mail clients use to authenticate against the
    /// bridge.
    pub fn bridge_pass(&self) -> Result<String> {
        self.vault.read(&self.user_id, |u| u.bridge_pass.clone())
    }

    pub fn address_mode(&self) -> Result<AddressMode> {
        self.vault.read(&self.user_id, |u| u.address_mode)
    }

    /// Durable once this returns `Ok`.
    pub fn set_address_mode(&self, mode: AddressMode) -> Result<()> {
        self.vault.modify(&self.user_id, |u| u.address_mode = mode)
    }

    pub fn auth_uid(&self) -> Result<String> {
        self.vault.read(&self.user_id, |u| u.auth_uid.clone())
    }

    pub fn auth_ref(&self) -> Result<String> {
        self.vault.read(&self.user_id, |u| u.auth_ref.clone())
    }

    pub fn has_auth(&self) -> Result<bool> {
        self.vault
            .read(&self.user_id, |u| !u.auth_uid.is_empty() && !u.auth_ref.is_empty())
    }

    pub fn set_auth(&self, uid: &str, refresh_token: &str) -> Result<()> {
        self.vault.modify(&self.user_id, |u| {
            u.auth_uid = uid.to_string();
            u.auth_ref = refresh_token.to_string();
        })
    }

    /// Forget the remote tokens; the account must log in again.
    pub fn clear_auth(&self) -> Result<()> {
        self.vault.modify(&self.user_id, |u| {
            u.auth_uid.clear();
            u.auth_ref.clear();
        })
    }

    pub fn key_pass(&self) -> Result<Vec<u8>> {
        let encoded = self.vault.read(&self.user_id, |u| u.key_pass.clone())?;
        STANDARD
            .decode(encoded)
            .map_err(|e| Error::Vault(format!("Corrupt key password: {e}")))
    }

    pub fn sync_status(&self) -> Result<SyncStatus> {
        self.vault.read(&self.user_id, |u| u.sync_status.clone())
    }

    pub fn set_has_labels(&self) -> Result<()> {
        self.vault
            .modify(&self.user_id, |u| u.sync_status.has_labels = true)
    }

    pub fn set_last_message(&self, message_id: &str, synced: usize) -> Result<()> {
        self.vault.modify(&self.user_id, |u| {
            u.sync_status.last_message_id = Some(message_id.to_string());
            u.sync_status.synced_messages = synced;
        })
    }

    pub fn set_has_messages(&self) -> Result<()> {
        self.vault
            .modify(&self.user_id, |u| u.sync_status.has_messages = true)
    }

    pub fn clear_sync_status(&self) -> Result<()> {
        self.vault
            .modify(&self.user_id, |u| u.sync_status = SyncStatus::default())
    }

    /// Cursor of the last fully applied remote event.
    pub fn event_id(&self) -> Result<String> {
        self.vault.read(&self.user_id, |u| u.event_id.clone())
    }

    pub fn set_event_id(&self, event_id: &str) -> Result<()> {
        self.vault
            .modify(&self.user_id, |u| u.event_id = event_id.to_string())
    }
}

fn new_bridge_pass() -> String {
    let mut raw = [0u8; 16];
    OsRng.fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}
