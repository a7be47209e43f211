//! Multi-account front door
//!
//! [`Bridge`] logs accounts in, restores them from the vault on
//! startup, and owns one [`Session`] per account.

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::remote::RemoteManager;
use crate::session::Session;
use crate::vault::Vault;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub struct Bridge {
    vault: Arc<Vault>,
    manager: Arc<dyn RemoteManager>,
    config: BridgeConfig,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl Bridge {
    #[must_use]
    pub fn new(vault: Arc<Vault>, manager: Arc<dyn RemoteManager>, config: BridgeConfig) -> Self {
        Self {
            vault,
            manager,
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Log an account in with its remote credentials and start its
    /// session.
    pub async fn login(&self, username: &str, password: &[u8]) -> Result<Arc<Session>> {
        info!("Logging in {}", username);
        let (client, auth) = self.manager.login(username, password).await?;

        let user = client.get_user().await?;
        if self.has_live_session(&user.id).await {
            return Err(Error::AlreadyLoggedIn(username.to_string()));
        }

        let key = user
            .primary_key()
            .ok_or_else(|| Error::Auth(format!("User {} has no primary key", user.id)))?;
        let salts = client.get_salts().await?;
        let key_pass = salts.salt_for_key(password, &key.id)?;

        let vault_user = self.vault.add_user(
            &user.id,
            username,
            &auth.uid,
            &auth.refresh_token,
            &key_pass,
        )?;
        let session = Session::new(vault_user, client, &self.config).await?;

        let mut sessions = self.sessions.write().await;
        if sessions
            .get(&user.id)
            .is_some_and(|existing| !existing.state().is_terminal())
        {
            drop(sessions);
            session.close().await;
            return Err(Error::AlreadyLoggedIn(username.to_string()));
        }
        let replaced = sessions.insert(user.id.clone(), Arc::clone(&session));
        drop(sessions);
        if let Some(ended) = replaced {
            ended.close().await;
        }
        Ok(session)
    }

    /// Resume every vault account that still holds credentials.
    /// Accounts that fail to resume are skipped. Returns the ids of the
    /// sessions started.
    pub async fn load_sessions(&self) -> Result<Vec<String>> {
        let mut loaded = Vec::new();

        for user_id in self.vault.user_ids() {
            if self.has_live_session(&user_id).await {
                continue;
            }
            let vault_user = self.vault.user(&user_id)?;
            if !vault_user.has_auth()? {
                debug!("Skipping {}: not logged in", user_id);
                continue;
            }

            let uid = vault_user.auth_uid()?;
            let refresh = vault_user.auth_ref()?;
            let (client, auth) = match self.manager.resume(&uid, &refresh).await {
                Ok(resumed) => resumed,
                Err(e) => {
                    warn!("Failed to resume {}: {}", user_id, e);
                    continue;
                }
            };
            vault_user.set_auth(&auth.uid, &auth.refresh_token)?;

            match Session::new(vault_user, client, &self.config).await {
                Ok(session) => {
                    self.sessions.write().await.insert(user_id.clone(), session);
                    loaded.push(user_id);
                }
                Err(e) => warn!("Failed to start session for {}: {}", user_id, e),
            }
        }

        info!("Loaded {} session(s)", loaded.len());
        Ok(loaded)
    }

    /// Whether `user_id` has a session that has not ended. A session the
    /// server revoked is dropped here and closed, so the account can log
    /// in again.
    async fn has_live_session(&self, user_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let ended = match sessions.get(user_id) {
            None => return false,
            Some(session) => session.state().is_terminal(),
        };
        if !ended {
            return true;
        }
        let session = sessions.remove(user_id);
        drop(sessions);
        if let Some(session) = session {
            debug!("Dropping ended session of {}", user_id);
            session.close().await;
        }
        false
    }

    pub async fn session(&self, user_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(user_id)
            .cloned()
            .ok_or_else(|| Error::UnknownUser(user_id.to_string()))
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close the account's session and forget its remote tokens. The
    /// vault record stays, with its settings.
    pub async fn logout(&self, user_id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(user_id)
            .ok_or_else(|| Error::UnknownUser(user_id.to_string()))?;
        session.close().await;
        self.vault.user(user_id)?.clear_auth()?;
        info!("Logged out {}", user_id);
        Ok(())
    }

    /// Log out if needed and remove the account from the vault.
    pub async fn delete_user(&self, user_id: &str) -> Result<()> {
        let session = self.sessions.write().await.remove(user_id);
        if let Some(session) = session {
            session.close().await;
        }
        self.vault.delete_user(user_id)?;
        info!("Deleted {}", user_id);
        Ok(())
    }

    /// Close every session.
    pub async fn close(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }
}
