//! Error types for protonmail-bridge

use crate::mode::AddressMode;
use crate::session::SessionState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Network hiccup or rate limit; worth retrying.
    #[error("Transient remote error: {0}")]
    Transient(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Session token was revoked by the server")]
    Revoked,

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Sync failed: {0}")]
    Sync(String),

    #[error("Switch to {target} mode failed: {cause}")]
    ModeSwitch { target: AddressMode, cause: String },

    #[error("Session is {0}, expected ready")]
    NotReady(SessionState),

    #[error("Session terminated")]
    Terminated,

    #[error("Update was dropped by its connector before being acknowledged")]
    Abandoned,

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("User already logged in: {0}")]
    AlreadyLoggedIn(String),

    #[error("Vault error: {0}")]
    Vault(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the sync engine should retry the failed call.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
