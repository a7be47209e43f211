//! Proton Mail bridge session core
//!
//! Keeps local protocol connectors (the IMAP side of a mail bridge) in
//! step with a remote Proton Mail account. Each logged-in account runs
//! as a [`Session`]: it performs a full sync, then follows the remote
//! change feed, and pushes every change to its connectors as an
//! [`Update`] that must be acknowledged before the bridge moves on.
//!
//! Accounts can be served as one combined mailbox namespace or one
//! namespace per address ([`AddressMode`]). Progress and lifecycle are
//! reported on a per-session [`EventStream`].
//!
//! ```no_run
//! use protonmail_bridge::remote::memory::MemoryServer;
//! use protonmail_bridge::{Bridge, BridgeConfig, Vault};
//! use std::sync::Arc;
//!
//! # async fn run() -> protonmail_bridge::Result<()> {
//! let server = MemoryServer::new();
//! server.create_user("alice", b"password", &["alice@pm.me"])?;
//!
//! let bridge = Bridge::new(Vault::in_memory(), Arc::new(server), BridgeConfig::default());
//! let session = bridge.login("alice", b"password").await?;
//! while let Some(event) = session.events().recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

mod bridge;
mod config;
mod connector;
mod error;
mod event;
pub mod mailbox;
mod mode;
mod propagator;
pub mod remote;
mod session;
mod sync;
mod update;
mod vault;
mod view;

pub use bridge::Bridge;
pub use config::{BridgeConfig, EventConfig, SyncConfig};
pub use connector::Connector;
pub use error::{Error, Result};
pub use event::{Event, EventStream};
pub use mode::AddressMode;
pub use session::{Session, SessionState};
pub use update::{Ack, Mailbox, Message, Outcome, Update, UpdateKind};
pub use vault::{SyncStatus, Vault, VaultUser};
pub use view::LocalView;
