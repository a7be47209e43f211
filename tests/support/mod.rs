//! Shared harness for session tests
//!
//! - `account` -- an in-memory remote account with labels and mail
//! - `bridge` -- a `Bridge` over that account with fast timings
//! - `handle_updates` -- a connector consumer that mirrors every
//!   namespace into a `LocalView` and acknowledges each update
//! - event helpers that fail the test instead of hanging

#![allow(dead_code)]

use protonmail_bridge::remote::LabelType;
use protonmail_bridge::remote::memory::MemoryServer;
use protonmail_bridge::{
    Bridge, BridgeConfig, Event, EventConfig, EventStream, LocalView, Session, SessionState,
    SyncConfig, Vault,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const USERNAME: &str = "alice";
pub const PASSWORD: &[u8] = b"correct horse";

/// Upper bound for anything a test waits on.
pub const TIMEOUT: Duration = Duration::from_secs(10);

pub struct Account {
    pub server: MemoryServer,
    pub user_id: String,
    pub address_ids: Vec<String>,
    pub folder_id: String,
    pub message_ids: Vec<String>,
}

/// An account with two addresses, a folder, and five messages spread
/// across both addresses.
pub fn account() -> Account {
    let server = MemoryServer::new();
    let (user_id, address_ids) = server
        .create_user(USERNAME, PASSWORD, &["alice@pm.me", "alias@pm.me"])
        .unwrap();
    let folder_id = server
        .create_label(&user_id, "Work", LabelType::Folder)
        .unwrap();

    let message_ids = vec![
        server
            .create_message(&user_id, &address_ids[0], "Welcome", &["0"])
            .unwrap(),
        server
            .create_message(&user_id, &address_ids[0], "Report", &["0", folder_id.as_str()])
            .unwrap(),
        server
            .create_message(&user_id, &address_ids[1], "Alias mail", &["0"])
            .unwrap(),
        server
            .create_message(&user_id, &address_ids[0], "Starred", &["0", "10"])
            .unwrap(),
        server
            .create_message(&user_id, &address_ids[1], "Old news", &["6"])
            .unwrap(),
    ];

    Account {
        server,
        user_id,
        address_ids,
        folder_id,
        message_ids,
    }
}

/// Small pages and short timers so every code path runs quickly.
pub fn fast_config() -> BridgeConfig {
    BridgeConfig {
        vault_dir: PathBuf::from("unused"),
        sync: SyncConfig {
            max_retries: 5,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            page_size: 2,
        },
        events: EventConfig {
            period: Duration::from_millis(20),
            jitter: Duration::ZERO,
            buffer: 64,
        },
    }
}

pub fn bridge(account: &Account, vault: Arc<Vault>) -> Bridge {
    Bridge::new(vault, Arc::new(account.server.clone()), fast_config())
}

/// Connector views keyed by namespace address id.
#[derive(Clone, Default)]
pub struct Views(Arc<Mutex<BTreeMap<String, LocalView>>>);

impl Views {
    pub fn get(&self, address_id: &str) -> LocalView {
        self.0
            .lock()
            .unwrap()
            .get(address_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.0.lock().unwrap().keys().cloned().collect()
    }

    /// Total messages across every namespace.
    pub fn message_count(&self) -> usize {
        self.0
            .lock()
            .unwrap()
            .values()
            .map(LocalView::message_count)
            .sum()
    }

    pub fn find_message(&self, id: &str) -> Option<protonmail_bridge::Message> {
        self.0
            .lock()
            .unwrap()
            .values()
            .find_map(|view| view.message(id).cloned())
    }
}

/// Consume every connector of `session`, following connector
/// replacements. Views are reset whenever a new generation starts.
pub fn handle_updates(session: &Arc<Session>) -> Views {
    let views = Views::default();
    let session = Arc::clone(session);
    let shared = views.clone();

    let _driver: JoinHandle<()> = tokio::spawn(async move {
        let mut generation = session.watch_connectors();
        loop {
            generation.borrow_and_update();
            let Ok(connectors) = session.new_connectors() else {
                return;
            };
            shared.0.lock().unwrap().clear();

            let readers: Vec<JoinHandle<()>> = connectors
                .into_iter()
                .map(|connector| {
                    let views = shared.clone();
                    tokio::spawn(async move {
                        views
                            .0
                            .lock()
                            .unwrap()
                            .entry(connector.address_id().to_string())
                            .or_default();
                        while let Some(update) = connector.next_update().await {
                            views
                                .0
                                .lock()
                                .unwrap()
                                .entry(connector.address_id().to_string())
                                .or_default()
                                .apply(update.kind());
                            update.done();
                        }
                    })
                })
                .collect();

            let changed = generation.changed().await;
            for reader in readers {
                let _ = reader.await;
            }
            if changed.is_err() {
                return;
            }
        }
    });

    views
}

pub async fn next_event(events: &EventStream) -> Event {
    tokio::time::timeout(TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream closed")
}

/// Collect events up to and including the first one matching `last`.
pub async fn events_until(events: &EventStream, last: impl Fn(&Event) -> bool) -> Vec<Event> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let done = last(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

pub async fn until_finished(events: &EventStream) -> Vec<Event> {
    events_until(events, |e| {
        matches!(e, Event::SyncFinished { .. } | Event::SyncFailed { .. })
    })
    .await
}

/// Assert that no event arrives within `window`.
pub async fn assert_quiet(events: &EventStream, window: Duration) {
    if let Ok(event) = tokio::time::timeout(window, events.recv()).await {
        panic!("unexpected event: {event:?}");
    }
}

pub async fn wait_for_state(session: &Session, state: SessionState) {
    let mut states = session.watch_state();
    tokio::time::timeout(TIMEOUT, states.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
}

/// Poll `check` until it holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}

pub fn count(events: &[Event], pred: impl Fn(&Event) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}
