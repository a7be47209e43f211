//! Integration tests for `Session` against the in-memory remote.
//!
//! Each test builds an account on a `MemoryServer`, logs it in through
//! a `Bridge` with fast timings, drives the connectors with the shared
//! harness, and asserts on the event stream, the connector views and
//! the vault.

mod support;

use protonmail_bridge::{AddressMode, Error, Event, SessionState, UpdateKind, Vault};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use support::{
    PASSWORD, TIMEOUT, USERNAME, account, assert_quiet, bridge, count, events_until, eventually,
    handle_updates, next_event, until_finished, wait_for_state,
};
use tokio::sync::mpsc;

fn is_failed(e: &Event) -> bool {
    matches!(e, Event::SyncFailed { .. })
}

fn is_finished(e: &Event) -> bool {
    matches!(e, Event::SyncFinished { .. })
}

fn is_deauth(e: &Event) -> bool {
    matches!(e, Event::UserDeauth { .. })
}

fn progress_values(events: &[Event]) -> Vec<f64> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::SyncProgress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect()
}

/// Retry `resync` while the failed run is still winding down.
async fn resync(session: &Arc<protonmail_bridge::Session>) {
    for _ in 0..100 {
        match session.resync().await {
            Ok(()) => return,
            Err(Error::NotReady(_)) => tokio::time::sleep(Duration::from_millis(10)).await,
            Err(e) => panic!("resync failed: {e}"),
        }
    }
    panic!("session never accepted a resync");
}

// ── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_info() {
    let account = account();
    let bridge = bridge(&account, Vault::in_memory());
    let session = bridge.login(USERNAME, PASSWORD).await.unwrap();

    assert_eq!(session.id(), account.user_id);
    assert_eq!(session.name().unwrap(), USERNAME);
    assert_eq!(
        session.emails().unwrap(),
        vec!["alice@pm.me".to_string(), "alias@pm.me".to_string()]
    );
    assert!(!session.bridge_pass().unwrap().is_empty());
    assert_eq!(session.get_address_mode().unwrap(), AddressMode::Combined);

    bridge.close().await;
}

#[tokio::test]
async fn test_first_sync_sequence() {
    let account = account();
    let bridge = bridge(&account, Vault::in_memory());
    let session = bridge.login(USERNAME, PASSWORD).await.unwrap();
    let events = session.events();
    let views = handle_updates(&session);

    let seen = until_finished(&events).await;

    assert!(matches!(seen.first(), Some(Event::SyncStarted { .. })));
    assert!(matches!(seen.last(), Some(Event::SyncFinished { .. })));
    assert_eq!(count(&seen, is_failed), 0);

    let progress = progress_values(&seen);
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert!(progress.iter().all(|p| (0.0..=1.0).contains(p)));
    assert!((progress[progress.len() - 1] - 1.0).abs() < f64::EPSILON);

    wait_for_state(&session, SessionState::Ready).await;
    assert_eq!(views.message_count(), 5);

    let view = views.get(&account.address_ids[0]);
    let mailboxes = view.mailbox_names();
    assert!(mailboxes.contains(&"INBOX".to_string()));
    assert!(mailboxes.contains(&"Folders/Work".to_string()));
    assert_eq!(view.messages_in(&account.folder_id).count(), 1);
    assert!(view.message(&account.message_ids[3]).unwrap().flagged);

    bridge.close().await;
}

#[tokio::test]
async fn test_every_event_names_the_session() {
    let account = account();
    let bridge = bridge(&account, Vault::in_memory());
    let session = bridge.login(USERNAME, PASSWORD).await.unwrap();
    let events = session.events();
    let _views = handle_updates(&session);

    let seen = until_finished(&events).await;
    assert!(seen.iter().all(|e| e.user_id() == account.user_id));

    bridge.close().await;
}

#[tokio::test]
async fn test_mode_switch_round_trip() {
    let account = account();
    let vault = Vault::in_memory();
    let bridge = bridge(&account, Arc::clone(&vault));
    let session = bridge.login(USERNAME, PASSWORD).await.unwrap();
    let events = session.events();
    let views = handle_updates(&session);

    until_finished(&events).await;
    wait_for_state(&session, SessionState::Ready).await;
    assert_eq!(session.new_connectors().unwrap().len(), 1);

    // Combined -> split.
    session.set_address_mode(AddressMode::Split).await.unwrap();
    let seen = events_until(&events, |e| {
        matches!(e, Event::AddressModeChanged { .. })
    })
    .await;
    assert!(matches!(seen.first(), Some(Event::SyncStarted { .. })));
    assert_eq!(count(&seen, is_finished), 1);
    assert_eq!(count(&seen, is_failed), 0);
    assert!(matches!(
        seen.last(),
        Some(Event::AddressModeChanged {
            mode: AddressMode::Split,
            ..
        })
    ));

    wait_for_state(&session, SessionState::Ready).await;
    assert_eq!(session.get_address_mode().unwrap(), AddressMode::Split);
    assert_eq!(
        vault.user(&account.user_id).unwrap().address_mode().unwrap(),
        AddressMode::Split
    );

    let connectors = session.new_connectors().unwrap();
    assert_eq!(connectors.len(), 2);
    assert_eq!(connectors[1].emails(), vec!["alias@pm.me".to_string()]);
    eventually(|| views.namespaces().len() == 2).await;
    assert_eq!(views.get(&account.address_ids[0]).message_count(), 3);
    assert_eq!(views.get(&account.address_ids[1]).message_count(), 2);

    // Split -> combined.
    session.set_address_mode(AddressMode::Combined).await.unwrap();
    let seen = events_until(&events, |e| {
        matches!(e, Event::AddressModeChanged { .. })
    })
    .await;
    assert_eq!(count(&seen, is_finished), 1);

    wait_for_state(&session, SessionState::Ready).await;
    assert_eq!(session.new_connectors().unwrap().len(), 1);
    eventually(|| views.namespaces().len() == 1).await;
    assert_eq!(views.message_count(), 5);

    bridge.close().await;
}

#[tokio::test]
async fn test_switch_to_current_mode_is_a_no_op() {
    let account = account();
    let bridge = bridge(&account, Vault::in_memory());
    let session = bridge.login(USERNAME, PASSWORD).await.unwrap();
    let events = session.events();
    let _views = handle_updates(&session);

    until_finished(&events).await;
    wait_for_state(&session, SessionState::Ready).await;

    session.set_address_mode(AddressMode::Combined).await.unwrap();
    assert_quiet(&events, Duration::from_millis(100)).await;
    assert_eq!(session.state(), SessionState::Ready);

    bridge.close().await;
}

#[tokio::test]
async fn test_switch_rejected_while_syncing() {
    let account = account();
    let vault = Vault::in_memory();
    let bridge = bridge(&account, Arc::clone(&vault));
    let session = bridge.login(USERNAME, PASSWORD).await.unwrap();

    // Nobody consumes the connectors, so the first sync cannot finish.
    assert_eq!(session.state(), SessionState::Syncing);
    let err = session
        .set_address_mode(AddressMode::Split)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotReady(SessionState::Syncing)));

    assert_eq!(session.get_address_mode().unwrap(), AddressMode::Combined);
    assert_eq!(
        vault.user(&account.user_id).unwrap().address_mode().unwrap(),
        AddressMode::Combined
    );

    bridge.close().await;
}

#[tokio::test]
async fn test_failed_switch_keeps_previous_mode() {
    let account = account();
    let vault = Vault::in_memory();
    let bridge = bridge(&account, Arc::clone(&vault));
    let session = bridge.login(USERNAME, PASSWORD).await.unwrap();
    let events = session.events();
    let views = handle_updates(&session);

    until_finished(&events).await;
    wait_for_state(&session, SessionState::Ready).await;

    account
        .server
        .fail_next_listings(&account.user_id, 100)
        .unwrap();
    let err = session
        .set_address_mode(AddressMode::Split)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::ModeSwitch {
            target: AddressMode::Split,
            ..
        }
    ));

    let seen = until_finished(&events).await;
    assert!(matches!(seen.first(), Some(Event::SyncStarted { .. })));
    assert!(matches!(seen.last(), Some(Event::SyncFailed { .. })));
    assert_eq!(count(&seen, is_failed), 1);
    assert_eq!(count(&seen, is_finished), 0);
    assert_quiet(&events, Duration::from_millis(100)).await;

    assert_eq!(session.get_address_mode().unwrap(), AddressMode::Combined);
    assert_eq!(
        vault.user(&account.user_id).unwrap().address_mode().unwrap(),
        AddressMode::Combined
    );
    assert_eq!(session.state(), SessionState::Syncing);
    assert_eq!(session.new_connectors().unwrap().len(), 1);

    // The session can still recover in its previous mode.
    account
        .server
        .fail_next_listings(&account.user_id, 0)
        .unwrap();
    resync(&session).await;
    let seen = until_finished(&events).await;
    assert!(matches!(seen.last(), Some(Event::SyncFinished { .. })));
    wait_for_state(&session, SessionState::Ready).await;
    assert_eq!(session.get_address_mode().unwrap(), AddressMode::Combined);
    eventually(|| views.message_count() == 5).await;

    bridge.close().await;
}

#[tokio::test]
async fn test_deauth_after_sync() {
    let account = account();
    let vault = Vault::in_memory();
    let bridge = bridge(&account, Arc::clone(&vault));
    let session = bridge.login(USERNAME, PASSWORD).await.unwrap();
    let events = session.events();
    let _views = handle_updates(&session);

    until_finished(&events).await;
    account.server.revoke_user(&account.user_id).unwrap();

    let mut seen = events_until(&events, is_deauth).await;
    assert_eq!(session.state(), SessionState::Deauthenticated);
    assert!(!vault.user(&account.user_id).unwrap().has_auth().unwrap());

    assert!(matches!(session.name(), Err(Error::Terminated)));
    assert!(matches!(session.new_connectors(), Err(Error::Terminated)));
    assert!(matches!(
        session.set_address_mode(AddressMode::Split).await,
        Err(Error::Terminated)
    ));
    assert!(matches!(session.resync().await, Err(Error::Terminated)));

    session.close().await;
    assert_eq!(session.state(), SessionState::Deauthenticated);
    while let Some(event) = events.recv().await {
        seen.push(event);
    }
    assert_eq!(count(&seen, is_deauth), 1);

    bridge.close().await;
}

#[tokio::test]
async fn test_deauth_during_sync_reports_no_failure() {
    let account = account();
    let bridge = bridge(&account, Vault::in_memory());
    let session = bridge.login(USERNAME, PASSWORD).await.unwrap();
    let events = session.events();

    assert!(matches!(
        next_event(&events).await,
        Event::SyncStarted { .. }
    ));
    account.server.revoke_user(&account.user_id).unwrap();

    let mut seen = events_until(&events, is_deauth).await;
    session.close().await;
    while let Some(event) = events.recv().await {
        seen.push(event);
    }

    assert_eq!(count(&seen, is_failed), 0);
    assert_eq!(count(&seen, is_finished), 0);
    assert_eq!(count(&seen, is_deauth), 1);

    bridge.close().await;
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let account = account();
    account
        .server
        .fail_next_listings(&account.user_id, 3)
        .unwrap();
    let bridge = bridge(&account, Vault::in_memory());
    let session = bridge.login(USERNAME, PASSWORD).await.unwrap();
    let events = session.events();
    let views = handle_updates(&session);

    let seen = until_finished(&events).await;
    assert_eq!(count(&seen, is_failed), 0);
    assert!(matches!(seen.last(), Some(Event::SyncFinished { .. })));
    assert_eq!(views.message_count(), 5);

    bridge.close().await;
}

#[tokio::test]
async fn test_exhausted_retries_fail_once() {
    let account = account();
    account
        .server
        .fail_next_listings(&account.user_id, 100)
        .unwrap();
    let bridge = bridge(&account, Vault::in_memory());
    let session = bridge.login(USERNAME, PASSWORD).await.unwrap();
    let events = session.events();
    let _views = handle_updates(&session);

    let seen = until_finished(&events).await;
    assert!(matches!(seen.last(), Some(Event::SyncFailed { .. })));
    assert_eq!(count(&seen, is_failed), 1);
    assert_eq!(count(&seen, is_finished), 0);

    assert_quiet(&events, Duration::from_millis(200)).await;
    assert_eq!(session.state(), SessionState::Syncing);

    bridge.close().await;
}

#[tokio::test]
async fn test_failed_sync_resumes_after_last_page() {
    let account = account();
    let bridge = bridge(&account, Vault::in_memory());
    let session = bridge.login(USERNAME, PASSWORD).await.unwrap();
    let events = session.events();

    // Break the listing as soon as the first page of messages arrives.
    let connector = session.new_connectors().unwrap().remove(0);
    let delivered = Arc::new(std::sync::Mutex::new(Vec::new()));
    {
        let server = account.server.clone();
        let user_id = account.user_id.clone();
        let delivered = Arc::clone(&delivered);
        tokio::spawn(async move {
            let mut broken = false;
            while let Some(update) = connector.next_update().await {
                if let UpdateKind::MessagesCreated(messages) = update.kind() {
                    delivered
                        .lock()
                        .unwrap()
                        .extend(messages.iter().map(|m| m.id.clone()));
                    if !broken {
                        server.fail_next_listings(&user_id, 100).unwrap();
                        broken = true;
                    }
                }
                update.done();
            }
        });
    }

    let first = until_finished(&events).await;
    assert!(matches!(first.last(), Some(Event::SyncFailed { .. })));
    assert_eq!(delivered.lock().unwrap().len(), 2);

    account
        .server
        .fail_next_listings(&account.user_id, 0)
        .unwrap();
    resync(&session).await;

    let second = until_finished(&events).await;
    assert!(matches!(second.last(), Some(Event::SyncFinished { .. })));
    assert!(progress_values(&second)[0] > 0.4);

    let mut ids = delivered.lock().unwrap().clone();
    assert_eq!(ids.len(), 5);
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 5);

    bridge.close().await;
}

#[tokio::test]
async fn test_live_updates_follow_sync() {
    let account = account();
    let bridge = bridge(&account, Vault::in_memory());
    let session = bridge.login(USERNAME, PASSWORD).await.unwrap();
    let events = session.events();
    let views = handle_updates(&session);

    until_finished(&events).await;
    wait_for_state(&session, SessionState::Ready).await;

    let id = account
        .server
        .create_message(&account.user_id, &account.address_ids[1], "Live", &["0"])
        .unwrap();
    eventually(|| views.find_message(&id).is_some()).await;
    assert!(!views.find_message(&id).unwrap().seen);

    account
        .server
        .delete_message(&account.user_id, &account.message_ids[0])
        .unwrap();
    eventually(|| views.find_message(&account.message_ids[0]).is_none()).await;

    let label_id = account
        .server
        .create_label(&account.user_id, "Receipts", protonmail_bridge::remote::LabelType::Label)
        .unwrap();
    eventually(|| {
        views
            .get(&account.address_ids[0])
            .mailbox_names()
            .contains(&"Labels/Receipts".to_string())
    })
    .await;
    assert!(!label_id.is_empty());

    bridge.close().await;
}

#[tokio::test]
async fn test_connector_writes_reach_the_remote() {
    let account = account();
    let bridge = bridge(&account, Vault::in_memory());
    let session = bridge.login(USERNAME, PASSWORD).await.unwrap();
    let events = session.events();
    let views = handle_updates(&session);

    until_finished(&events).await;
    wait_for_state(&session, SessionState::Ready).await;

    let connector = session.new_connectors().unwrap().remove(0);
    let id = account.message_ids[0].clone();

    connector
        .mark_messages_seen(std::slice::from_ref(&id), true)
        .await
        .unwrap();
    connector
        .mark_messages_flagged(std::slice::from_ref(&id), true)
        .await
        .unwrap();
    connector
        .add_messages_to_mailbox(std::slice::from_ref(&id), &account.folder_id)
        .await
        .unwrap();

    let remote = account
        .server
        .message(&account.user_id, &id)
        .unwrap()
        .unwrap();
    assert!(!remote.unread);
    assert!(remote.has_label(&account.folder_id));

    eventually(|| {
        views.find_message(&id).is_some_and(|m| {
            m.seen && m.flagged && m.mailbox_ids.contains(&account.folder_id)
        })
    })
    .await;

    assert!(matches!(
        connector
            .remove_messages_from_mailbox(std::slice::from_ref(&id), "5")
            .await,
        Err(Error::Remote(_))
    ));

    bridge.close().await;
}

#[tokio::test]
async fn test_connector_authorization() {
    let account = account();
    let bridge = bridge(&account, Vault::in_memory());
    let session = bridge.login(USERNAME, PASSWORD).await.unwrap();
    let events = session.events();
    let _views = handle_updates(&session);
    let pass = session.bridge_pass().unwrap();

    let combined = session.new_connectors().unwrap().remove(0);
    assert!(combined.authorize("alice@pm.me", pass.as_bytes()));
    assert!(combined.authorize("ALIAS@pm.me", pass.as_bytes()));
    assert!(!combined.authorize("alice@pm.me", b"wrong"));
    assert!(!combined.authorize("bob@pm.me", pass.as_bytes()));

    until_finished(&events).await;
    wait_for_state(&session, SessionState::Ready).await;
    session.set_address_mode(AddressMode::Split).await.unwrap();

    // Handles of a replaced generation stop working.
    assert!(combined.is_closed());
    assert!(!combined.authorize("alice@pm.me", pass.as_bytes()));

    let split = session.new_connectors().unwrap();
    assert!(split[1].authorize("alias@pm.me", pass.as_bytes()));
    assert!(!split[1].authorize("alice@pm.me", pass.as_bytes()));

    bridge.close().await;
}

#[tokio::test]
async fn test_cursor_waits_for_acknowledgement() {
    let account = account();
    let vault = Vault::in_memory();
    let bridge = bridge(&account, Arc::clone(&vault));
    let session = bridge.login(USERNAME, PASSWORD).await.unwrap();
    let events = session.events();

    let connector = session.new_connectors().unwrap().remove(0);
    let hold = Arc::new(AtomicBool::new(false));
    let (held_tx, mut held_rx) = mpsc::unbounded_channel();
    {
        let hold = Arc::clone(&hold);
        tokio::spawn(async move {
            while let Some(update) = connector.next_update().await {
                if hold.load(Ordering::SeqCst) {
                    let _ = held_tx.send(update);
                } else {
                    update.done();
                }
            }
        });
    }

    until_finished(&events).await;
    wait_for_state(&session, SessionState::Ready).await;

    let user = vault.user(&account.user_id).unwrap();
    let cursor = user.event_id().unwrap();
    hold.store(true, Ordering::SeqCst);

    let id = account
        .server
        .create_message(&account.user_id, &account.address_ids[0], "Late", &["0"])
        .unwrap();
    let update = tokio::time::timeout(TIMEOUT, held_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        update.kind(),
        UpdateKind::MessagesCreated(messages) if messages[0].id == id
    ));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(user.event_id().unwrap(), cursor);

    update.done();
    eventually(|| user.event_id().unwrap() != cursor).await;

    bridge.close().await;
}

#[tokio::test]
async fn test_refresh_rebuilds_connectors() {
    let account = account();
    let bridge = bridge(&account, Vault::in_memory());
    let session = bridge.login(USERNAME, PASSWORD).await.unwrap();
    let events = session.events();
    let views = handle_updates(&session);

    until_finished(&events).await;
    wait_for_state(&session, SessionState::Ready).await;
    let generation = *session.watch_connectors().borrow();

    account.server.refresh(&account.user_id).unwrap();

    let seen = events_until(&events, is_finished).await;
    assert!(matches!(seen.first(), Some(Event::SyncStarted { .. })));
    assert!(*session.watch_connectors().borrow() > generation);
    wait_for_state(&session, SessionState::Ready).await;
    assert_eq!(views.message_count(), 5);

    bridge.close().await;
}

#[tokio::test]
async fn test_new_address_resyncs_split_mode() {
    let account = account();
    let bridge = bridge(&account, Vault::in_memory());
    let session = bridge.login(USERNAME, PASSWORD).await.unwrap();
    let events = session.events();
    let _views = handle_updates(&session);

    until_finished(&events).await;
    wait_for_state(&session, SessionState::Ready).await;
    session.set_address_mode(AddressMode::Split).await.unwrap();
    events_until(&events, |e| matches!(e, Event::AddressModeChanged { .. })).await;
    wait_for_state(&session, SessionState::Ready).await;

    account
        .server
        .create_address(&account.user_id, "third@pm.me")
        .unwrap();

    events_until(&events, is_finished).await;
    wait_for_state(&session, SessionState::Ready).await;
    assert_eq!(session.new_connectors().unwrap().len(), 3);
    assert_eq!(session.emails().unwrap().len(), 3);

    bridge.close().await;
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let account = account();
    let bridge = bridge(&account, Vault::in_memory());
    let session = bridge.login(USERNAME, PASSWORD).await.unwrap();
    let events = session.events();
    let _views = handle_updates(&session);
    until_finished(&events).await;

    session.close().await;
    session.close().await;

    assert_eq!(session.state(), SessionState::Closed);
    assert!(matches!(session.bridge_pass(), Err(Error::Terminated)));
    while events.recv().await.is_some() {}

    bridge.close().await;
}
