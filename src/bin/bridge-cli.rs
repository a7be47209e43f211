#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! CLI for exercising bridge sessions against an offline account fixture

use clap::{Parser, Subcommand};
use protonmail_bridge::remote::memory::MemoryServer;
use protonmail_bridge::{
    AddressMode, Bridge, BridgeConfig, Event, LocalView, Session, SessionState,
    Vault,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bridge-cli")]
#[command(about = "Drive Proton Mail bridge sessions against a local fixture")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Log in to a fixture account, sync it and print the result
    Simulate {
        /// JSON account fixture
        #[arg(long)]
        fixture: PathBuf,

        #[arg(long)]
        username: String,

        #[arg(long)]
        password: String,

        /// Switch to split address mode after the first sync
        #[arg(long)]
        split: bool,
    },

    /// List users stored in the vault
    Users,
}

/// Connector views keyed by namespace address id.
type Views = Arc<Mutex<BTreeMap<String, LocalView>>>;

#[derive(Serialize)]
struct NamespaceReport {
    address_id: String,
    emails: Vec<String>,
    mailboxes: Vec<String>,
    messages: usize,
    unread: usize,
}

#[derive(Serialize)]
struct PhaseReport {
    mode: AddressMode,
    events: Vec<Event>,
    namespaces: Vec<NamespaceReport>,
}

#[derive(Serialize)]
struct UserReport {
    user_id: String,
    username: String,
    address_mode: AddressMode,
    logged_in: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = BridgeConfig::from_env()?;

    match &args.command {
        Command::Simulate {
            fixture,
            username,
            password,
            split,
        } => {
            cmd_simulate(&args, config, fixture, username, password, *split).await?;
        }
        Command::Users => {
            cmd_users(&args, &config)?;
        }
    }

    Ok(())
}

async fn cmd_simulate(
    args: &Args,
    config: BridgeConfig,
    fixture: &Path,
    username: &str,
    password: &str,
    split: bool,
) -> anyhow::Result<()> {
    let server = MemoryServer::from_fixture(fixture)?;
    let vault_dir = tempfile::tempdir()?;
    let vault = Vault::open(vault_dir.path())?;
    let bridge = Bridge::new(vault, Arc::new(server), config);

    let session = bridge.login(username, password.as_bytes()).await?;
    let views: Views = Arc::default();
    let driver = drive_connectors(Arc::clone(&session), Arc::clone(&views));

    let mut phases = Vec::new();
    let events = wait_for_sync(&session).await?;
    phases.push(report(&session, &views, events)?);

    if split {
        session
            .watch_state()
            .wait_for(|state| *state == SessionState::Ready)
            .await?;
        let switch = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.set_address_mode(AddressMode::Split).await })
        };
        let mut events = wait_for_sync(&session).await?;
        switch.await??;
        if let Some(changed) = session.events().recv().await {
            events.push(changed);
        }
        phases.push(report(&session, &views, events)?);
    }

    bridge.close().await;
    driver.abort();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&phases)?);
    } else {
        for phase in &phases {
            print_phase(phase);
        }
    }

    Ok(())
}

/// Read events until the running sync finishes.
async fn wait_for_sync(session: &Session) -> anyhow::Result<Vec<Event>> {
    let stream = session.events();
    let mut events = Vec::new();

    while let Some(event) = stream.recv().await {
        let done = matches!(event, Event::SyncFinished { .. });
        let failed = match &event {
            Event::SyncFailed { error, .. } => Some(error.clone()),
            Event::UserDeauth { .. } => Some("session was revoked".to_string()),
            _ => None,
        };
        events.push(event);

        if let Some(error) = failed {
            anyhow::bail!("Sync failed: {error}");
        }
        if done {
            return Ok(events);
        }
    }

    anyhow::bail!("Session closed before sync finished")
}

/// Apply every connector update to a per-namespace view, following
/// connector replacements.
fn drive_connectors(session: Arc<Session>, views: Views) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut generation = session.watch_connectors();
        loop {
            generation.borrow_and_update();
            let Ok(connectors) = session.new_connectors() else {
                return;
            };

            views
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clear();

            let readers: Vec<JoinHandle<()>> = connectors
                .into_iter()
                .map(|connector| {
                    let views = Arc::clone(&views);
                    tokio::spawn(async move {
                        while let Some(update) = connector.next_update().await {
                            let (kind, ack) = update.into_parts();
                            views
                                .lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner)
                                .entry(connector.address_id().to_string())
                                .or_default()
                                .apply(&kind);
                            ack.done();
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
    })
}

fn report(session: &Session, views: &Views, events: Vec<Event>) -> anyhow::Result<PhaseReport> {
    let connectors = session.new_connectors()?;
    let views = views
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);

    let namespaces = connectors
        .iter()
        .map(|connector| {
            let view = views.get(connector.address_id()).cloned().unwrap_or_default();
            NamespaceReport {
                address_id: connector.address_id().to_string(),
                emails: connector.emails(),
                mailboxes: view.mailbox_names(),
                messages: view.message_count(),
                unread: view.unread_count(),
            }
        })
        .collect();

    Ok(PhaseReport {
        mode: session.get_address_mode()?,
        events,
        namespaces,
    })
}

fn cmd_users(args: &Args, config: &BridgeConfig) -> anyhow::Result<()> {
    let vault = Vault::open(&config.vault_dir)?;
    let users = vault
        .user_ids()
        .into_iter()
        .map(|user_id| {
            let user = vault.user(&user_id)?;
            Ok(UserReport {
                username: user.username()?,
                address_mode: user.address_mode()?,
                logged_in: user.has_auth()?,
                user_id,
            })
        })
        .collect::<protonmail_bridge::Result<Vec<_>>>()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&users)?);
    } else if users.is_empty() {
        println!("No users found.");
    } else {
        println!("{:<24} {:<24} {:<10} Logged in", "ID", "Username", "Mode");
        println!("{}", "-".repeat(70));
        for user in &users {
            println!(
                "{:<24} {:<24} {:<10} {}",
                user.user_id,
                user.username,
                user.address_mode,
                if user.logged_in { "yes" } else { "no" }
            );
        }
    }

    Ok(())
}

fn print_phase(phase: &PhaseReport) {
    println!("== {} mode ==", phase.mode);

    for event in &phase.events {
        match event {
            Event::SyncStarted { .. } => println!("sync started"),
            Event::SyncProgress {
                progress,
                synced,
                total,
                ..
            } => println!("sync progress {:.0}% ({synced}/{total})", progress * 100.0),
            Event::SyncFinished { .. } => println!("sync finished"),
            Event::SyncFailed { error, .. } => println!("sync failed: {error}"),
            Event::UserDeauth { .. } => println!("user deauthenticated"),
            Event::AddressModeChanged { mode, .. } => println!("address mode changed to {mode}"),
        }
    }

    for ns in &phase.namespaces {
        println!();
        println!("Namespace {} ({})", ns.address_id, ns.emails.join(", "));
        for mailbox in &ns.mailboxes {
            println!("  {mailbox}");
        }
        println!("  {} message(s), {} unread", ns.messages, ns.unread);
    }
    println!();
}
