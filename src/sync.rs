//! Full synchronization of an account into connector state
//!
//! A run enumerates remote labels, then message metadata in ascending
//! remote id order, and pushes both through the connector queues. After
//! every page is acknowledged, the last delivered id is persisted, so a
//! failed run resumes from there instead of re-delivering what the
//! connectors already hold.

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::event::{Event, EventBus};
use crate::mailbox;
use crate::propagator::UpdatePropagator;
use crate::remote::{Label, RemoteClient};
use crate::update::UpdateKind;
use crate::vault::VaultUser;
use std::collections::HashSet;
use std::future::Future;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything a sync run reads from and writes to.
pub(crate) struct SyncContext<'a> {
    pub(crate) user_id: &'a str,
    pub(crate) client: &'a dyn RemoteClient,
    pub(crate) vault: &'a VaultUser,
    pub(crate) propagator: &'a UpdatePropagator,
    pub(crate) bus: &'a EventBus,
    pub(crate) config: &'a SyncConfig,
    /// Cache of mailbox-backed labels, refreshed by every run.
    pub(crate) labels: &'a RwLock<Vec<Label>>,
    pub(crate) work: &'a CancellationToken,
}

impl SyncContext<'_> {
    async fn publish(&self, event: Event) -> Result<()> {
        if self.bus.publish(event, self.work).await {
            Ok(())
        } else {
            Err(Error::Terminated)
        }
    }
}

/// Call `f` until it succeeds, retrying transient failures with
/// exponential backoff up to `config.max_retries` times.
pub(crate) async fn retry<T, F, Fut>(
    config: &SyncConfig,
    work: &CancellationToken,
    what: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        if work.is_cancelled() {
            return Err(Error::Terminated);
        }

        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                attempt += 1;
                let delay = config.backoff(attempt);
                warn!(
                    "{} failed: {}; retry {}/{} in {:?}",
                    what, e, attempt, config.max_retries, delay
                );
                tokio::select! {
                    biased;
                    () = work.cancelled() => return Err(Error::Terminated),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Run one full sync and report it on the event bus.
///
/// Publishes `SyncStarted`, a `SyncProgress` per delivered page, then
/// `SyncFinished` or `SyncFailed`. `commit` runs after the last page is
/// acknowledged and before `SyncFinished`; if it fails the run fails.
///
/// Cancellation and revocation end the run without a terminal event;
/// the caller reports those transitions itself. Once `commit` succeeds
/// the run counts as done, even if it is cancelled before
/// `SyncFinished` goes out.
pub(crate) async fn run(ctx: &SyncContext<'_>, commit: impl FnOnce() -> Result<()>) -> Result<()> {
    let start = Instant::now();
    info!("Starting sync of {} ({} mode)", ctx.user_id, ctx.propagator.mode());

    ctx.publish(Event::SyncStarted {
        user_id: ctx.user_id.to_string(),
    })
    .await?;

    let result = sync(ctx, start).await.and_then(|()| commit());

    match result {
        Ok(()) => {
            info!("Finished sync of {} in {:?}", ctx.user_id, start.elapsed());
            let finished = Event::SyncFinished {
                user_id: ctx.user_id.to_string(),
            };
            if ctx.publish(finished).await.is_err() {
                debug!("Sync of {} committed after cancellation", ctx.user_id);
            }
            Ok(())
        }
        Err(_) if ctx.work.is_cancelled() => {
            debug!("Sync of {} cancelled", ctx.user_id);
            Err(Error::Terminated)
        }
        Err(Error::Revoked) => Err(Error::Revoked),
        Err(e) => {
            error!("Sync of {} failed: {}", ctx.user_id, e);
            ctx.publish(Event::SyncFailed {
                user_id: ctx.user_id.to_string(),
                error: e.to_string(),
            })
            .await?;
            Err(Error::Sync(e.to_string()))
        }
    }
}

async fn sync(ctx: &SyncContext<'_>, start: Instant) -> Result<()> {
    let status = ctx.vault.sync_status()?;

    // A fresh run replays remote changes from the moment it began once
    // it is done; a resumed run keeps the cursor of the first attempt.
    if !status.has_labels && status.last_message_id.is_none() {
        let cursor = retry(ctx.config, ctx.work, "get latest event", || {
            ctx.client.get_latest_event_id()
        })
        .await?;
        ctx.vault.set_event_id(&cursor)?;
    }

    let remote_labels = retry(ctx.config, ctx.work, "get labels", || ctx.client.get_labels()).await?;
    let wanted: Vec<Label> = remote_labels
        .iter()
        .filter(|l| mailbox::is_wanted(l))
        .cloned()
        .collect();
    *ctx.labels
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner) = wanted.clone();

    if status.has_labels {
        debug!("Labels of {} already synced", ctx.user_id);
    } else {
        sync_labels(ctx, &wanted).await?;
        ctx.vault.set_has_labels()?;
    }

    if status.has_messages {
        debug!("Messages of {} already synced", ctx.user_id);
    } else {
        let known: HashSet<String> = wanted.into_iter().map(|l| l.id).collect();
        sync_messages(ctx, &known, start).await?;
        ctx.vault.set_has_messages()?;
    }

    Ok(())
}

async fn sync_labels(ctx: &SyncContext<'_>, labels: &[Label]) -> Result<()> {
    let mut batch = ctx.propagator.batch();
    for mailbox in mailbox::mailboxes(labels) {
        ctx.propagator
            .broadcast(&UpdateKind::MailboxCreated(mailbox), &mut batch)?;
    }
    debug!("Waiting for {} mailbox update(s)", batch.len());
    batch.wait(ctx.work).await
}

async fn sync_messages(
    ctx: &SyncContext<'_>,
    known: &HashSet<String>,
    start: Instant,
) -> Result<()> {
    let status = ctx.vault.sync_status()?;
    let total = retry(ctx.config, ctx.work, "count messages", || {
        ctx.client.count_messages()
    })
    .await?;

    let mut last = status.last_message_id;
    let mut synced = status.synced_messages;
    let mut reported = false;
    let page_size = ctx.config.page_size;
    let is_known = |id: &str| known.contains(id);

    loop {
        let client = ctx.client;
        let after = last.as_deref();
        let page = retry(ctx.config, ctx.work, "list messages", move || {
            client.get_messages(after, page_size)
        })
        .await?;

        let Some(tail) = page.last() else {
            break;
        };
        let tail_id = tail.id.clone();

        let mut batch = ctx.propagator.batch();
        let mut by_address: Vec<(String, Vec<crate::update::Message>)> = Vec::new();
        for meta in &page {
            let message = mailbox::to_message(meta, &is_known);
            match by_address.iter_mut().find(|(id, _)| *id == meta.address_id) {
                Some((_, messages)) => messages.push(message),
                None => by_address.push((meta.address_id.clone(), vec![message])),
            }
        }
        for (address_id, messages) in by_address {
            ctx.propagator
                .send(&address_id, UpdateKind::MessagesCreated(messages), &mut batch)?;
        }
        batch.wait(ctx.work).await?;

        synced += page.len();
        ctx.vault.set_last_message(&tail_id, synced)?;
        last = Some(tail_id);

        ctx.publish(progress_event(ctx.user_id, synced, total, start.elapsed()))
            .await?;
        reported = true;

        if page.len() < page_size {
            break;
        }
    }

    if !reported {
        ctx.publish(progress_event(ctx.user_id, synced, total, start.elapsed()))
            .await?;
    }

    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn progress_event(user_id: &str, synced: usize, total: usize, elapsed: Duration) -> Event {
    let progress = if total == 0 {
        1.0
    } else {
        (synced as f64 / total as f64).min(1.0)
    };
    let remaining = if progress > 0.0 {
        elapsed.mul_f64((1.0 - progress) / progress)
    } else {
        Duration::ZERO
    };

    Event::SyncProgress {
        user_id: user_id.to_string(),
        progress,
        synced,
        total,
        elapsed,
        remaining,
    }
}
