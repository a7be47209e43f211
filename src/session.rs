//! Per-account session
//!
//! A [`Session`] owns everything the bridge runs for one logged-in
//! account: the remote client, the connector queues of the current
//! address mode, the event stream, and the background work that keeps
//! connectors in step with the remote service.
//!
//! ```text
//! Authenticating -> Syncing -> Ready <-> SwitchingMode -> Syncing
//!                      any non-terminal -> Deauthenticated | Closed
//! ```
//!
//! At most one background phase (sync, then live polling) runs at a
//! time. Mode switches and resyncs stop the running phase and wait for
//! it to exit before the next one starts, so two syncs never feed the
//! same connectors.

use crate::config::BridgeConfig;
use crate::connector::{Connector, ConnectorContext};
use crate::error::{Error, Result};
use crate::event::{Event, EventBus, EventStream};
use crate::mailbox;
use crate::mode::AddressMode;
use crate::propagator::{Batch, UpdatePropagator};
use crate::remote::{Address, Label, RemoteClient, RemoteEvent};
use crate::sync::{self, SyncContext};
use crate::update::UpdateKind;
use crate::vault::VaultUser;
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Authenticating,
    Syncing,
    Ready,
    SwitchingMode,
    Deauthenticated,
    Closed,
}

impl SessionState {
    /// Terminal states are never left.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Deauthenticated | Self::Closed)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Authenticating => "authenticating",
            Self::Syncing => "syncing",
            Self::Ready => "ready",
            Self::SwitchingMode => "switching mode",
            Self::Deauthenticated => "deauthenticated",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a live polling loop ended.
enum LiveExit {
    Stopped,
    Resync,
}

/// Clears the running-sync flag when a sync attempt ends.
struct RunningSync<'a>(&'a AtomicBool);

impl Drop for RunningSync<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Session {
    id: String,
    vault: VaultUser,
    client: Arc<dyn RemoteClient>,
    config: BridgeConfig,
    bridge_pass: String,

    name: RwLock<String>,
    addresses: Arc<RwLock<Vec<Address>>>,
    labels: RwLock<Vec<Label>>,
    /// Committed address mode; only a finished switch changes it.
    mode: RwLock<AddressMode>,

    state: watch::Sender<SessionState>,
    propagator: RwLock<Arc<UpdatePropagator>>,
    generation: watch::Sender<u64>,
    bus: EventBus,

    root: CancellationToken,
    /// Token of the current background phase, a child of `root`.
    work: Mutex<CancellationToken>,
    phase: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    sync_running: AtomicBool,
    tasks: TaskTracker,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Authenticate the account against the remote service and start
    /// its background work.
    ///
    /// The session comes back `Syncing`, or `Ready` if the vault already
    /// records a completed sync.
    pub async fn new(
        vault: VaultUser,
        client: Arc<dyn RemoteClient>,
        config: &BridgeConfig,
    ) -> Result<Arc<Self>> {
        let root = CancellationToken::new();
        let user_id = vault.user_id().to_string();
        debug!("Authenticating session {}", user_id);

        let user = sync::retry(&config.sync, &root, "get user", || client.get_user()).await?;
        if user.id != user_id {
            return Err(Error::Vault(format!(
                "Remote user {} does not match vault record {}",
                user.id, user_id
            )));
        }

        let addresses =
            sync::retry(&config.sync, &root, "get addresses", || client.get_addresses()).await?;
        if addresses.is_empty() {
            return Err(Error::Remote(format!("User {user_id} has no addresses")));
        }

        let labels: Vec<Label> =
            sync::retry(&config.sync, &root, "get labels", || client.get_labels())
                .await?
                .into_iter()
                .filter(mailbox::is_wanted)
                .collect();

        let mode = vault.address_mode()?;
        let bridge_pass = vault.bridge_pass()?;
        let propagator = UpdatePropagator::new(mode, &addresses, 1, &root);
        let (state, _) = watch::channel(SessionState::Authenticating);
        let (generation, _) = watch::channel(1);

        let session = Arc::new(Self {
            id: user_id,
            vault,
            client,
            config: config.clone(),
            bridge_pass,
            name: RwLock::new(user.name),
            addresses: Arc::new(RwLock::new(addresses)),
            labels: RwLock::new(labels),
            mode: RwLock::new(mode),
            state,
            propagator: RwLock::new(Arc::new(propagator)),
            generation,
            bus: EventBus::new(config.events.buffer),
            work: Mutex::new(root.child_token()),
            root,
            phase: tokio::sync::Mutex::new(None),
            sync_running: AtomicBool::new(false),
            tasks: TaskTracker::new(),
        });

        session.watch_deauth();

        let synced = session.vault.sync_status()?.is_complete();
        let work = session.next_work_token();
        if synced {
            session.set_state(SessionState::Ready);
        } else {
            session.sync_running.store(true, Ordering::SeqCst);
            session.set_state(SessionState::Syncing);
        }
        session.spawn_phase(work, !synced).await;

        info!("Session {} started in {} mode", session.id, mode);
        Ok(session)
    }

    // ── Accessors ──────────────────────────────────────────────

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Follow state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// The ordered event stream. Stays readable after the session ends
    /// so the final events can be drained.
    #[must_use]
    pub fn events(&self) -> EventStream {
        self.bus.stream()
    }

    pub fn name(&self) -> Result<String> {
        self.ensure_live()?;
        Ok(self
            .name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    /// Every address of the account, primary first.
    pub fn emails(&self) -> Result<Vec<String>> {
        self.ensure_live()?;
        Ok(self
            .addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|a| a.email.clone())
            .collect())
    }

    /// Password local mail clients use against the bridge.
    pub fn bridge_pass(&self) -> Result<String> {
        self.ensure_live()?;
        Ok(self.bridge_pass.clone())
    }

    /// The committed address mode. During a switch this is still the
    /// previous mode.
    pub fn get_address_mode(&self) -> Result<AddressMode> {
        self.ensure_live()?;
        Ok(self.committed_mode())
    }

    /// Connectors of the current generation, one per namespace.
    pub fn new_connectors(&self) -> Result<Vec<Connector>> {
        self.ensure_live()?;
        let ctx = ConnectorContext {
            client: Arc::clone(&self.client),
            bridge_pass: self.bridge_pass.clone(),
            addresses: Arc::clone(&self.addresses),
        };
        Ok(self.propagator().connectors(&ctx))
    }

    /// Changes whenever the connector set is replaced; callers should
    /// then fetch fresh handles with [`Session::new_connectors`].
    #[must_use]
    pub fn watch_connectors(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    // ── Operations ─────────────────────────────────────────────

    /// Switch between combined and split address mode.
    ///
    /// Only a `Ready` session accepts a switch. The connectors are
    /// replaced and fully resynced; the new mode is persisted right
    /// before `SyncFinished` is published, so a failed switch leaves the
    /// previous mode in place. On failure the session stays `Syncing`
    /// with connectors of the previous mode until [`Session::resync`].
    pub async fn set_address_mode(self: &Arc<Self>, target: AddressMode) -> Result<()> {
        self.ensure_live()?;
        if self.committed_mode() == target {
            debug!("Session {} already in {} mode", self.id, target);
            return Ok(());
        }

        if !self.transition(SessionState::Ready, SessionState::SwitchingMode) {
            let state = self.state();
            return Err(if state.is_terminal() {
                Error::Terminated
            } else {
                Error::NotReady(state)
            });
        }
        self.sync_running.store(true, Ordering::SeqCst);

        info!("Switching {} to {} mode", self.id, target);
        let this = Arc::clone(self);
        self.tasks
            .spawn(async move { this.switch_address_mode(target).await })
            .await
            .map_err(|e| Error::ModeSwitch {
                target,
                cause: e.to_string(),
            })?
    }

    /// Drop connector state and sync again from scratch, or retry a
    /// sync that failed.
    pub async fn resync(self: &Arc<Self>) -> Result<()> {
        self.ensure_live()?;
        let rebuild = if self.transition(SessionState::Ready, SessionState::Syncing) {
            self.sync_running.store(true, Ordering::SeqCst);
            true
        } else if self.state() == SessionState::Syncing
            && self
                .sync_running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            false
        } else {
            return Err(Error::NotReady(self.state()));
        };

        self.stop_phase().await;
        if rebuild {
            info!("Rebuilding {} from scratch", self.id);
            self.vault.clear_sync_status()?;
            self.reset_connectors(self.committed_mode());
        } else {
            info!("Retrying sync of {}", self.id);
        }

        let work = self.next_work_token();
        self.spawn_phase(work, true).await;
        Ok(())
    }

    /// Stop all background work and release the connectors. Idempotent;
    /// calling it on a deauthenticated session only releases resources.
    pub async fn close(&self) {
        let closed = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = SessionState::Closed;
                true
            }
        });
        if closed {
            info!("Closing session {}", self.id);
        }

        self.root.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.propagator().close();
        self.bus.close().await;
    }

    // ── Background phases ─────────────────────────────────────

    async fn spawn_phase(self: &Arc<Self>, work: CancellationToken, sync_first: bool) {
        let this = Arc::clone(self);
        let handle = self
            .tasks
            .spawn(async move { this.run_phase(work, sync_first).await });
        *self.phase.lock().await = Some(handle);
    }

    /// Cancel the running phase and wait until it has exited.
    async fn stop_phase(&self) {
        self.work_token().cancel();
        let handle = self.phase.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Background phase of {} panicked: {}", self.id, e);
            }
        }
    }

    async fn run_phase(self: Arc<Self>, work: CancellationToken, mut sync_first: bool) {
        loop {
            if sync_first {
                let result = {
                    let _running = RunningSync(&self.sync_running);
                    self.sync_current_mode(&work).await
                };
                match result {
                    Ok(()) => {
                        if !self.transition(SessionState::Syncing, SessionState::Ready) {
                            return;
                        }
                    }
                    Err(Error::Revoked) => {
                        self.deauthenticate().await;
                        return;
                    }
                    Err(_) => return,
                }
            }

            match self.live_updates(&work).await {
                LiveExit::Stopped => return,
                LiveExit::Resync => {
                    if !self.transition(SessionState::Ready, SessionState::Syncing) {
                        return;
                    }
                    self.sync_running.store(true, Ordering::SeqCst);
                    if let Err(e) = self.vault.clear_sync_status() {
                        error!("Failed to reset sync status of {}: {}", self.id, e);
                        self.sync_running.store(false, Ordering::SeqCst);
                        return;
                    }
                    self.reset_connectors(self.committed_mode());
                    sync_first = true;
                }
            }
        }
    }

    async fn sync_current_mode(&self, work: &CancellationToken) -> Result<()> {
        let propagator = self.propagator();
        let ctx = self.sync_context(&propagator, work);
        sync::run(&ctx, || Ok(())).await
    }

    async fn switch_address_mode(self: Arc<Self>, target: AddressMode) -> Result<()> {
        let previous = self.committed_mode();
        self.stop_phase().await;
        let work = self.next_work_token();

        let _running = RunningSync(&self.sync_running);
        if let Err(e) = self.vault.clear_sync_status() {
            if self.transition(SessionState::SwitchingMode, SessionState::Ready) {
                self.spawn_phase(work, false).await;
            }
            return Err(Error::ModeSwitch {
                target,
                cause: e.to_string(),
            });
        }
        self.reset_connectors(target);
        self.transition(SessionState::SwitchingMode, SessionState::Syncing);

        let propagator = self.propagator();
        let ctx = self.sync_context(&propagator, &work);
        let result = sync::run(&ctx, || {
            self.vault.set_address_mode(target)?;
            *self.mode.write().unwrap_or_else(PoisonError::into_inner) = target;
            Ok(())
        })
        .await;

        match result {
            Ok(()) => {
                info!("Switched {} to {} mode", self.id, target);
                self.bus
                    .publish(
                        Event::AddressModeChanged {
                            user_id: self.id.clone(),
                            mode: target,
                        },
                        &work,
                    )
                    .await;
                if self.transition(SessionState::Syncing, SessionState::Ready) {
                    self.spawn_phase(work, false).await;
                }
                Ok(())
            }
            Err(Error::Revoked) => {
                self.deauthenticate().await;
                Err(Error::Revoked)
            }
            Err(Error::Terminated) => Err(Error::Terminated),
            Err(e) => {
                warn!(
                    "Switch of {} to {} mode failed, restoring {} mode connectors",
                    self.id, target, previous
                );
                if let Err(e) = self.vault.clear_sync_status() {
                    error!("Failed to reset sync status of {}: {}", self.id, e);
                }
                self.reset_connectors(previous);
                Err(Error::ModeSwitch {
                    target,
                    cause: e.to_string(),
                })
            }
        }
    }

    // ── Live updates ───────────────────────────────────────────

    fn poll_delay(&self) -> Duration {
        let events = &self.config.events;
        if events.jitter.is_zero() {
            return events.period;
        }
        events.period + rand::thread_rng().gen_range(Duration::ZERO..=events.jitter)
    }

    async fn live_updates(&self, work: &CancellationToken) -> LiveExit {
        info!("Session {} is ready, polling for remote changes", self.id);
        loop {
            let delay = self.poll_delay();
            tokio::select! {
                biased;
                () = work.cancelled() => return LiveExit::Stopped,
                () = tokio::time::sleep(delay) => {}
            }

            match self.poll_events(work).await {
                Ok(false) => {}
                Ok(true) => {
                    info!("Remote requested a full resync of {}", self.id);
                    return LiveExit::Resync;
                }
                Err(_) if work.is_cancelled() => return LiveExit::Stopped,
                Err(Error::Revoked) => {
                    self.deauthenticate().await;
                    return LiveExit::Stopped;
                }
                Err(Error::Terminated) => return LiveExit::Stopped,
                Err(e) => warn!("Failed to apply remote changes for {}: {}", self.id, e),
            }
        }
    }

    /// Apply pending remote events until the feed is drained. The vault
    /// cursor moves past a page only once all of its updates are
    /// acknowledged. Returns whether a full resync is needed.
    async fn poll_events(&self, work: &CancellationToken) -> Result<bool> {
        loop {
            if self.state() != SessionState::Ready {
                return Ok(false);
            }

            let cursor = self.vault.event_id()?;
            let page = self.client.get_events(&cursor).await?;
            if page.events.is_empty() {
                return Ok(false);
            }
            debug!("Applying {} remote event(s) for {}", page.events.len(), self.id);

            let propagator = self.propagator();
            let mut batch = propagator.batch();
            let mut resync = false;
            for event in &page.events {
                resync |= self.apply_event(event, &propagator, &mut batch)?;
            }
            batch.wait(work).await?;

            if resync {
                return Ok(true);
            }
            self.vault.set_event_id(&page.event_id)?;
            if !page.more {
                return Ok(false);
            }
        }
    }

    /// Turn one remote event into connector updates. Returns whether the
    /// event invalidates the connector state.
    fn apply_event(
        &self,
        event: &RemoteEvent,
        propagator: &UpdatePropagator,
        batch: &mut Batch,
    ) -> Result<bool> {
        let split = propagator.mode() == AddressMode::Split;

        match event {
            RemoteEvent::Refresh => return Ok(true),
            RemoteEvent::User(user) => {
                *self.name.write().unwrap_or_else(PoisonError::into_inner) = user.name.clone();
            }
            RemoteEvent::AddressCreated(address) | RemoteEvent::AddressUpdated(address) => {
                let mut addresses = self.addresses.write().unwrap_or_else(PoisonError::into_inner);
                addresses.retain(|a| a.id != address.id);
                addresses.push(address.clone());
                addresses.sort_by_key(|a| a.order);
                return Ok(split);
            }
            RemoteEvent::AddressDeleted(id) => {
                self.addresses
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|a| a.id != *id);
                return Ok(split);
            }
            RemoteEvent::LabelCreated(label) | RemoteEvent::LabelUpdated(label) => {
                let Some(mailbox) = mailbox::to_mailbox(label).filter(|_| mailbox::is_wanted(label))
                else {
                    return Ok(false);
                };
                let existed = {
                    let mut labels = self.labels.write().unwrap_or_else(PoisonError::into_inner);
                    let existed = labels.iter().any(|l| l.id == label.id);
                    labels.retain(|l| l.id != label.id);
                    labels.push(label.clone());
                    existed
                };
                let kind = if existed {
                    UpdateKind::MailboxUpdated {
                        id: mailbox.id,
                        name: mailbox.name,
                    }
                } else {
                    UpdateKind::MailboxCreated(mailbox)
                };
                propagator.broadcast(&kind, batch)?;
            }
            RemoteEvent::LabelDeleted(id) => {
                let known = {
                    let mut labels = self.labels.write().unwrap_or_else(PoisonError::into_inner);
                    let before = labels.len();
                    labels.retain(|l| l.id != *id);
                    labels.len() != before
                };
                if known {
                    propagator.broadcast(&UpdateKind::MailboxDeleted { id: id.clone() }, batch)?;
                }
            }
            RemoteEvent::MessageCreated(meta) => {
                let message = {
                    let labels = self.labels.read().unwrap_or_else(PoisonError::into_inner);
                    mailbox::to_message(meta, &|id| labels.iter().any(|l| l.id == id))
                };
                propagator.send(
                    &meta.address_id,
                    UpdateKind::MessagesCreated(vec![message]),
                    batch,
                )?;
            }
            RemoteEvent::MessageUpdated(meta) => {
                let message = {
                    let labels = self.labels.read().unwrap_or_else(PoisonError::into_inner);
                    mailbox::to_message(meta, &|id| labels.iter().any(|l| l.id == id))
                };
                propagator.send(
                    &meta.address_id,
                    UpdateKind::MessageUpdated {
                        id: message.id,
                        mailbox_ids: message.mailbox_ids,
                        seen: message.seen,
                        flagged: message.flagged,
                    },
                    batch,
                )?;
            }
            RemoteEvent::MessageDeleted(id) => {
                propagator.broadcast(&UpdateKind::MessageDeleted { id: id.clone() }, batch)?;
            }
        }

        Ok(false)
    }

    // ── Deauthentication ───────────────────────────────────────

    fn watch_deauth(self: &Arc<Self>) {
        let mut signal = self.client.deauth_signal();
        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            loop {
                if *signal.borrow_and_update() {
                    this.deauthenticate().await;
                    return;
                }
                tokio::select! {
                    biased;
                    () = this.root.cancelled() => return,
                    changed = signal.changed() => {
                        if changed.is_err() {
                            if *signal.borrow() {
                                this.deauthenticate().await;
                            }
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Move to `Deauthenticated` once, whatever the number of
    /// revocation signals.
    async fn deauthenticate(&self) {
        let changed = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = SessionState::Deauthenticated;
                true
            }
        });
        if !changed {
            return;
        }

        warn!("Session {} was revoked by the server", self.id);
        self.work_token().cancel();
        self.propagator().close();
        if let Err(e) = self.vault.clear_auth() {
            error!("Failed to clear credentials of {}: {}", self.id, e);
        }
        self.bus
            .publish(
                Event::UserDeauth {
                    user_id: self.id.clone(),
                },
                &self.root,
            )
            .await;
    }

    // ── Helpers ────────────────────────────────────────────────

    fn ensure_live(&self) -> Result<()> {
        if self.state().is_terminal() {
            Err(Error::Terminated)
        } else {
            Ok(())
        }
    }

    fn committed_mode(&self) -> AddressMode {
        *self.mode.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set a non-terminal state. Terminal states are never overridden.
    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                false
            } else {
                debug!("Session {}: {} -> {}", self.id, state, next);
                *state = next;
                true
            }
        });
    }

    /// Move from `from` to `to` atomically. Returns whether the session
    /// was in `from`.
    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                debug!("Session {}: {} -> {}", self.id, from, to);
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn work_token(&self) -> CancellationToken {
        self.work
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cancel the current work token and install a fresh one.
    fn next_work_token(&self) -> CancellationToken {
        let token = self.root.child_token();
        let previous = std::mem::replace(
            &mut *self.work.lock().unwrap_or_else(PoisonError::into_inner),
            token.clone(),
        );
        previous.cancel();
        token
    }

    fn propagator(&self) -> Arc<UpdatePropagator> {
        Arc::clone(&self.propagator.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Tear down the current connectors and create a new generation for
    /// `mode`.
    fn reset_connectors(&self, mode: AddressMode) {
        let addresses = self
            .addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let generation = {
            let mut current = self.propagator.write().unwrap_or_else(PoisonError::into_inner);
            current.close();
            let generation = current.generation() + 1;
            *current = Arc::new(UpdatePropagator::new(mode, &addresses, generation, &self.root));
            generation
        };
        debug!("Session {} now on connector generation {}", self.id, generation);
        self.generation.send_replace(generation);
    }

    fn sync_context<'a>(
        &'a self,
        propagator: &'a UpdatePropagator,
        work: &'a CancellationToken,
    ) -> SyncContext<'a> {
        SyncContext {
            user_id: &self.id,
            client: self.client.as_ref(),
            vault: &self.vault,
            propagator,
            bus: &self.bus,
            config: &self.config.sync,
            labels: &self.labels,
            work,
        }
    }
}
