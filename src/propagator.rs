//! Fan-out of updates to per-namespace connector queues
//!
//! One queue exists per namespace of the current address mode: a single
//! queue keyed by the primary address in combined mode, one per address
//! in split mode. Queues preserve send order. A [`Batch`] collects the
//! acknowledgements of everything a source produced, and the source may
//! only advance its cursor once the whole batch is acknowledged.

use crate::connector::{Connector, ConnectorContext};
use crate::error::{Error, Result};
use crate::mode::AddressMode;
use crate::remote::Address;
use crate::update::{Outcome, Pending, Update, UpdateKind};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Update>>>;

#[derive(Debug)]
struct Namespace {
    address_id: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Update>>>,
    rx: SharedReceiver,
}

/// Connector queues of one connector generation.
#[derive(Debug)]
pub(crate) struct UpdatePropagator {
    mode: AddressMode,
    generation: u64,
    namespaces: Vec<Namespace>,
    token: CancellationToken,
}

impl UpdatePropagator {
    /// `addresses` must be in display order; the first one keys the
    /// combined namespace.
    pub(crate) fn new(
        mode: AddressMode,
        addresses: &[Address],
        generation: u64,
        parent: &CancellationToken,
    ) -> Self {
        let keys: Vec<&Address> = match mode {
            AddressMode::Combined => addresses.iter().take(1).collect(),
            AddressMode::Split => addresses.iter().collect(),
        };

        let namespaces = keys
            .into_iter()
            .map(|address| {
                let (tx, rx) = mpsc::unbounded_channel();
                Namespace {
                    address_id: address.id.clone(),
                    tx: Mutex::new(Some(tx)),
                    rx: Arc::new(tokio::sync::Mutex::new(rx)),
                }
            })
            .collect::<Vec<_>>();

        debug!(
            "Created {} connector queue(s) for {} mode, generation {}",
            namespaces.len(),
            mode,
            generation
        );

        Self {
            mode,
            generation,
            namespaces,
            token: parent.child_token(),
        }
    }

    pub(crate) const fn mode(&self) -> AddressMode {
        self.mode
    }

    pub(crate) const fn generation(&self) -> u64 {
        self.generation
    }

    /// Connector handles for every namespace. Handles of the same
    /// generation share their queue.
    pub(crate) fn connectors(&self, ctx: &ConnectorContext) -> Vec<Connector> {
        self.namespaces
            .iter()
            .map(|ns| {
                Connector::new(
                    ns.address_id.clone(),
                    self.mode,
                    Arc::clone(&ns.rx),
                    self.token.clone(),
                    ctx.clone(),
                )
            })
            .collect()
    }

    /// The namespace that holds messages of `address_id`.
    fn route(&self, address_id: &str) -> Option<&Namespace> {
        match self.mode {
            AddressMode::Combined => self.namespaces.first(),
            AddressMode::Split => self.namespaces.iter().find(|ns| ns.address_id == address_id),
        }
    }

    fn enqueue(&self, ns: &Namespace, kind: UpdateKind, batch: &mut Batch) -> Result<()> {
        let guard = ns
            .tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(Error::Abandoned)?;

        let (update, pending) = Update::new(kind);
        tx.send(update).map_err(|_| Error::Abandoned)?;
        batch.pending.push(pending);
        Ok(())
    }

    /// Queue an update for the namespace owning `address_id`. Updates
    /// for addresses without a namespace are skipped.
    pub(crate) fn send(&self, address_id: &str, kind: UpdateKind, batch: &mut Batch) -> Result<()> {
        match self.route(address_id) {
            Some(ns) => self.enqueue(ns, kind, batch),
            None => {
                warn!("No connector for address {}, dropping update", address_id);
                Ok(())
            }
        }
    }

    /// Queue an update for every namespace.
    pub(crate) fn broadcast(&self, kind: &UpdateKind, batch: &mut Batch) -> Result<()> {
        for ns in &self.namespaces {
            self.enqueue(ns, kind.clone(), batch)?;
        }
        Ok(())
    }

    pub(crate) fn batch(&self) -> Batch {
        Batch {
            pending: Vec::new(),
            token: self.token.clone(),
        }
    }

    /// Tear down this generation: queues stop accepting updates, readers
    /// see the end of their stream and outstanding batches are
    /// abandoned.
    pub(crate) fn close(&self) {
        self.token.cancel();
        for ns in &self.namespaces {
            ns.tx
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take();
        }
    }
}

/// Acknowledgements owed for a group of updates.
#[derive(Debug)]
#[must_use = "a batch must be waited on before advancing the source"]
pub(crate) struct Batch {
    pending: Vec<Pending>,
    token: CancellationToken,
}

impl Batch {
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Wait until every update has been acknowledged.
    ///
    /// Fails with [`Error::Abandoned`] if a connector dropped an update
    /// or the generation was torn down, and with [`Error::Terminated`]
    /// if `work` is cancelled.
    pub(crate) async fn wait(self, work: &CancellationToken) -> Result<()> {
        for pending in self.pending {
            let outcome = tokio::select! {
                biased;
                () = work.cancelled() => return Err(Error::Terminated),
                () = self.token.cancelled() => return Err(Error::Abandoned),
                outcome = pending.wait() => outcome,
            };

            match outcome {
                Some(Outcome::Applied) => {}
                Some(Outcome::Failed(reason)) => {
                    warn!("Connector failed to apply update: {}", reason);
                }
                None => return Err(Error::Abandoned),
            }
        }
        Ok(())
    }
}
