//! Listener supervision.
//!
//! The [`Supervisor`] owns the task handle of every enabled listener. The
//! watchdog loop calls [`Supervisor::check`] on a fixed interval; a listener
//! whose task has ended is respawned with fresh state until its restart
//! budget is used up, after which a single error is logged and the listener
//! stays down.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ListenerKind;
use crate::session::Session;

/// Spawns listener tasks.
pub trait ListenerFactory: Send + Sync {
    fn spawn(&self, kind: ListenerKind, cancel: CancellationToken) -> JoinHandle<()>;
}

struct Slot {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    restarts: u32,
    gave_up: bool,
}

pub struct Supervisor {
    factory: Arc<dyn ListenerFactory>,
    slots: Mutex<BTreeMap<ListenerKind, Slot>>,
    root: CancellationToken,
    max_restarts: u32,
}

impl Supervisor {
    pub fn new(factory: Arc<dyn ListenerFactory>, root: CancellationToken, max_restarts: u32) -> Self {
        Self {
            factory,
            slots: Mutex::new(BTreeMap::new()),
            root,
            max_restarts,
        }
    }

    /// Starts a listener. A running listener of that kind is left alone; a
    /// dead one is replaced and its restart count cleared.
    pub async fn start(&self, kind: ListenerKind) {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get(&kind) {
            if !slot.handle.is_finished() {
                tracing::debug!("{} listener already running", kind);
                return;
            }
        }

        let cancel = self.root.child_token();
        let handle = self.factory.spawn(kind, cancel.clone());
        slots.insert(
            kind,
            Slot {
                handle,
                cancel,
                restarts: 0,
                gave_up: false,
            },
        );
        tracing::info!("Started {} listener", kind);
    }

    /// Stops a listener and removes it from supervision. Returns its task
    /// handle so the caller can wait for it.
    pub async fn stop(&self, kind: ListenerKind) -> Option<JoinHandle<()>> {
        let slot = self.slots.lock().await.remove(&kind)?;
        slot.cancel.cancel();
        tracing::info!("Stopped {} listener", kind);
        Some(slot.handle)
    }

    /// Cancels every listener and hands back their task handles.
    pub async fn stop_all(&self) -> Vec<JoinHandle<()>> {
        let mut slots = self.slots.lock().await;
        std::mem::take(&mut *slots)
            .into_values()
            .map(|slot| {
                slot.cancel.cancel();
                slot.handle
            })
            .collect()
    }

    pub async fn is_running(&self, kind: ListenerKind) -> bool {
        self.slots
            .lock()
            .await
            .get(&kind)
            .is_some_and(|slot| !slot.handle.is_finished())
    }

    /// Restarts used so far, or `None` if the listener is not enabled.
    pub async fn restarts(&self, kind: ListenerKind) -> Option<u32> {
        self.slots.lock().await.get(&kind).map(|slot| slot.restarts)
    }

    /// One supervision pass over every enabled listener.
    pub async fn check(&self) {
        let mut slots = self.slots.lock().await;
        for (kind, slot) in slots.iter_mut() {
            if slot.gave_up || !slot.handle.is_finished() || slot.cancel.is_cancelled() {
                continue;
            }

            if slot.restarts < self.max_restarts {
                slot.restarts += 1;
                tracing::warn!(
                    "{} listener died, restarting ({}/{})",
                    kind,
                    slot.restarts,
                    self.max_restarts
                );
                slot.handle = self.factory.spawn(*kind, slot.cancel.clone());
            } else {
                tracing::error!(
                    "{} listener died after {} restarts, giving up",
                    kind,
                    self.max_restarts
                );
                slot.gave_up = true;
            }
        }
    }
}

/// Runs supervision passes every `interval` until cancelled or logged out.
pub async fn run_watchdog(
    supervisor: Arc<Supervisor>,
    session: Arc<Session>,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::debug!("Watchdog started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if !session.is_logged_in() {
            tracing::debug!("Session ended, watchdog exiting");
            break;
        }
        supervisor.check().await;
    }
    tracing::debug!("Watchdog stopped");
}
