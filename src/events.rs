//! Sync lifecycle events for UI and diagnostics subscribers.

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::warn;

use crate::queue::SyncGroup;
use crate::sync::SyncReport;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    SyncStart {
        store_id: String,
        total: usize,
    },
    Progress {
        store_id: String,
        group: SyncGroup,
        current: usize,
        total: usize,
    },
    SyncComplete {
        store_id: String,
        report: SyncReport,
    },
    SyncError {
        store_id: String,
        message: String,
    },
    SyncPaused,
    SyncResumed,
    NetworkStatus {
        online: bool,
    },
}

/// Fan-out of `SyncEvent`s. Cloning shares the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Run `callback` for every event until the returned `Subscription` is
    /// dropped or unsubscribed. Must be called from within a Tokio runtime.
    pub fn subscribe_with<F>(&self, callback: F) -> Subscription
    where
        F: Fn(SyncEvent) + Send + 'static,
    {
        let mut rx = self.sender.subscribe();
        let token = CancellationToken::new();
        let cancelled = token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(event) => callback(event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Event subscriber lagged, events dropped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        Subscription {
            token: token.clone(),
            _guard: token.drop_guard(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Handle of a callback subscription; dropping it unsubscribes.
pub struct Subscription {
    token: CancellationToken,
    _guard: DropGuard,
}

impl Subscription {
    pub fn unsubscribe(self) {}

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}
