//! Network state tracking and automatic queue drains.
//!
//! `ConnectivityMonitor` is fed by the host (runtime online/offline events)
//! and optionally by a task polling the remote health endpoint.
//! `SyncTrigger` reacts to offline → online transitions: it waits out a short
//! debounce, then drains the queue if there is anything to send. While
//! online it also ticks periodically so backed-off items get retried.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RemoteError, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::remote::RemoteStore;
use crate::sync::SyncEngine;

// ---------------------------------------------------------------------------
// Connectivity monitor
// ---------------------------------------------------------------------------

pub struct ConnectivityMonitor {
    online: watch::Sender<bool>,
    events: EventBus,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool, events: EventBus) -> Self {
        let (online, _) = watch::channel(initially_online);
        Self { online, events }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Record the current network state. Returns `true` when it changed;
    /// only changes are broadcast.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            if online {
                info!("Network restored");
            } else {
                info!("Network offline; queued changes stay pending");
            }
            self.events.emit(SyncEvent::NetworkStatus { online });
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    /// Poll `remote.health_check()` every `every` until `token` is cancelled.
    ///
    /// Any answer from the server counts as online, including a refusal of
    /// credentials; only an unreachable remote marks the network offline.
    pub fn spawn_health_check(
        self: &Arc<Self>,
        remote: Arc<dyn RemoteStore>,
        every: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            debug!(interval_ms = every.as_millis() as u64, "Connectivity check started");
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let reachable = match remote.health_check().await {
                    Ok(()) => true,
                    Err(RemoteError::Unreachable(msg)) => {
                        debug!("Connectivity check failed: {msg}");
                        false
                    }
                    Err(e) => {
                        warn!("Connectivity check: {e}");
                        true
                    }
                };
                monitor.set_online(reachable);
            }
            debug!("Connectivity check stopped");
        })
    }
}

// ---------------------------------------------------------------------------
// Sync trigger
// ---------------------------------------------------------------------------

/// Handle to a running trigger task.
pub struct TriggerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl TriggerHandle {
    /// Stop the trigger and wait for it to exit. A drain already in
    /// progress finishes its current item first.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!("Sync trigger task ended abnormally: {e}");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub struct SyncTrigger;

impl SyncTrigger {
    pub fn spawn(engine: Arc<SyncEngine>, monitor: Arc<ConnectivityMonitor>, store_id: &str) -> TriggerHandle {
        let token = CancellationToken::new();
        let task = tokio::spawn(trigger_loop(engine, monitor, store_id.to_string(), token.clone()));
        TriggerHandle { token, task }
    }
}

async fn trigger_loop(
    engine: Arc<SyncEngine>,
    monitor: Arc<ConnectivityMonitor>,
    store_id: String,
    token: CancellationToken,
) {
    let debounce = engine.config().reconnect_debounce();
    let period = engine.config().retry_interval();
    let mut online_rx = monitor.subscribe();
    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Starting online counts as a reconnect.
    let mut was_online = false;
    let mut reconnecting = *online_rx.borrow_and_update();

    info!(store_id = %store_id, "Sync trigger started");
    loop {
        if reconnecting {
            reconnecting = false;
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(debounce) => {}
            }
            // Flapped back offline during the debounce: wait for the next change.
            was_online = *online_rx.borrow_and_update();
            if was_online {
                run_once(&engine, &monitor, &store_id).await;
            }
            continue;
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            changed = online_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let online = *online_rx.borrow_and_update();
                reconnecting = online && !was_online;
                was_online = online;
            }
            _ = tick.tick() => {
                if was_online {
                    run_once(&engine, &monitor, &store_id).await;
                }
            }
        }
    }
    info!(store_id = %store_id, "Sync trigger stopped");
}

async fn run_once(engine: &SyncEngine, monitor: &ConnectivityMonitor, store_id: &str) {
    match engine.maybe_sync(store_id).await {
        Ok(Some(report)) => debug!(
            store_id,
            success = report.success,
            failed = report.failed,
            "Triggered sync finished"
        ),
        Ok(None) => {}
        Err(SyncError::Offline(e)) => {
            info!("Deferring sync, remote unavailable: {e}");
            if matches!(e, RemoteError::Unreachable(_)) {
                monitor.set_online(false);
            }
        }
        Err(e) => warn!("Triggered sync failed: {e}"),
    }
}
