//! Background sync engine for the offline store.
//!
//! Drains the operation queue against the remote store: each item is
//! committed remotely (`replay`), reconciled with the optimistic cache
//! (`reconcile`) and the outcome is written back together with the queue
//! transition in one local transaction. Items are drained group by group so
//! records created offline get their remote ids before dependent items run.

use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::customers::{Customer, CustomerCache};
use crate::db::{get_setting, now_iso, set_setting, DbState};
use crate::error::{RemoteError, StoreResult, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::inventory::{InventoryCache, InventoryPosition};
use crate::metadata::{self, RunOutcome, SyncMetadata};
use crate::models::{CacheRecord, CachedEntity};
use crate::mutations::LocalResult;
use crate::notifications::{self, Level};
use crate::products::{Product, ProductCache};
use crate::queue::{self, QueueItem, Retry, SyncGroup};
use crate::reconcile::{apply_writes, reconcile, QueueTransition, Reconciliation};
use crate::remote::{record_id, RemoteStore, CUSTOMERS, INVENTORY, PRODUCTS, PRODUCT_IMEIS};
use crate::replay::commit_remote;

const SETTINGS_CATEGORY: &str = "sync";
const PAUSED_KEY: &str = "paused";

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyRunning,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupReport {
    pub group: SyncGroup,
    pub success: usize,
    pub failed: usize,
}

/// Result of one drain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub store_id: String,
    pub groups: Vec<GroupReport>,
    pub success: usize,
    pub failed: usize,
    /// The drain stopped early because sync was paused.
    pub paused: bool,
    /// Set when the drain did not run at all.
    pub skipped: Option<SkipReason>,
}

impl SyncReport {
    fn new(store_id: &str) -> Self {
        Self {
            store_id: store_id.to_string(),
            groups: Vec::new(),
            success: 0,
            failed: 0,
            paused: false,
            skipped: None,
        }
    }

    fn skipped(store_id: &str, reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::new(store_id)
        }
    }

    pub fn group(&self, group: SyncGroup) -> Option<&GroupReport> {
        self.groups.iter().find(|g| g.group == group)
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }

    fn record(&mut self, group: SyncGroup, synced: bool) {
        let index = match self.groups.iter().position(|g| g.group == group) {
            Some(index) => index,
            None => {
                self.groups.push(GroupReport {
                    group,
                    success: 0,
                    failed: 0,
                });
                self.groups.len() - 1
            }
        };
        let entry = &mut self.groups[index];
        if synced {
            entry.success += 1;
            self.success += 1;
        } else {
            entry.failed += 1;
            self.failed += 1;
        }
    }
}

/// Rows written by a pull, per entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PullReport {
    pub products: usize,
    pub inventory: usize,
    pub customers: usize,
    pub skipped: Option<SkipReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Draining,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    #[serde(flatten)]
    pub metadata: SyncMetadata,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Resets the draining flag when the drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| DrainGuard(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct ItemResult {
    synced: bool,
    /// The remote went away while this item was in flight.
    abort: Option<RemoteError>,
}

pub struct SyncEngine {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    events: EventBus,
    draining: AtomicBool,
    paused: AtomicBool,
    /// Bumped by every `pause()`, so a drain notices pauses issued after it
    /// started.
    pause_epoch: AtomicU64,
}

impl SyncEngine {
    /// Build an engine; the paused flag is restored from local settings.
    pub fn new(db: Arc<DbState>, remote: Arc<dyn RemoteStore>, config: SyncConfig) -> StoreResult<Self> {
        let paused = db
            .read(|conn| get_setting(conn, SETTINGS_CATEGORY, PAUSED_KEY))?
            .is_some_and(|v| v == "true");
        if paused {
            info!("Sync engine starting paused");
        }
        let events = EventBus::new(config.event_capacity);
        Ok(Self {
            db,
            remote,
            config,
            events,
            draining: AtomicBool::new(false),
            paused: AtomicBool::new(paused),
            pause_epoch: AtomicU64::new(0),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SyncState {
        if self.is_draining() {
            SyncState::Draining
        } else if self.is_paused() {
            SyncState::Paused
        } else {
            SyncState::Idle
        }
    }

    pub fn status(&self, store_id: &str) -> StoreResult<SyncStatus> {
        let metadata = self.db.read(|conn| metadata::sync_metadata(conn, store_id))?;
        Ok(SyncStatus {
            state: self.state(),
            metadata,
        })
    }

    /// Stop automatic syncing. A running drain halts before its next item.
    pub fn pause(&self) -> StoreResult<()> {
        self.db
            .read(|conn| set_setting(conn, SETTINGS_CATEGORY, PAUSED_KEY, "true"))?;
        self.pause_epoch.fetch_add(1, Ordering::SeqCst);
        self.paused.store(true, Ordering::SeqCst);
        info!("Sync paused");
        self.events.emit(SyncEvent::SyncPaused);
        Ok(())
    }

    pub fn resume(&self) -> StoreResult<()> {
        self.db
            .read(|conn| set_setting(conn, SETTINGS_CATEGORY, PAUSED_KEY, "false"))?;
        self.paused.store(false, Ordering::SeqCst);
        info!("Sync resumed");
        self.events.emit(SyncEvent::SyncResumed);
        Ok(())
    }

    fn pause_requested(&self, epoch: u64) -> bool {
        self.is_paused() && self.pause_epoch.load(Ordering::SeqCst) != epoch
    }

    /// Drain the queue of `store_id`. Refused (skipped report) while paused
    /// or while another drain is running.
    pub async fn sync_all(&self, store_id: &str) -> Result<SyncReport, SyncError> {
        if self.is_paused() {
            debug!(store_id, "Sync paused, drain skipped");
            return Ok(SyncReport::skipped(store_id, SkipReason::Paused));
        }
        self.drain(store_id).await
    }

    /// Manual drain, permitted while paused.
    pub async fn force_sync(&self, store_id: &str) -> Result<SyncReport, SyncError> {
        let report = self.drain(store_id).await?;
        info!(
            store_id,
            success = report.success,
            failed = report.failed,
            "Force sync complete"
        );
        Ok(report)
    }

    /// Drain when there is something to send, then pull reference data if
    /// it went stale. `None` when no drain ran.
    pub async fn maybe_sync(&self, store_id: &str) -> Result<Option<SyncReport>, SyncError> {
        if self.is_paused() || self.is_draining() {
            return Ok(None);
        }
        let pending = self.db.read(|conn| metadata::pending_count(conn, store_id))?;
        let report = if pending > 0 {
            Some(self.sync_all(store_id).await?)
        } else {
            None
        };
        if self.needs_refresh(store_id)? {
            self.pull(store_id).await?;
        }
        Ok(report)
    }

    async fn drain(&self, store_id: &str) -> Result<SyncReport, SyncError> {
        let Some(_guard) = DrainGuard::acquire(&self.draining) else {
            debug!(store_id, "Drain already running, skipped");
            return Ok(SyncReport::skipped(store_id, SkipReason::AlreadyRunning));
        };

        let run_id = self.db.read(|conn| metadata::begin_run(conn, store_id))?;
        let mut report = SyncReport::new(store_id);
        let result = self.run(store_id, &mut report).await;

        let (outcome, message) = match &result {
            Ok(()) if report.paused => (RunOutcome::Paused, None),
            Ok(()) => (RunOutcome::Completed, None),
            Err(err) => (RunOutcome::Error, Some(err.to_string())),
        };
        let finished = self.db.read(|conn| {
            metadata::finish_run(
                conn,
                run_id,
                outcome,
                report.success as i64,
                report.failed as i64,
                message.as_deref(),
            )
        });

        match result {
            Ok(()) => {
                finished?;
                info!(
                    store_id,
                    success = report.success,
                    failed = report.failed,
                    paused = report.paused,
                    "Sync run complete"
                );
                self.events.emit(SyncEvent::SyncComplete {
                    store_id: store_id.to_string(),
                    report: report.clone(),
                });
                Ok(report)
            }
            Err(err) => {
                if let Err(log_err) = finished {
                    error!(run_id, error = %log_err, "Failed to record sync run outcome");
                }
                warn!(store_id, error = %err, "Sync run aborted");
                self.events.emit(SyncEvent::SyncError {
                    store_id: store_id.to_string(),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn run(&self, store_id: &str, report: &mut SyncReport) -> Result<(), SyncError> {
        self.remote.health_check().await?;

        let now = now_iso();
        let items = self
            .db
            .read(|conn| queue::dequeue_batch(conn, store_id, self.config.batch_size, &now))?;
        let total = items.len();
        info!(store_id, total, "Sync run started");
        self.events.emit(SyncEvent::SyncStart {
            store_id: store_id.to_string(),
            total,
        });

        let epoch = self.pause_epoch.load(Ordering::SeqCst);
        let mut current = 0;
        'groups: for group in SyncGroup::ALL {
            // Priority decides what makes the batch; within a group items
            // replay in enqueue order.
            let mut group_items: Vec<&QueueItem> = items
                .iter()
                .filter(|item| item.operation.group() == group)
                .collect();
            group_items.sort_by_key(|item| item.queue_id);
            for item in group_items {
                if self.pause_requested(epoch) {
                    info!(store_id, processed = current, total, "Sync paused mid-run");
                    report.paused = true;
                    break 'groups;
                }

                let result = self.process(item).await?;
                current += 1;
                report.record(group, result.synced);
                self.events.emit(SyncEvent::Progress {
                    store_id: store_id.to_string(),
                    group,
                    current,
                    total,
                });

                if let Some(err) = result.abort {
                    return Err(SyncError::Offline(err));
                }
                if current < total {
                    tokio::time::sleep(self.config.item_delay()).await;
                }
            }
        }

        let synced_at = now_iso();
        let cleared = self.db.transaction(|tx| {
            let cleared = queue::clear_synced(tx, store_id)?;
            metadata::set_last_sync(tx, store_id, &synced_at)?;
            Ok(cleared)
        })?;
        debug!(store_id, cleared, "Cleared synced queue items");
        Ok(())
    }

    /// Commit one item remotely and record the outcome locally.
    async fn process(&self, item: &QueueItem) -> Result<ItemResult, SyncError> {
        let outcome = commit_remote(self.remote.as_ref(), &self.db, item).await?;
        if let Some(err) = outcome.error().filter(|err| err.is_systemic()) {
            // Nothing is recorded; the item stays as it was.
            return Err(err.clone().into());
        }

        let local = LocalResult::from(item);
        let Reconciliation { writes, transition } = reconcile(&local, &outcome);
        let retry_at = self.retry_at(item.sync_attempts + 1);

        self.db.transaction(|tx| {
            apply_writes(tx, &writes)?;
            match &transition {
                QueueTransition::Synced => queue::mark_synced(tx, item.queue_id)?,
                QueueTransition::Failed {
                    error,
                    retryable,
                    notify,
                } => {
                    let retry = if *retryable {
                        Retry::At(retry_at.clone())
                    } else {
                        Retry::Manual
                    };
                    queue::mark_failed(tx, item.queue_id, error, &retry)?;
                    if *notify {
                        let title = format!(
                            "Sync rejected: {} {}",
                            item.entity_type,
                            item.operation.kind().as_str()
                        );
                        notifications::record(tx, &item.store_id, Level::Error, &title, error, Some(item.queue_id))?;
                    }
                }
            }
            Ok(())
        })?;

        let synced = transition == QueueTransition::Synced;
        if !synced {
            warn!(
                queue_id = item.queue_id,
                store_id = %item.store_id,
                operation = item.operation.kind().as_str(),
                attempts = item.sync_attempts + 1,
                "Sync item failed"
            );
        }
        let abort = outcome
            .error()
            .filter(|err| matches!(err, RemoteError::Unreachable(_)))
            .cloned();
        Ok(ItemResult { synced, abort })
    }

    /// Backoff timestamp for an item that has now failed `attempts` times.
    fn retry_at(&self, attempts: i64) -> String {
        let delay = ChronoDuration::from_std(self.config.retry_delay(attempts))
            .unwrap_or_else(|_| ChronoDuration::milliseconds(self.config.retry_max_delay_ms as i64));
        (Utc::now() + delay).to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    // -----------------------------------------------------------------------
    // Pull
    // -----------------------------------------------------------------------

    pub fn needs_refresh(&self, store_id: &str) -> StoreResult<bool> {
        self.db.read(|conn| {
            metadata::needs_refresh(conn, store_id, self.config.stale_after(), Utc::now())
        })
    }

    /// Refresh products, inventory and customers from the remote. Rows with
    /// unsynced local changes are left alone.
    pub async fn pull(&self, store_id: &str) -> Result<PullReport, SyncError> {
        let Some(_guard) = DrainGuard::acquire(&self.draining) else {
            return Ok(PullReport {
                skipped: Some(SkipReason::AlreadyRunning),
                ..PullReport::default()
            });
        };

        let mut imeis: HashMap<String, Vec<String>> = HashMap::new();
        for row in self.remote.select_all(PRODUCT_IMEIS, store_id).await? {
            let product_id = row.get("product_id").and_then(id_string);
            let imei = row.get("imei").and_then(Value::as_str);
            if let (Some(product_id), Some(imei)) = (product_id, imei) {
                imeis.entry(product_id).or_default().push(imei.to_string());
            }
        }

        let mut products: Vec<CachedEntity<Product>> = remote_entities(
            self.remote.select_all(PRODUCTS, store_id).await?,
            store_id,
        );
        for product in &mut products {
            if let Some(list) = product.id.as_ref().and_then(|id| imeis.remove(id)) {
                product.data.imeis = list;
            }
        }
        let inventory: Vec<CachedEntity<InventoryPosition>> = remote_entities(
            self.remote.select_all(INVENTORY, store_id).await?,
            store_id,
        );
        let customers: Vec<CachedEntity<Customer>> = remote_entities(
            self.remote.select_all(CUSTOMERS, store_id).await?,
            store_id,
        );

        let report = PullReport {
            products: ProductCache::new(Arc::clone(&self.db)).upsert_many(&products, store_id)?,
            inventory: InventoryCache::new(Arc::clone(&self.db)).upsert_many(&inventory, store_id)?,
            customers: CustomerCache::new(Arc::clone(&self.db)).upsert_many(&customers, store_id)?,
            skipped: None,
        };
        self.db
            .read(|conn| metadata::set_last_pull(conn, store_id, &now_iso()))?;
        info!(
            store_id,
            products = report.products,
            inventory = report.inventory,
            customers = report.customers,
            "Pulled reference data"
        );
        Ok(report)
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Decode remote rows, skipping (and logging) rows that do not parse.
fn remote_entities<T: CacheRecord>(rows: Vec<Value>, store_id: &str) -> Vec<CachedEntity<T>> {
    rows.into_iter()
        .filter_map(|mut row| {
            let id = record_id(&row)?;
            if let Some(product_id) = row.get("product_id").and_then(id_string) {
                row["product_id"] = Value::String(product_id);
            }
            match serde_json::from_value::<T>(row) {
                Ok(data) => Some(CachedEntity::synced(id, store_id, data)),
                Err(e) => {
                    warn!(entity = %T::ENTITY, id = %id, "Skipping malformed remote row: {e}");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::inventory::InventoryCache;
    use crate::models::OfflineStatus;
    use crate::mutations::{apply_local, Mutation};
    use crate::queue::{
        CustomerPayload, DeletePayload, ImeiPayload, Operation, OperationQueue, ProductPayload, QueueStatus,
    };
    use crate::remote::{RecordKey, SALES, STOCK_TRANSFERS};
    use crate::sales::{Sale, SaleCache, SaleLine};
    use crate::test_support::{
        engine, engine_with, remote_qty, seed_stocked_product, test_config, MemoryRemote,
    };
    use crate::transfers::{TransferCache, TransferStatus};
    use serde_json::json;
    use std::time::Duration;

    fn validation(message: &str) -> RemoteError {
        RemoteError::Rejected {
            status: 422,
            message: message.into(),
        }
    }

    fn unavailable() -> RemoteError {
        RemoteError::Server {
            status: 503,
            message: "upstream timeout".into(),
        }
    }

    fn sale(lines: &[(&str, i64)], customer_id: Option<&str>) -> Sale {
        let lines: Vec<SaleLine> = lines
            .iter()
            .map(|(product_id, quantity)| SaleLine {
                product_id: product_id.to_string(),
                quantity: *quantity,
                unit_price: 5.0,
            })
            .collect();
        Sale {
            customer_id: customer_id.map(str::to_string),
            total: lines.iter().map(|l| l.unit_price * l.quantity as f64).sum(),
            lines,
            payment_method: "cash".into(),
            sold_at: "2026-03-01T10:00:00.000Z".into(),
        }
    }

    fn delete_product(id: &str) -> Mutation {
        Mutation::new(
            "A",
            Operation::DeleteProduct(DeletePayload {
                id: id.to_string(),
                created_ref: None,
            }),
        )
    }

    #[tokio::test]
    async fn test_restock_syncs_and_clears_queue() {
        let remote = MemoryRemote::new();
        let pid = seed_stocked_product(&remote, "A", "CBL", 10);
        let (db, engine) = engine(remote.clone());
        engine.pull("A").await.unwrap();

        let inventory = InventoryCache::new(Arc::clone(&db));
        apply_local(&db, &Mutation::restock("A", &pid, 5)).unwrap();
        let local = inventory.for_product("A", &pid).unwrap().unwrap();
        assert_eq!(local.data.available_qty, 15);
        assert_eq!(local.offline_status, OfflineStatus::Pending);

        let report = engine.sync_all("A").await.unwrap();
        assert_eq!(report.success, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.group(SyncGroup::Inventory).unwrap().success, 1);

        let local = inventory.for_product("A", &pid).unwrap().unwrap();
        assert_eq!(local.data.available_qty, 15);
        assert_eq!(local.offline_status, OfflineStatus::Synced);
        assert_eq!(remote_qty(&remote, "A", &pid), Some(15));

        let meta = engine.status("A").unwrap().metadata;
        assert_eq!(meta.pending_count, 0);
        assert!(meta.last_sync_time.is_some());
        assert!(OperationQueue::new(Arc::clone(&db)).list("A", None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replaying_an_item_applies_it_once() {
        let remote = MemoryRemote::new();
        let pid = seed_stocked_product(&remote, "A", "CBL", 10);
        let (db, engine) = engine(remote.clone());
        engine.pull("A").await.unwrap();
        apply_local(&db, &Mutation::restock("A", &pid, 4)).unwrap();

        let item = db
            .read(|c| queue::dequeue_batch(c, "A", 10, &now_iso()))
            .unwrap()
            .remove(0);
        commit_remote(&*remote, &db, &item).await.unwrap();
        commit_remote(&*remote, &db, &item).await.unwrap();
        assert_eq!(remote_qty(&remote, "A", &pid), Some(14));

        engine.sync_all("A").await.unwrap();
        assert_eq!(remote_qty(&remote, "A", &pid), Some(14));
    }

    #[tokio::test]
    async fn test_rejected_item_does_not_block_the_rest() {
        let remote = MemoryRemote::new();
        let pid = seed_stocked_product(&remote, "A", "CBL", 10);
        let (db, engine) = engine(remote.clone());
        engine.pull("A").await.unwrap();

        let mut refs = Vec::new();
        for _ in 0..5 {
            refs.push(apply_local(&db, &Mutation::restock("A", &pid, 1)).unwrap().client_ref);
        }
        remote.fail_ref(&refs[2], validation("quantity exceeds shelf capacity"));

        let report = engine.sync_all("A").await.unwrap();
        assert_eq!(report.success, 4);
        assert_eq!(report.failed, 1);
        assert_eq!(remote_qty(&remote, "A", &pid), Some(14));

        let queue = OperationQueue::new(Arc::clone(&db));
        let failed = queue.list("A", Some(QueueStatus::Failed)).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].client_ref, refs[2]);
        assert!(!failed[0].retryable);
        assert!(failed[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("shelf capacity"));

        let notes = db.read(|c| notifications::unread(c, "A")).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].queue_id, Some(failed[0].queue_id));

        // Not retried automatically.
        let again = engine.sync_all("A").await.unwrap();
        assert_eq!(again.success + again.failed, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_backs_off_with_retry_message() {
        let remote = MemoryRemote::new();
        let pid = seed_stocked_product(&remote, "A", "CBL", 10);
        let (db, engine) = engine(remote.clone());
        engine.pull("A").await.unwrap();
        apply_local(&db, &Mutation::restock("A", &pid, 2)).unwrap();
        remote.fail_next_write(
            INVENTORY,
            RemoteError::Server {
                status: 503,
                message: "upstream timeout".into(),
            },
        );

        let report = engine.sync_all("A").await.unwrap();
        assert_eq!(report.failed, 1);

        let queue = OperationQueue::new(Arc::clone(&db));
        let item = queue.list("A", None).unwrap().remove(0);
        assert_eq!(item.status, QueueStatus::Failed);
        assert!(item.retryable);
        assert_eq!(item.sync_attempts, 1);
        assert!(item.next_retry_at.is_some());
        assert!(item.error_message.unwrap().ends_with("(will retry when online)"));
        assert!(db.read(|c| notifications::unread(c, "A")).unwrap().is_empty());

        // Still backing off.
        assert_eq!(engine.sync_all("A").await.unwrap().success, 0);

        queue.retry_item(item.queue_id).unwrap();
        assert_eq!(engine.sync_all("A").await.unwrap().success, 1);
        assert_eq!(remote_qty(&remote, "A", &pid), Some(12));
    }

    #[tokio::test]
    async fn test_transfer_moves_stock_between_stores() {
        let remote = MemoryRemote::new();
        let pid = seed_stocked_product(&remote, "A", "PHN", 10);
        let (db, engine) = engine(remote.clone());
        engine.pull("A").await.unwrap();

        apply_local(&db, &Mutation::transfer(&pid, "A", "B", 3)).unwrap();
        let inventory = InventoryCache::new(Arc::clone(&db));
        assert_eq!(inventory.available_qty("A", &pid).unwrap(), 7);

        let report = engine.sync_all("A").await.unwrap();
        assert_eq!(report.group(SyncGroup::Transfers).unwrap().success, 1);
        assert_eq!(remote_qty(&remote, "A", &pid), Some(7));

        let dest_product = remote
            .find(PRODUCTS, &RecordKey::new().eq("store_id", "B").eq("sku", "PHN"))
            .unwrap();
        let dest_id = record_id(&dest_product).unwrap();
        assert_ne!(dest_id, pid);
        assert_eq!(remote_qty(&remote, "B", &dest_id), Some(3));
        assert_eq!(inventory.available_qty("B", &dest_id).unwrap(), 3);

        let transfers = TransferCache::new(Arc::clone(&db)).outgoing("A").unwrap();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].data.status, TransferStatus::Approved);
        assert!(transfers[0].is_synced());
        assert_eq!(remote.rows(STOCK_TRANSFERS).len(), 1);
    }

    #[tokio::test]
    async fn test_transfer_rejected_at_source_restores_local_stock() {
        let remote = MemoryRemote::new();
        let pid = seed_stocked_product(&remote, "A", "PHN", 10);
        let (db, engine) = engine(remote.clone());
        engine.pull("A").await.unwrap();

        // Someone sold stock elsewhere; the remote now has less than we think.
        let inv = remote
            .find(INVENTORY, &RecordKey::new().eq("store_id", "A").eq("product_id", &pid))
            .unwrap();
        remote
            .update(
                INVENTORY,
                &RecordKey::id(&record_id(&inv).unwrap()),
                serde_json::json!({ "available_qty": 2 }),
                None,
            )
            .await
            .unwrap();

        apply_local(&db, &Mutation::transfer(&pid, "A", "B", 5)).unwrap();
        let inventory = InventoryCache::new(Arc::clone(&db));
        assert_eq!(inventory.available_qty("A", &pid).unwrap(), 5);

        let report = engine.sync_all("A").await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(inventory.available_qty("A", &pid).unwrap(), 10);
        assert_eq!(remote_qty(&remote, "A", &pid), Some(2));

        let transfer = TransferCache::new(Arc::clone(&db)).outgoing("A").unwrap().remove(0);
        assert_eq!(transfer.data.status, TransferStatus::Failed);
        assert!(!transfer.data.local_deduction_applied);
        assert!(transfer.data.error.unwrap().contains("insufficient stock"));

        let item = OperationQueue::new(Arc::clone(&db)).list("A", None).unwrap().remove(0);
        assert!(!item.retryable);
        assert_eq!(db.read(|c| notifications::unread(c, "A")).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_destination_failure_retries_without_second_deduction() {
        let remote = MemoryRemote::new();
        let pid = seed_stocked_product(&remote, "A", "PHN", 10);
        let (db, engine) = engine(remote.clone());
        engine.pull("A").await.unwrap();

        let local = apply_local(&db, &Mutation::transfer(&pid, "A", "B", 3)).unwrap();
        remote.fail_ref(
            &format!("{}:dest_product", local.client_ref),
            RemoteError::Server {
                status: 500,
                message: "insert failed".into(),
            },
        );

        let first = engine.sync_all("A").await.unwrap();
        assert_eq!(first.failed, 1);
        assert_eq!(remote_qty(&remote, "A", &pid), Some(7));
        let transfer = TransferCache::new(Arc::clone(&db)).outgoing("A").unwrap().remove(0);
        assert!(transfer.data.source_deducted);
        assert_eq!(transfer.data.status, TransferStatus::Pending);

        remote.clear_failures();
        let queue = OperationQueue::new(Arc::clone(&db));
        queue.retry_item(local.queue_id).unwrap();
        let second = engine.sync_all("A").await.unwrap();
        assert_eq!(second.success, 1);

        assert_eq!(remote_qty(&remote, "A", &pid), Some(7));
        assert_eq!(InventoryCache::new(Arc::clone(&db)).available_qty("A", &pid).unwrap(), 7);
        let transfer = TransferCache::new(Arc::clone(&db)).outgoing("A").unwrap().remove(0);
        assert_eq!(transfer.data.status, TransferStatus::Approved);
    }

    #[tokio::test]
    async fn test_offline_product_and_dependent_sale_sync_in_one_run() {
        let remote = MemoryRemote::new();
        let (db, engine) = engine(remote.clone());

        let created = apply_local(&db, &Mutation::create_product("A", Product::named("Charger", "CHG", 12.0))).unwrap();
        let offline_id = created.entity_id().to_string();
        apply_local(&db, &Mutation::restock("A", &offline_id, 4)).unwrap();

        let report = engine.sync_all("A").await.unwrap();
        assert_eq!(report.success, 2);
        assert_eq!(report.failed, 0);

        let product = remote.find(PRODUCTS, &RecordKey::new().eq("sku", "CHG")).unwrap();
        let remote_id = record_id(&product).unwrap();
        assert_eq!(remote_qty(&remote, "A", &remote_id), Some(4));

        let products = ProductCache::new(Arc::clone(&db));
        let cached = products.get_by_id("A", &remote_id).unwrap().unwrap();
        assert!(cached.is_synced());
        // Still reachable under the id the UI was handed.
        let by_offline = products.get_by_id("A", &offline_id).unwrap().unwrap();
        assert_eq!(by_offline.id.as_deref(), Some(remote_id.as_str()));
        assert_eq!(InventoryCache::new(Arc::clone(&db)).available_qty("A", &remote_id).unwrap(), 4);
    }

    #[tokio::test]
    async fn test_unreachable_remote_aborts_and_keeps_items_pending() {
        let remote = MemoryRemote::new();
        let pid = seed_stocked_product(&remote, "A", "CBL", 10);
        let (db, engine) = engine(remote.clone());
        engine.pull("A").await.unwrap();
        apply_local(&db, &Mutation::restock("A", &pid, 1)).unwrap();
        apply_local(&db, &Mutation::restock("A", &pid, 1)).unwrap();

        remote.set_offline(true);
        let mut events = engine.events().subscribe();
        let err = engine.sync_all("A").await.unwrap_err();
        assert!(matches!(err, SyncError::Offline(_)));
        assert!(matches!(events.recv().await.unwrap(), SyncEvent::SyncError { .. }));

        let queue = OperationQueue::new(Arc::clone(&db));
        let items = queue.list("A", None).unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.status == QueueStatus::Pending && i.sync_attempts == 0));

        let runs = db.read(|c| metadata::recent_runs(c, "A", 1)).unwrap();
        assert_eq!(runs[0].outcome, RunOutcome::Error);
    }

    #[tokio::test]
    async fn test_refused_credentials_abort_the_run() {
        let remote = MemoryRemote::new();
        let (db, engine) = engine(remote.clone());
        apply_local(&db, &Mutation::create_product("A", Product::named("Case", "CSE", 9.0))).unwrap();

        remote.set_unauthorized(true);
        let err = engine.sync_all("A").await.unwrap_err();
        assert!(matches!(err, SyncError::Unauthorized(_)));
        assert_eq!(db.read(|c| queue::pending_count(c, "A")).unwrap(), 1);
        assert!(!engine.is_draining());
    }

    #[tokio::test]
    async fn test_paused_engine_refuses_sync_but_allows_force_sync() {
        let remote = MemoryRemote::new();
        let pid = seed_stocked_product(&remote, "A", "CBL", 10);
        let (db, engine) = engine(remote.clone());
        engine.pull("A").await.unwrap();
        apply_local(&db, &Mutation::restock("A", &pid, 3)).unwrap();

        engine.pause().unwrap();
        assert_eq!(engine.state(), SyncState::Paused);
        let report = engine.sync_all("A").await.unwrap();
        assert_eq!(report.skipped, Some(SkipReason::Paused));
        assert_eq!(remote_qty(&remote, "A", &pid), Some(10));

        let forced = engine.force_sync("A").await.unwrap();
        assert_eq!(forced.success, 1);
        assert_eq!(remote_qty(&remote, "A", &pid), Some(13));
        assert!(engine.is_paused());
    }

    #[tokio::test]
    async fn test_pause_is_persisted() {
        let remote = MemoryRemote::new();
        let (db, engine) = engine(remote.clone());
        engine.pause().unwrap();

        let reopened = engine_with(Arc::clone(&db), remote.clone(), test_config());
        assert!(reopened.is_paused());
        reopened.resume().unwrap();
        let again = engine_with(db, remote, test_config());
        assert!(!again.is_paused());
    }

    #[tokio::test]
    async fn test_pause_during_drain_stops_before_next_item() {
        let remote = MemoryRemote::new();
        let pid = seed_stocked_product(&remote, "A", "CBL", 10);
        let db = Arc::new(DbState::in_memory().unwrap());
        let config = SyncConfig {
            item_delay_ms: 200,
            ..test_config()
        };
        let engine = engine_with(Arc::clone(&db), remote.clone(), config);
        engine.pull("A").await.unwrap();
        for _ in 0..3 {
            apply_local(&db, &Mutation::restock("A", &pid, 1)).unwrap();
        }

        let pauser = Arc::clone(&engine);
        let _sub = engine.events().subscribe_with(move |event| {
            if let SyncEvent::Progress { current: 1, .. } = event {
                pauser.pause().unwrap();
            }
        });

        let report = engine.sync_all("A").await.unwrap();
        assert!(report.paused);
        assert_eq!(report.success, 1);
        assert_eq!(db.read(|c| queue::pending_count(c, "A")).unwrap(), 2);
        assert_eq!(remote_qty(&remote, "A", &pid), Some(11));

        let runs = db.read(|c| metadata::recent_runs(c, "A", 1)).unwrap();
        assert_eq!(runs[0].outcome, RunOutcome::Paused);
    }

    #[tokio::test]
    async fn test_events_report_progress() {
        let remote = MemoryRemote::new();
        let pid = seed_stocked_product(&remote, "A", "CBL", 10);
        let (db, engine) = engine(remote.clone());
        engine.pull("A").await.unwrap();
        apply_local(&db, &Mutation::restock("A", &pid, 1)).unwrap();
        apply_local(&db, &Mutation::adjust("A", &pid, -1, "damaged")).unwrap();

        let mut events = engine.events().subscribe();
        engine.sync_all("A").await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = tokio::time::timeout(Duration::from_millis(100), events.recv()).await {
            seen.push(event.unwrap());
        }
        assert!(matches!(seen[0], SyncEvent::SyncStart { total: 2, .. }));
        assert!(matches!(
            seen[1],
            SyncEvent::Progress {
                group: SyncGroup::Inventory,
                current: 1,
                total: 2,
                ..
            }
        ));
        assert!(matches!(
            seen[2],
            SyncEvent::Progress {
                group: SyncGroup::Adjustments,
                current: 2,
                ..
            }
        ));
        match &seen[3] {
            SyncEvent::SyncComplete { report, .. } => assert_eq!(report.success, 2),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pull_keeps_unsynced_local_rows() {
        let remote = MemoryRemote::new();
        let pid = seed_stocked_product(&remote, "A", "CBL", 10);
        remote.seed(
            PRODUCT_IMEIS,
            serde_json::json!({ "store_id": "A", "product_id": pid, "imei": "356938035643809" }),
        );
        let (db, engine) = engine(remote.clone());
        assert!(engine.needs_refresh("A").unwrap());

        let report = engine.pull("A").await.unwrap();
        assert_eq!(report.products, 1);
        assert_eq!(report.inventory, 1);
        assert!(!engine.needs_refresh("A").unwrap());
        let product = ProductCache::new(Arc::clone(&db)).get_by_id("A", &pid).unwrap().unwrap();
        assert_eq!(product.data.imeis, vec!["356938035643809".to_string()]);

        apply_local(&db, &Mutation::restock("A", &pid, 5)).unwrap();
        engine.pull("A").await.unwrap();
        let inventory = InventoryCache::new(Arc::clone(&db));
        let local = inventory.for_product("A", &pid).unwrap().unwrap();
        assert_eq!(local.data.available_qty, 15);
        assert_eq!(local.offline_status, OfflineStatus::Pending);
    }

    #[tokio::test]
    async fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let remote = MemoryRemote::new();
        let pid = seed_stocked_product(&remote, "A", "CBL", 10);
        {
            let db = Arc::new(crate::db::init(dir.path()).unwrap());
            let engine = engine_with(Arc::clone(&db), remote.clone(), test_config());
            engine.pull("A").await.unwrap();
            apply_local(&db, &Mutation::restock("A", &pid, 6)).unwrap();
        }

        let db = Arc::new(crate::db::init(dir.path()).unwrap());
        assert_eq!(db.read(|c| queue::pending_count(c, "A")).unwrap(), 1);
        let engine = engine_with(Arc::clone(&db), remote.clone(), test_config());
        assert_eq!(engine.sync_all("A").await.unwrap().success, 1);
        assert_eq!(remote_qty(&remote, "A", &pid), Some(16));
    }

    #[tokio::test]
    async fn test_rejected_restock_returns_to_remote_quantity() {
        let remote = MemoryRemote::new();
        let pid = seed_stocked_product(&remote, "A", "CBL", 10);
        let (db, engine) = engine(remote.clone());
        engine.pull("A").await.unwrap();

        let local = apply_local(&db, &Mutation::restock("A", &pid, 5)).unwrap();
        remote.fail_ref(&local.client_ref, validation("restock exceeds purchase order"));
        assert_eq!(engine.sync_all("A").await.unwrap().failed, 1);

        let inventory = InventoryCache::new(Arc::clone(&db));
        let position = inventory.for_product("A", &pid).unwrap().unwrap();
        assert_eq!(position.data.available_qty, 10);
        assert_eq!(position.offline_status, OfflineStatus::Synced);
        assert_eq!(db.read(|c| notifications::unread(c, "A")).unwrap().len(), 1);

        engine.pull("A").await.unwrap();
        assert_eq!(inventory.available_qty("A", &pid).unwrap(), 10);

        // Stock changed elsewhere; pulls keep tracking the remote.
        let row = remote
            .find(INVENTORY, &RecordKey::new().eq("store_id", "A").eq("product_id", &pid))
            .unwrap();
        remote
            .update(INVENTORY, &RecordKey::id(&record_id(&row).unwrap()), json!({ "available_qty": 12 }), None)
            .await
            .unwrap();
        OperationQueue::new(Arc::clone(&db)).discard_item(local.queue_id).unwrap();
        engine.pull("A").await.unwrap();
        assert_eq!(inventory.available_qty("A", &pid).unwrap(), 12);
    }

    #[tokio::test]
    async fn test_priority_does_not_reorder_a_group() {
        let remote = MemoryRemote::new();
        let (db, engine) = engine(remote.clone());

        let created = apply_local(&db, &Mutation::create_product("A", Product::named("Charger", "CHG", 12.0))).unwrap();
        let offline_id = created.entity_id().to_string();
        let rename = Mutation::new(
            "A",
            Operation::UpdateProduct(ProductPayload {
                product_id: offline_id.clone(),
                product: Product::named("Charger 2A", "CHG", 14.0),
            }),
        )
        .with_priority(10);
        let renamed = apply_local(&db, &rename).unwrap();

        let batch = db.read(|c| queue::dequeue_batch(c, "A", 10, &now_iso())).unwrap();
        assert_eq!(batch[0].queue_id, renamed.queue_id);

        let report = engine.sync_all("A").await.unwrap();
        assert_eq!(report.success, 2);
        assert_eq!(report.failed, 0);
        let product = remote.find(PRODUCTS, &RecordKey::new().eq("sku", "CHG")).unwrap();
        assert_eq!(product["name"], "Charger 2A");
    }

    #[tokio::test]
    async fn test_restocks_replay_in_enqueue_order_despite_priority() {
        let remote = MemoryRemote::new();
        let pid = seed_stocked_product(&remote, "A", "CBL", 10);
        let (db, engine) = engine(remote.clone());
        engine.pull("A").await.unwrap();

        apply_local(&db, &Mutation::restock("A", &pid, 1)).unwrap();
        let later = apply_local(&db, &Mutation::restock("A", &pid, 2).with_priority(10)).unwrap();
        assert_eq!(engine.sync_all("A").await.unwrap().success, 2);

        let row = remote
            .find(INVENTORY, &RecordKey::new().eq("store_id", "A").eq("product_id", &pid))
            .unwrap();
        assert_eq!(row["available_qty"], 13);
        assert_eq!(row["last_movement_ref"], later.client_ref.as_str());
    }

    #[tokio::test]
    async fn test_sale_for_offline_customer_syncs_after_customer() {
        let remote = MemoryRemote::new();
        let pid = seed_stocked_product(&remote, "A", "CBL", 10);
        let (db, engine) = engine(remote.clone());
        engine.pull("A").await.unwrap();

        let customer = Customer {
            name: "Dana".into(),
            phone: Some("555-0101".into()),
            email: None,
            loyalty_points: 0,
        };
        let created = apply_local(&db, &Mutation::create_customer("A", customer.clone())).unwrap();
        let customer_id = created.entity_id().to_string();
        let update = Operation::UpdateCustomer(CustomerPayload {
            customer_id: customer_id.clone(),
            customer: Customer {
                name: "Dana K".into(),
                ..customer
            },
        });
        apply_local(&db, &Mutation::new("A", update)).unwrap();
        let sold = apply_local(&db, &Mutation::record_sale("A", sale(&[(pid.as_str(), 2)], Some(&customer_id)))).unwrap();

        let report = engine.sync_all("A").await.unwrap();
        assert_eq!(report.success, 3);
        assert_eq!(report.group(SyncGroup::Customers).unwrap().success, 2);
        assert_eq!(report.group(SyncGroup::Sales).unwrap().success, 1);

        let remote_customer = remote.find(CUSTOMERS, &RecordKey::new().eq("phone", "555-0101")).unwrap();
        assert_eq!(remote_customer["name"], "Dana K");
        let remote_sale = remote.rows(SALES).remove(0);
        assert_eq!(remote_sale["customer_id"], record_id(&remote_customer).unwrap().as_str());

        let row = remote
            .find(INVENTORY, &RecordKey::new().eq("store_id", "A").eq("product_id", &pid))
            .unwrap();
        assert_eq!(row["available_qty"], 8);
        assert_eq!(row["quantity_sold"], 2);

        let position = InventoryCache::new(Arc::clone(&db)).for_product("A", &pid).unwrap().unwrap();
        assert_eq!(position.data.available_qty, 8);
        assert!(position.is_synced());
        let cached = SaleCache::new(Arc::clone(&db)).get_by_id("A", sold.entity_id()).unwrap().unwrap();
        assert!(cached.is_synced());
    }

    #[tokio::test]
    async fn test_sale_resumes_after_failed_line_without_second_decrement() {
        let remote = MemoryRemote::new();
        let cable = seed_stocked_product(&remote, "A", "CBL", 10);
        let charger = seed_stocked_product(&remote, "A", "CHG", 10);
        let (db, engine) = engine(remote.clone());
        engine.pull("A").await.unwrap();

        let local = apply_local(&db, &Mutation::record_sale("A", sale(&[(cable.as_str(), 2), (charger.as_str(), 3)], None))).unwrap();
        remote.fail_ref(&format!("{}:line:1", local.client_ref), unavailable());

        assert_eq!(engine.sync_all("A").await.unwrap().failed, 1);
        assert_eq!(remote_qty(&remote, "A", &cable), Some(8));
        assert_eq!(remote_qty(&remote, "A", &charger), Some(10));

        remote.clear_failures();
        OperationQueue::new(Arc::clone(&db)).retry_item(local.queue_id).unwrap();
        assert_eq!(engine.sync_all("A").await.unwrap().success, 1);

        assert_eq!(remote_qty(&remote, "A", &cable), Some(8));
        assert_eq!(remote_qty(&remote, "A", &charger), Some(7));
        assert_eq!(remote.rows(SALES).len(), 1);
        let inventory = InventoryCache::new(Arc::clone(&db));
        assert_eq!(inventory.available_qty("A", &cable).unwrap(), 8);
        assert_eq!(inventory.available_qty("A", &charger).unwrap(), 7);
    }

    #[tokio::test]
    async fn test_delete_after_offline_create_removes_remote_row() {
        let remote = MemoryRemote::new();
        let (db, engine) = engine(remote.clone());

        let created = apply_local(&db, &Mutation::create_product("A", Product::named("Case", "CSE", 9.0))).unwrap();
        let offline_id = created.entity_id().to_string();
        let deleted = apply_local(&db, &delete_product(&offline_id)).unwrap();
        assert!(matches!(
            &deleted.operation,
            Operation::DeleteProduct(d) if d.created_ref.as_deref() == Some(created.client_ref.as_str())
        ));

        let report = engine.sync_all("A").await.unwrap();
        assert_eq!(report.success, 2);
        assert!(remote.rows(PRODUCTS).is_empty());
        // The create's confirm does not bring the deleted row back.
        let products = ProductCache::new(Arc::clone(&db));
        assert!(products.get_all("A").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_waits_for_its_pending_create() {
        let remote = MemoryRemote::new();
        let (db, engine) = engine(remote.clone());

        let created = apply_local(&db, &Mutation::create_product("A", Product::named("Case", "CSE", 9.0))).unwrap();
        let deleted = apply_local(&db, &delete_product(created.entity_id())).unwrap();
        remote.fail_ref(&created.client_ref, unavailable());

        let first = engine.sync_all("A").await.unwrap();
        assert_eq!(first.failed, 2);
        let queue = OperationQueue::new(Arc::clone(&db));
        let items = queue.list("A", Some(QueueStatus::Failed)).unwrap();
        assert!(items.iter().all(|i| i.retryable));

        remote.clear_failures();
        queue.retry_item(created.queue_id).unwrap();
        queue.retry_item(deleted.queue_id).unwrap();
        assert_eq!(engine.sync_all("A").await.unwrap().success, 2);
        assert!(remote.rows(PRODUCTS).is_empty());
    }

    #[tokio::test]
    async fn test_delete_of_discarded_create_needs_no_remote_call() {
        let remote = MemoryRemote::new();
        let (db, engine) = engine(remote.clone());

        let created = apply_local(&db, &Mutation::create_product("A", Product::named("Case", "CSE", 9.0))).unwrap();
        remote.fail_ref(&created.client_ref, validation("sku already exists"));
        assert_eq!(engine.sync_all("A").await.unwrap().failed, 1);

        let queue = OperationQueue::new(Arc::clone(&db));
        assert!(queue.discard_item(created.queue_id).unwrap());
        let deleted = apply_local(&db, &delete_product(created.entity_id())).unwrap();
        // Any remote write for the delete would fail.
        remote.fail_ref(&deleted.client_ref, unavailable());

        let report = engine.sync_all("A").await.unwrap();
        assert_eq!(report.success, 1);
        assert_eq!(report.failed, 0);
        assert!(remote.rows(PRODUCTS).is_empty());
    }

    #[tokio::test]
    async fn test_delete_of_customer_already_gone_remotely_succeeds() {
        let remote = MemoryRemote::new();
        let customer_id = remote.seed(CUSTOMERS, json!({ "store_id": "A", "name": "Ari", "phone": "555-0199" }));
        let (db, engine) = engine(remote.clone());
        engine.pull("A").await.unwrap();
        let customers = CustomerCache::new(Arc::clone(&db));
        assert!(customers.get_by_id("A", &customer_id).unwrap().is_some());

        // Removed by another till in the meantime.
        remote
            .delete(CUSTOMERS, &RecordKey::id(&customer_id), None)
            .await
            .unwrap();
        let delete = Operation::DeleteCustomer(DeletePayload {
            id: customer_id.clone(),
            created_ref: None,
        });
        apply_local(&db, &Mutation::new("A", delete)).unwrap();

        assert_eq!(engine.sync_all("A").await.unwrap().success, 1);
        assert!(customers.get_by_id("A", &customer_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_imei_add_and_remove_reach_remote() {
        let remote = MemoryRemote::new();
        let pid = seed_stocked_product(&remote, "A", "PHN", 10);
        let (db, engine) = engine(remote.clone());
        engine.pull("A").await.unwrap();

        let imei = || ImeiPayload {
            product_id: pid.clone(),
            imei: "356938035643809".into(),
        };
        let key = RecordKey::new().eq("product_id", &pid).eq("imei", "356938035643809");

        apply_local(&db, &Mutation::new("A", Operation::AddImei(imei()))).unwrap();
        assert_eq!(engine.sync_all("A").await.unwrap().success, 1);
        assert_eq!(remote.find(PRODUCT_IMEIS, &key).unwrap()["store_id"], "A");
        let products = ProductCache::new(Arc::clone(&db));
        assert!(products.get_by_id("A", &pid).unwrap().unwrap().is_synced());

        apply_local(&db, &Mutation::new("A", Operation::RemoveImei(imei()))).unwrap();
        assert_eq!(engine.sync_all("A").await.unwrap().success, 1);
        assert!(remote.find(PRODUCT_IMEIS, &key).is_none());
        assert!(products.get_by_id("A", &pid).unwrap().unwrap().data.imeis.is_empty());
    }
}
