//! The Small POS - offline-first mutation pipeline
//!
//! Keeps the POS working without a network: mutations are applied to a
//! local SQLite cache and appended to a durable operation queue in one
//! transaction, then replayed against the remote datastore once
//! connectivity returns.
//!
//! `OfflineContext` wires the pieces together for a host application:
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use small_pos_offline::{HttpRemoteStore, Mutation, OfflineContext, SyncConfig};
//!
//! let config = SyncConfig::load(&small_pos_offline::config::default_data_dir())?;
//! let remote = Arc::new(HttpRemoteStore::from_config(&config)?);
//! let ctx = OfflineContext::open(config, remote)?;
//!
//! ctx.apply(&Mutation::restock("store-1", "product-9", 5))?;
//! let auto = ctx.start_auto_sync("store-1");
//! ctx.connectivity().set_online(true);
//! # auto.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod adjustments;
pub mod api;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod customers;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod inventory;
pub mod metadata;
pub mod models;
pub mod mutations;
pub mod notifications;
pub mod products;
pub mod queue;
pub mod reconcile;
pub mod remote;
pub mod replay;
pub mod sales;
pub mod sync;
pub mod transfers;

#[cfg(test)]
mod test_support;

pub use api::HttpRemoteStore;
pub use config::SyncConfig;
pub use connectivity::{ConnectivityMonitor, SyncTrigger, TriggerHandle};
pub use db::DbState;
pub use error::{ConfigError, RemoteError, StoreError, StoreResult, SyncError};
pub use events::{EventBus, Subscription, SyncEvent};
pub use models::{CachedEntity, EntityType, OfflineStatus};
pub use mutations::{LocalResult, Mutation};
pub use queue::{Operation, OperationQueue, QueueItem, QueueStatus, SyncGroup};
pub use remote::{RecordKey, RemoteStore};
pub use sync::{PullReport, SyncEngine, SyncReport, SyncState, SyncStatus};

use adjustments::AdjustmentCache;
use customers::CustomerCache;
use diagnostics::SyncHealth;
use inventory::InventoryCache;
use notifications::Notification;
use products::ProductCache;
use sales::SaleCache;
use transfers::TransferCache;

/// Everything a host needs: the local store, typed caches, the queue, the
/// sync engine and connectivity state.
pub struct OfflineContext {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteStore>,
    engine: Arc<SyncEngine>,
    connectivity: Arc<ConnectivityMonitor>,
    queue: OperationQueue,
    pub products: ProductCache,
    pub inventory: InventoryCache,
    pub customers: CustomerCache,
    pub sales: SaleCache,
    pub transfers: TransferCache,
    pub adjustments: AdjustmentCache,
}

impl OfflineContext {
    /// Open (or create) the local store under `config.data_dir`.
    pub fn open(config: SyncConfig, remote: Arc<dyn RemoteStore>) -> StoreResult<Self> {
        let db = Arc::new(db::init(&config.data_dir)?);
        Self::with_db(db, config, remote)
    }

    pub fn with_db(db: Arc<DbState>, config: SyncConfig, remote: Arc<dyn RemoteStore>) -> StoreResult<Self> {
        let engine = Arc::new(SyncEngine::new(Arc::clone(&db), Arc::clone(&remote), config)?);
        // Offline until the host or a health check says otherwise.
        let connectivity = Arc::new(ConnectivityMonitor::new(false, engine.events().clone()));
        Ok(Self {
            queue: OperationQueue::new(Arc::clone(&db)),
            products: ProductCache::new(Arc::clone(&db)),
            inventory: InventoryCache::new(Arc::clone(&db)),
            customers: CustomerCache::new(Arc::clone(&db)),
            sales: SaleCache::new(Arc::clone(&db)),
            transfers: TransferCache::new(Arc::clone(&db)),
            adjustments: AdjustmentCache::new(Arc::clone(&db)),
            db,
            remote,
            engine,
            connectivity,
        })
    }

    /// Apply a mutation locally and queue it for sync. Returns as soon as
    /// the local transaction commits.
    pub fn apply(&self, mutation: &Mutation) -> StoreResult<LocalResult> {
        let result = mutations::apply_local(&self.db, mutation)?;
        debug!(
            queue_id = result.queue_id,
            client_ref = %result.client_ref,
            deduplicated = result.deduplicated,
            "Mutation applied locally"
        );
        Ok(result)
    }

    /// Start the reconnect trigger for `store_id`, plus the health check task
    /// when `health_check_interval_secs` is non-zero. Must be called from within a
    /// Tokio runtime.
    pub fn start_auto_sync(&self, store_id: &str) -> AutoSync {
        let trigger = SyncTrigger::spawn(Arc::clone(&self.engine), Arc::clone(&self.connectivity), store_id);
        let health_token = CancellationToken::new();
        let health = self.engine.config().health_check_interval().map(|every| {
            self.connectivity
                .spawn_health_check(Arc::clone(&self.remote), every, health_token.clone())
        });
        info!(store_id, health_check = health.is_some(), "Auto sync started");
        AutoSync {
            trigger,
            health_token,
            health,
        }
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub fn events(&self) -> &EventBus {
        self.engine.events()
    }

    pub fn unread_notifications(&self, store_id: &str) -> StoreResult<Vec<Notification>> {
        self.db.read(|conn| notifications::unread(conn, store_id))
    }

    pub fn health(&self, store_id: &str) -> StoreResult<SyncHealth> {
        diagnostics::sync_health(&self.db, store_id)
    }
}

/// Background tasks started by [`OfflineContext::start_auto_sync`].
pub struct AutoSync {
    trigger: TriggerHandle,
    health_token: CancellationToken,
    health: Option<JoinHandle<()>>,
}

impl AutoSync {
    pub async fn shutdown(self) {
        self.health_token.cancel();
        if let Some(health) = self.health {
            if let Err(e) = health.await {
                warn!("Connectivity check ended abnormally: {e}");
            }
        }
        self.trigger.shutdown().await;
    }
}
