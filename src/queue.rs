//! Durable operation queue (`sync_queue` table).
//!
//! One row per logical user action. The payload is written once at enqueue
//! time and never rewritten; only status, attempts, error and retry
//! scheduling change afterwards.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::customers::Customer;
use crate::db::{now_iso, DbState};
use crate::error::{StoreError, StoreResult};
use crate::models::EntityType;
use crate::products::Product;
use crate::sales::Sale;

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductPayload {
    /// Remote id, or the offline id for products created offline.
    pub product_id: String,
    pub product: Product,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerPayload {
    pub customer_id: String,
    pub customer: Customer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletePayload {
    pub id: String,
    /// `client_ref` of the queued create when `id` is an offline id; the
    /// remote row is found by it once the create has synced.
    #[serde(default)]
    pub created_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImeiPayload {
    pub product_id: String,
    pub imei: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestockPayload {
    pub product_id: String,
    pub quantity: i64,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustPayload {
    pub adjustment_id: String,
    pub product_id: String,
    pub delta: i64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalePayload {
    pub sale_id: String,
    pub sale: Sale,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferPayload {
    pub transfer_id: String,
    pub product_id: String,
    pub from_store_id: String,
    pub to_store_id: String,
    pub quantity: i64,
}

/// A queued mutation. Each variant carries its own typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "data", rename_all = "snake_case")]
pub enum Operation {
    CreateProduct(ProductPayload),
    UpdateProduct(ProductPayload),
    DeleteProduct(DeletePayload),
    AddImei(ImeiPayload),
    RemoveImei(ImeiPayload),
    Restock(RestockPayload),
    Adjust(AdjustPayload),
    RecordSale(SalePayload),
    Transfer(TransferPayload),
    CreateCustomer(CustomerPayload),
    UpdateCustomer(CustomerPayload),
    DeleteCustomer(DeletePayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    ImeiAdd,
    ImeiRemove,
    Restock,
    Adjust,
    Sale,
    Transfer,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::ImeiAdd => "imei_add",
            OperationKind::ImeiRemove => "imei_remove",
            OperationKind::Restock => "restock",
            OperationKind::Adjust => "adjust",
            OperationKind::Sale => "sale",
            OperationKind::Transfer => "transfer",
        }
    }
}

/// Queue items with distinct remote semantics are drained as separate groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncGroup {
    Catalog,
    Customers,
    Imei,
    Inventory,
    Adjustments,
    Sales,
    Transfers,
}

impl SyncGroup {
    /// Drain order. Catalog and customers come first so later groups can
    /// resolve offline ids they reference.
    pub const ALL: [SyncGroup; 7] = [
        SyncGroup::Catalog,
        SyncGroup::Customers,
        SyncGroup::Imei,
        SyncGroup::Inventory,
        SyncGroup::Adjustments,
        SyncGroup::Sales,
        SyncGroup::Transfers,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SyncGroup::Catalog => "catalog",
            SyncGroup::Imei => "imei",
            SyncGroup::Inventory => "inventory",
            SyncGroup::Adjustments => "adjustments",
            SyncGroup::Sales => "sales",
            SyncGroup::Transfers => "transfers",
            SyncGroup::Customers => "customers",
        }
    }
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::CreateProduct(_) | Operation::CreateCustomer(_) => OperationKind::Create,
            Operation::UpdateProduct(_) | Operation::UpdateCustomer(_) => OperationKind::Update,
            Operation::DeleteProduct(_) | Operation::DeleteCustomer(_) => OperationKind::Delete,
            Operation::AddImei(_) => OperationKind::ImeiAdd,
            Operation::RemoveImei(_) => OperationKind::ImeiRemove,
            Operation::Restock(_) => OperationKind::Restock,
            Operation::Adjust(_) => OperationKind::Adjust,
            Operation::RecordSale(_) => OperationKind::Sale,
            Operation::Transfer(_) => OperationKind::Transfer,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            Operation::CreateProduct(_) | Operation::UpdateProduct(_) | Operation::DeleteProduct(_) => {
                EntityType::Product
            }
            Operation::AddImei(_) | Operation::RemoveImei(_) => EntityType::ProductImei,
            Operation::Restock(_) => EntityType::Inventory,
            Operation::Adjust(_) => EntityType::AdjustmentLog,
            Operation::RecordSale(_) => EntityType::Sale,
            Operation::Transfer(_) => EntityType::StockTransfer,
            Operation::CreateCustomer(_) | Operation::UpdateCustomer(_) | Operation::DeleteCustomer(_) => {
                EntityType::Customer
            }
        }
    }

    /// Remote id or offline id of the record the operation targets.
    pub fn entity_id(&self) -> &str {
        match self {
            Operation::CreateProduct(p) | Operation::UpdateProduct(p) => &p.product_id,
            Operation::DeleteProduct(d) | Operation::DeleteCustomer(d) => &d.id,
            Operation::AddImei(i) | Operation::RemoveImei(i) => &i.product_id,
            Operation::Restock(r) => &r.product_id,
            Operation::Adjust(a) => &a.adjustment_id,
            Operation::RecordSale(s) => &s.sale_id,
            Operation::Transfer(t) => &t.transfer_id,
            Operation::CreateCustomer(c) | Operation::UpdateCustomer(c) => &c.customer_id,
        }
    }

    pub fn group(&self) -> SyncGroup {
        match self {
            Operation::CreateProduct(_) | Operation::UpdateProduct(_) | Operation::DeleteProduct(_) => {
                SyncGroup::Catalog
            }
            Operation::AddImei(_) | Operation::RemoveImei(_) => SyncGroup::Imei,
            Operation::Restock(_) => SyncGroup::Inventory,
            Operation::Adjust(_) => SyncGroup::Adjustments,
            Operation::RecordSale(_) => SyncGroup::Sales,
            Operation::Transfer(_) => SyncGroup::Transfers,
            Operation::CreateCustomer(_) | Operation::UpdateCustomer(_) | Operation::DeleteCustomer(_) => {
                SyncGroup::Customers
            }
        }
    }

    /// Catalog and customer changes rank first: other items may reference
    /// records they create.
    pub fn default_priority(&self) -> i64 {
        match self.group() {
            SyncGroup::Catalog | SyncGroup::Customers => 30,
            SyncGroup::Sales => 20,
            SyncGroup::Inventory | SyncGroup::Adjustments | SyncGroup::Transfers => 10,
            SyncGroup::Imei => 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Queue items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Synced,
    Failed,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Synced => "synced",
            QueueStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> StoreResult<Self> {
        match raw {
            "pending" => Ok(QueueStatus::Pending),
            "synced" => Ok(QueueStatus::Synced),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(StoreError::Corrupt {
                kind: "queue status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItem {
    pub queue_id: i64,
    pub entity_type: EntityType,
    pub operation: Operation,
    pub entity_id: String,
    pub store_id: String,
    pub status: QueueStatus,
    pub priority: i64,
    pub sync_attempts: i64,
    pub client_ref: String,
    pub created_at: String,
    pub error_message: Option<String>,
    pub next_retry_at: Option<String>,
    pub retryable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued(i64),
    /// An item with the same `client_ref` is already queued.
    Duplicate(i64),
}

impl EnqueueOutcome {
    pub fn queue_id(self) -> i64 {
        match self {
            EnqueueOutcome::Queued(id) | EnqueueOutcome::Duplicate(id) => id,
        }
    }

    pub fn is_duplicate(self) -> bool {
        matches!(self, EnqueueOutcome::Duplicate(_))
    }
}

/// What happens to a failed item next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retry {
    /// Eligible again once `next_retry_at` (ISO timestamp) has passed.
    At(String),
    /// Eligible on the next drain.
    Immediately,
    /// Waits for a manual `retry_item`.
    Manual,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub failed: i64,
    pub synced: i64,
}

impl QueueCounts {
    /// Items not yet applied remotely.
    pub fn outstanding(&self) -> i64 {
        self.pending + self.failed
    }
}

const ITEM_COLUMNS: &str = "queue_id, entity_type, operation, entity_id, store_id, payload, status,
                            priority, sync_attempts, client_ref, created_at, error_message,
                            next_retry_at, retryable";

type RawItem = (
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    i64,
    String,
    String,
    Option<String>,
    Option<String>,
    i64,
);

fn map_item(row: &Row<'_>) -> rusqlite::Result<RawItem> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
    ))
}

fn finish_item(raw: RawItem) -> StoreResult<QueueItem> {
    let (
        queue_id,
        entity_type,
        _kind,
        entity_id,
        store_id,
        payload,
        status,
        priority,
        sync_attempts,
        client_ref,
        created_at,
        error_message,
        next_retry_at,
        retryable,
    ) = raw;
    Ok(QueueItem {
        queue_id,
        entity_type: EntityType::parse(&entity_type)?,
        operation: serde_json::from_str(&payload)?,
        entity_id,
        store_id,
        status: QueueStatus::parse(&status)?,
        priority,
        sync_attempts,
        client_ref,
        created_at,
        error_message,
        next_retry_at,
        retryable: retryable != 0,
    })
}

fn query_items(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> StoreResult<Vec<QueueItem>> {
    let mut stmt = conn.prepare(sql)?;
    let raw = stmt.query_map(args, map_item)?.collect::<Result<Vec<_>, _>>()?;
    raw.into_iter().map(finish_item).collect()
}

// ---------------------------------------------------------------------------
// Connection-level operations (composable inside a transaction)
// ---------------------------------------------------------------------------

/// Append a durable item. A `client_ref` still present in the queue makes
/// this a no-op returning the existing item's id.
pub fn enqueue(
    conn: &Connection,
    store_id: &str,
    operation: &Operation,
    client_ref: &str,
    priority: Option<i64>,
) -> StoreResult<EnqueueOutcome> {
    if client_ref.trim().is_empty() {
        return Err(StoreError::Invalid("client_ref must not be empty".into()));
    }

    let existing: Option<i64> = conn
        .query_row(
            "SELECT queue_id FROM sync_queue WHERE client_ref = ?1",
            params![client_ref],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(queue_id) = existing {
        info!(queue_id, client_ref, "Enqueue deduplicated via client_ref");
        return Ok(EnqueueOutcome::Duplicate(queue_id));
    }

    let payload = serde_json::to_string(operation)?;
    let now = now_iso();
    conn.execute(
        "INSERT INTO sync_queue (
            entity_type, operation, entity_id, store_id, payload, status,
            priority, sync_attempts, client_ref, created_at, updated_at, retryable
         ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, 0, ?7, ?8, ?8, 1)",
        params![
            operation.entity_type().as_str(),
            operation.kind().as_str(),
            operation.entity_id(),
            store_id,
            payload,
            priority.unwrap_or_else(|| operation.default_priority()),
            client_ref,
            now,
        ],
    )?;
    let queue_id = conn.last_insert_rowid();
    debug!(
        queue_id,
        store_id,
        entity_type = %operation.entity_type(),
        operation = operation.kind().as_str(),
        "Enqueued sync item"
    );
    Ok(EnqueueOutcome::Queued(queue_id))
}

/// Items eligible for replay: pending, or failed-but-retryable whose backoff
/// has elapsed. Higher priority first, FIFO within a priority.
pub fn dequeue_batch(conn: &Connection, store_id: &str, max: usize, now: &str) -> StoreResult<Vec<QueueItem>> {
    let sql = format!(
        "SELECT {ITEM_COLUMNS} FROM sync_queue
         WHERE store_id = ?1
           AND (status = 'pending' OR (status = 'failed' AND retryable = 1))
           AND (next_retry_at IS NULL OR next_retry_at <= ?2)
         ORDER BY priority DESC, queue_id ASC
         LIMIT ?3"
    );
    query_items(conn, &sql, params![store_id, now, max as i64])
}

pub fn get_item(conn: &Connection, queue_id: i64) -> StoreResult<Option<QueueItem>> {
    let sql = format!("SELECT {ITEM_COLUMNS} FROM sync_queue WHERE queue_id = ?1");
    Ok(query_items(conn, &sql, params![queue_id])?.into_iter().next())
}

pub fn list_items(conn: &Connection, store_id: &str, status: Option<QueueStatus>) -> StoreResult<Vec<QueueItem>> {
    match status {
        Some(status) => {
            let sql = format!(
                "SELECT {ITEM_COLUMNS} FROM sync_queue
                 WHERE store_id = ?1 AND status = ?2
                 ORDER BY queue_id ASC"
            );
            query_items(conn, &sql, params![store_id, status.as_str()])
        }
        None => {
            let sql = format!(
                "SELECT {ITEM_COLUMNS} FROM sync_queue WHERE store_id = ?1 ORDER BY queue_id ASC"
            );
            query_items(conn, &sql, params![store_id])
        }
    }
}

pub fn mark_synced(conn: &Connection, queue_id: i64) -> StoreResult<()> {
    let now = now_iso();
    let n = conn.execute(
        "UPDATE sync_queue
         SET status = 'synced',
             sync_attempts = sync_attempts + 1,
             error_message = NULL,
             next_retry_at = NULL,
             synced_at = ?1,
             updated_at = ?1
         WHERE queue_id = ?2",
        params![now, queue_id],
    )?;
    ensure_updated(n, queue_id)
}

pub fn mark_failed(conn: &Connection, queue_id: i64, error: &str, retry: &Retry) -> StoreResult<()> {
    let (next_retry_at, retryable) = match retry {
        Retry::At(at) => (Some(at.as_str()), 1),
        Retry::Immediately => (None, 1),
        Retry::Manual => (None, 0),
    };
    let n = conn.execute(
        "UPDATE sync_queue
         SET status = 'failed',
             sync_attempts = sync_attempts + 1,
             error_message = ?1,
             next_retry_at = ?2,
             retryable = ?3,
             updated_at = ?4
         WHERE queue_id = ?5",
        params![error, next_retry_at, retryable, now_iso(), queue_id],
    )?;
    ensure_updated(n, queue_id)
}

fn ensure_updated(n: usize, queue_id: i64) -> StoreResult<()> {
    if n == 0 {
        return Err(StoreError::NotFound {
            entity: "sync_queue",
            key: queue_id.to_string(),
            store_id: String::new(),
        });
    }
    Ok(())
}

/// `client_ref` of the create that introduced `entity_id`, if still queued.
pub fn create_ref_for(conn: &Connection, store_id: &str, entity_id: &str) -> StoreResult<Option<String>> {
    let found = conn
        .query_row(
            "SELECT client_ref FROM sync_queue
             WHERE store_id = ?1 AND entity_id = ?2 AND operation = 'create'
             ORDER BY queue_id ASC LIMIT 1",
            params![store_id, entity_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found)
}

/// Whether a create for `entity_id` is queued and not yet applied remotely.
pub fn has_unsynced_create(conn: &Connection, store_id: &str, entity_id: &str) -> StoreResult<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sync_queue
         WHERE store_id = ?1 AND entity_id = ?2 AND operation = 'create' AND status != 'synced'",
        params![store_id, entity_id],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// Remove synced items from the visible queue.
pub fn clear_synced(conn: &Connection, store_id: &str) -> StoreResult<usize> {
    let n = conn.execute(
        "DELETE FROM sync_queue WHERE store_id = ?1 AND status = 'synced'",
        params![store_id],
    )?;
    Ok(n)
}

pub fn counts(conn: &Connection, store_id: &str) -> StoreResult<QueueCounts> {
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*) FROM sync_queue WHERE store_id = ?1 GROUP BY status",
    )?;
    let rows = stmt
        .query_map(params![store_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut counts = QueueCounts::default();
    for (status, n) in rows {
        match QueueStatus::parse(&status)? {
            QueueStatus::Pending => counts.pending = n,
            QueueStatus::Failed => counts.failed = n,
            QueueStatus::Synced => counts.synced = n,
        }
    }
    Ok(counts)
}

/// Items not yet applied remotely (pending plus failed).
pub fn pending_count(conn: &Connection, store_id: &str) -> StoreResult<i64> {
    Ok(counts(conn, store_id)?.outstanding())
}

/// Make a failed item eligible again on the next drain, clearing its backoff.
pub fn retry_item(conn: &Connection, queue_id: i64) -> StoreResult<()> {
    let n = conn.execute(
        "UPDATE sync_queue
         SET status = 'pending', retryable = 1, next_retry_at = NULL, updated_at = ?1
         WHERE queue_id = ?2 AND status = 'failed'",
        params![now_iso(), queue_id],
    )?;
    ensure_updated(n, queue_id)
}

/// Explicitly drop an item (e.g. a rejected item the operator gave up on).
pub fn discard_item(conn: &Connection, queue_id: i64) -> StoreResult<bool> {
    let n = conn.execute("DELETE FROM sync_queue WHERE queue_id = ?1", params![queue_id])?;
    Ok(n > 0)
}

// ---------------------------------------------------------------------------
// Queue handle
// ---------------------------------------------------------------------------

/// Handle over the queue table for callers outside a transaction.
#[derive(Clone)]
pub struct OperationQueue {
    db: Arc<DbState>,
}

impl OperationQueue {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    pub fn enqueue(
        &self,
        store_id: &str,
        operation: &Operation,
        client_ref: &str,
        priority: Option<i64>,
    ) -> StoreResult<EnqueueOutcome> {
        self.db
            .transaction(|tx| enqueue(tx, store_id, operation, client_ref, priority))
    }

    pub fn dequeue_batch(&self, store_id: &str, max: usize) -> StoreResult<Vec<QueueItem>> {
        let now = now_iso();
        self.db.read(|conn| dequeue_batch(conn, store_id, max, &now))
    }

    pub fn get(&self, queue_id: i64) -> StoreResult<Option<QueueItem>> {
        self.db.read(|conn| get_item(conn, queue_id))
    }

    pub fn list(&self, store_id: &str, status: Option<QueueStatus>) -> StoreResult<Vec<QueueItem>> {
        self.db.read(|conn| list_items(conn, store_id, status))
    }

    pub fn mark_synced(&self, queue_id: i64) -> StoreResult<()> {
        self.db.read(|conn| mark_synced(conn, queue_id))
    }

    /// Record a failure; the item stays eligible for the next drain.
    pub fn mark_failed(&self, queue_id: i64, error: &str) -> StoreResult<()> {
        self.db
            .read(|conn| mark_failed(conn, queue_id, error, &Retry::Immediately))
    }

    pub fn clear_synced(&self, store_id: &str) -> StoreResult<usize> {
        self.db.read(|conn| clear_synced(conn, store_id))
    }

    pub fn counts(&self, store_id: &str) -> StoreResult<QueueCounts> {
        self.db.read(|conn| counts(conn, store_id))
    }

    pub fn pending_count(&self, store_id: &str) -> StoreResult<i64> {
        self.db.read(|conn| pending_count(conn, store_id))
    }

    pub fn retry_item(&self, queue_id: i64) -> StoreResult<()> {
        self.db.read(|conn| retry_item(conn, queue_id))
    }

    pub fn discard_item(&self, queue_id: i64) -> StoreResult<bool> {
        self.db.read(|conn| discard_item(conn, queue_id))
    }
}
