//! Optimistic local mutations.
//!
//! `apply_local` is the only entry point for user-initiated writes. It
//! validates the operation, patches the entity cache and appends the queue
//! item inside one SQLite transaction, so the cache never shows a change the
//! queue does not carry (and vice versa).

use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::cache::{delete_row, patch_row, read_row, require_row, write_row, CacheRow};
use crate::db::{now_iso, DbState};
use crate::error::{StoreError, StoreResult};
use crate::models::{new_client_ref, new_offline_id, EntityType, OfflineStatus};
use crate::queue::{
    self, AdjustPayload, CustomerPayload, DeletePayload, ImeiPayload, Operation, ProductPayload, QueueItem,
    RestockPayload, SalePayload, TransferPayload,
};
use crate::sales::Sale;
use crate::transfers::{StockTransfer, TransferStatus};

/// A user action waiting to be applied locally.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub store_id: String,
    pub operation: Operation,
    /// Idempotency token, stable across retries of this action.
    pub client_ref: String,
    pub priority: Option<i64>,
}

impl Mutation {
    pub fn new(store_id: &str, operation: Operation) -> Self {
        Self {
            store_id: store_id.to_string(),
            operation,
            client_ref: new_client_ref(),
            priority: None,
        }
    }

    /// Reuse a caller-held token (e.g. one minted when the button was shown).
    pub fn with_client_ref(mut self, client_ref: &str) -> Self {
        self.client_ref = client_ref.to_string();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn create_product(store_id: &str, product: crate::products::Product) -> Self {
        Self::new(
            store_id,
            Operation::CreateProduct(ProductPayload {
                product_id: new_offline_id(),
                product,
            }),
        )
    }

    pub fn create_customer(store_id: &str, customer: crate::customers::Customer) -> Self {
        Self::new(
            store_id,
            Operation::CreateCustomer(CustomerPayload {
                customer_id: new_offline_id(),
                customer,
            }),
        )
    }

    pub fn restock(store_id: &str, product_id: &str, quantity: i64) -> Self {
        Self::new(
            store_id,
            Operation::Restock(RestockPayload {
                product_id: product_id.to_string(),
                quantity,
                note: None,
            }),
        )
    }

    pub fn adjust(store_id: &str, product_id: &str, delta: i64, reason: &str) -> Self {
        Self::new(
            store_id,
            Operation::Adjust(AdjustPayload {
                adjustment_id: new_offline_id(),
                product_id: product_id.to_string(),
                delta,
                reason: reason.to_string(),
            }),
        )
    }

    pub fn record_sale(store_id: &str, sale: Sale) -> Self {
        Self::new(
            store_id,
            Operation::RecordSale(SalePayload {
                sale_id: new_offline_id(),
                sale,
            }),
        )
    }

    /// Transfers are queued in the source store's partition.
    pub fn transfer(product_id: &str, from_store_id: &str, to_store_id: &str, quantity: i64) -> Self {
        Self::new(
            from_store_id,
            Operation::Transfer(TransferPayload {
                transfer_id: new_offline_id(),
                product_id: product_id.to_string(),
                from_store_id: from_store_id.to_string(),
                to_store_id: to_store_id.to_string(),
                quantity,
            }),
        )
    }
}

/// What the local half of a mutation produced.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalResult {
    pub queue_id: i64,
    /// The `client_ref` was already queued; nothing was re-applied.
    pub deduplicated: bool,
    pub store_id: String,
    pub client_ref: String,
    pub operation: Operation,
}

impl LocalResult {
    /// Remote or offline id of the record the mutation targets.
    pub fn entity_id(&self) -> &str {
        self.operation.entity_id()
    }
}

impl From<&QueueItem> for LocalResult {
    fn from(item: &QueueItem) -> Self {
        Self {
            queue_id: item.queue_id,
            deduplicated: false,
            store_id: item.store_id.clone(),
            client_ref: item.client_ref.clone(),
            operation: item.operation.clone(),
        }
    }
}

/// Validate, patch the cache and enqueue, as one transaction.
pub fn apply_local(db: &DbState, mutation: &Mutation) -> StoreResult<LocalResult> {
    validate(mutation)?;

    let store_id = mutation.store_id.as_str();
    let client_ref = mutation.client_ref.as_str();
    let (outcome, operation) = db.transaction(|tx| {
        let operation = link_create(tx, store_id, &mutation.operation)?;
        let outcome = queue::enqueue(tx, store_id, &operation, client_ref, mutation.priority)?;
        if !outcome.is_duplicate() {
            apply_to_cache(tx, store_id, &operation, client_ref)?;
        }
        Ok((outcome, operation))
    })?;

    if outcome.is_duplicate() {
        info!(store_id, client_ref, "Mutation already queued, not re-applied");
    } else {
        debug!(
            store_id,
            client_ref,
            queue_id = outcome.queue_id(),
            operation = mutation.operation.kind().as_str(),
            "Local mutation applied"
        );
    }

    Ok(LocalResult {
        queue_id: outcome.queue_id(),
        deduplicated: outcome.is_duplicate(),
        store_id: mutation.store_id.clone(),
        client_ref: mutation.client_ref.clone(),
        operation,
    })
}

/// Deletes of records created offline remember the create's `client_ref`.
fn link_create(conn: &Connection, store_id: &str, operation: &Operation) -> StoreResult<Operation> {
    let mut operation = operation.clone();
    if let Operation::DeleteProduct(d) | Operation::DeleteCustomer(d) = &mut operation {
        if d.created_ref.is_none() && d.id.starts_with("offline-") {
            d.created_ref = queue::create_ref_for(conn, store_id, &d.id)?;
        }
    }
    Ok(operation)
}

fn invalid(msg: impl Into<String>) -> StoreError {
    StoreError::Invalid(msg.into())
}

/// Checks that need no local state.
fn validate(mutation: &Mutation) -> StoreResult<()> {
    if mutation.store_id.trim().is_empty() {
        return Err(invalid("store_id is required"));
    }
    if mutation.operation.entity_id().trim().is_empty() {
        return Err(invalid("target id is required"));
    }
    match &mutation.operation {
        Operation::CreateProduct(p) | Operation::UpdateProduct(p) => {
            if p.product.name.trim().is_empty() {
                return Err(invalid("product name is required"));
            }
            if p.product.price < 0.0 {
                return Err(invalid("product price cannot be negative"));
            }
        }
        Operation::CreateCustomer(c) | Operation::UpdateCustomer(c) => {
            if c.customer.name.trim().is_empty() {
                return Err(invalid("customer name is required"));
            }
        }
        Operation::AddImei(i) | Operation::RemoveImei(i) => {
            if i.imei.trim().is_empty() {
                return Err(invalid("IMEI is required"));
            }
        }
        Operation::Restock(r) => {
            if r.quantity <= 0 {
                return Err(invalid("restock quantity must be positive"));
            }
        }
        Operation::Adjust(a) => {
            if a.delta == 0 {
                return Err(invalid("adjustment delta cannot be zero"));
            }
            if a.reason.trim().is_empty() {
                return Err(invalid("adjustment reason is required"));
            }
        }
        Operation::RecordSale(s) => {
            if s.sale.lines.is_empty() {
                return Err(invalid("sale has no lines"));
            }
            if s.sale.lines.iter().any(|l| l.quantity <= 0) {
                return Err(invalid("sale line quantity must be positive"));
            }
        }
        Operation::Transfer(t) => {
            if t.quantity <= 0 {
                return Err(invalid("transfer quantity must be positive"));
            }
            if t.from_store_id == t.to_store_id {
                return Err(invalid("cannot transfer stock to the same store"));
            }
            if t.from_store_id != mutation.store_id {
                return Err(invalid("transfers are queued by the source store"));
            }
        }
        Operation::DeleteProduct(_) | Operation::DeleteCustomer(_) => {}
    }
    Ok(())
}

/// Status for an edit of an existing row: edits of synced records are
/// `pending_update`, edits of records never synced stay `pending`.
fn edit_status(row: &CacheRow) -> OfflineStatus {
    match row.offline_status {
        OfflineStatus::Synced | OfflineStatus::PendingUpdate => OfflineStatus::PendingUpdate,
        OfflineStatus::Pending => OfflineStatus::Pending,
        OfflineStatus::Failed if row.remote_id.is_some() => OfflineStatus::PendingUpdate,
        OfflineStatus::Failed => OfflineStatus::Pending,
    }
}

fn insert_local(
    conn: &Connection,
    entity: EntityType,
    store_id: &str,
    id: &str,
    data: Value,
    client_ref: &str,
) -> StoreResult<()> {
    let mut row = CacheRow::new(entity, store_id, id, data, OfflineStatus::Pending);
    row.offline_id = Some(id.to_string());
    row.client_ref = Some(client_ref.to_string());
    write_row(conn, &row)?;
    Ok(())
}

fn edit_local(
    conn: &Connection,
    entity: EntityType,
    store_id: &str,
    id: &str,
    fields: &Value,
    client_ref: &str,
) -> StoreResult<CacheRow> {
    let row = require_row(conn, entity, store_id, id)?;
    let status = edit_status(&row);
    patch_row(conn, entity, store_id, id, fields, client_ref, status)
}

/// Inventory row for a product, created with zero stock when missing.
fn inventory_row(conn: &Connection, store_id: &str, product_id: &str) -> StoreResult<CacheRow> {
    match read_row(conn, EntityType::Inventory, store_id, product_id)? {
        Some(row) => Ok(row),
        None => {
            let row = CacheRow::new(
                EntityType::Inventory,
                store_id,
                product_id,
                json!({ "product_id": product_id, "available_qty": 0, "quantity_sold": 0 }),
                OfflineStatus::Pending,
            );
            write_row(conn, &row)?;
            Ok(row)
        }
    }
}

fn apply_to_cache(conn: &Connection, store_id: &str, operation: &Operation, client_ref: &str) -> StoreResult<()> {
    match operation {
        Operation::CreateProduct(p) => insert_local(
            conn,
            EntityType::Product,
            store_id,
            &p.product_id,
            serde_json::to_value(&p.product)?,
            client_ref,
        ),
        Operation::UpdateProduct(p) => {
            let fields = serde_json::to_value(&p.product)?;
            edit_local(conn, EntityType::Product, store_id, &p.product_id, &fields, client_ref)?;
            Ok(())
        }
        Operation::DeleteProduct(DeletePayload { id, .. }) => {
            delete_row(conn, EntityType::Product, store_id, id)?;
            Ok(())
        }
        Operation::AddImei(i) => {
            let row = require_row(conn, EntityType::Product, store_id, &i.product_id)?;
            let mut imeis = imei_list(&row);
            if imeis.iter().any(|x| x == &i.imei) {
                return Err(invalid(format!("IMEI {} is already registered", i.imei)));
            }
            imeis.push(i.imei.clone());
            edit_local(
                conn,
                EntityType::Product,
                store_id,
                &i.product_id,
                &json!({ "imeis": imeis }),
                client_ref,
            )?;
            Ok(())
        }
        Operation::RemoveImei(i) => {
            let row = require_row(conn, EntityType::Product, store_id, &i.product_id)?;
            let mut imeis = imei_list(&row);
            let before = imeis.len();
            imeis.retain(|x| x != &i.imei);
            if imeis.len() == before {
                return Err(invalid(format!("IMEI {} is not registered on this product", i.imei)));
            }
            edit_local(
                conn,
                EntityType::Product,
                store_id,
                &i.product_id,
                &json!({ "imeis": imeis }),
                client_ref,
            )?;
            Ok(())
        }
        Operation::Restock(r) => {
            let row = inventory_row(conn, store_id, &r.product_id)?;
            let qty = row.i64_field("available_qty") + r.quantity;
            patch_row(
                conn,
                EntityType::Inventory,
                store_id,
                &r.product_id,
                &json!({ "available_qty": qty }),
                client_ref,
                OfflineStatus::Pending,
            )?;
            Ok(())
        }
        Operation::Adjust(a) => apply_adjust(conn, store_id, a, client_ref),
        Operation::RecordSale(s) => apply_sale(conn, store_id, s, client_ref),
        Operation::Transfer(t) => apply_transfer(conn, t, client_ref),
        Operation::CreateCustomer(c) => insert_local(
            conn,
            EntityType::Customer,
            store_id,
            &c.customer_id,
            serde_json::to_value(&c.customer)?,
            client_ref,
        ),
        Operation::UpdateCustomer(c) => {
            let fields = serde_json::to_value(&c.customer)?;
            edit_local(conn, EntityType::Customer, store_id, &c.customer_id, &fields, client_ref)?;
            Ok(())
        }
        Operation::DeleteCustomer(DeletePayload { id, .. }) => {
            delete_row(conn, EntityType::Customer, store_id, id)?;
            Ok(())
        }
    }
}

fn imei_list(row: &CacheRow) -> Vec<String> {
    row.data
        .get("imeis")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn apply_adjust(conn: &Connection, store_id: &str, a: &AdjustPayload, client_ref: &str) -> StoreResult<()> {
    let row = inventory_row(conn, store_id, &a.product_id)?;
    let previous_qty = row.i64_field("available_qty");
    let new_qty = previous_qty + a.delta;
    if new_qty < 0 {
        return Err(invalid(format!(
            "adjustment of {} would leave {} units of {}",
            a.delta, new_qty, a.product_id
        )));
    }
    patch_row(
        conn,
        EntityType::Inventory,
        store_id,
        &a.product_id,
        &json!({ "available_qty": new_qty }),
        client_ref,
        OfflineStatus::Pending,
    )?;
    insert_local(
        conn,
        EntityType::AdjustmentLog,
        store_id,
        &a.adjustment_id,
        json!({
            "product_id": a.product_id,
            "delta": a.delta,
            "reason": a.reason,
            "previous_qty": previous_qty,
            "new_qty": new_qty,
        }),
        client_ref,
    )
}

fn apply_sale(conn: &Connection, store_id: &str, s: &SalePayload, client_ref: &str) -> StoreResult<()> {
    insert_local(
        conn,
        EntityType::Sale,
        store_id,
        &s.sale_id,
        serde_json::to_value(&s.sale)?,
        client_ref,
    )?;
    for line in &s.sale.lines {
        // Untracked products have no position to decrement.
        let Some(row) = read_row(conn, EntityType::Inventory, store_id, &line.product_id)? else {
            continue;
        };
        let fields = json!({
            "available_qty": row.i64_field("available_qty") - line.quantity,
            "quantity_sold": row.i64_field("quantity_sold") + line.quantity,
        });
        patch_row(
            conn,
            EntityType::Inventory,
            store_id,
            &line.product_id,
            &fields,
            client_ref,
            OfflineStatus::Pending,
        )?;
    }
    Ok(())
}

fn apply_transfer(conn: &Connection, t: &TransferPayload, client_ref: &str) -> StoreResult<()> {
    let source = require_row(conn, EntityType::Inventory, &t.from_store_id, &t.product_id)?;
    let available = source.i64_field("available_qty");
    if available < t.quantity {
        return Err(invalid(format!(
            "insufficient stock for transfer: {available} available, {} requested",
            t.quantity
        )));
    }
    patch_row(
        conn,
        EntityType::Inventory,
        &t.from_store_id,
        &t.product_id,
        &json!({ "available_qty": available - t.quantity }),
        client_ref,
        OfflineStatus::Pending,
    )?;

    let transfer = StockTransfer {
        product_id: t.product_id.clone(),
        from_store_id: t.from_store_id.clone(),
        to_store_id: t.to_store_id.clone(),
        quantity: t.quantity,
        status: TransferStatus::Pending,
        source_deducted: false,
        local_deduction_applied: true,
        error: None,
        requested_at: Some(now_iso()),
    };
    insert_local(
        conn,
        EntityType::StockTransfer,
        &t.from_store_id,
        &t.transfer_id,
        serde_json::to_value(&transfer)?,
        client_ref,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EntityCache;
    use crate::inventory::{InventoryCache, InventoryPosition};
    use crate::models::CachedEntity;
    use crate::products::{Product, ProductCache};
    use crate::queue::{OperationQueue, QueueStatus};
    use crate::sales::SaleLine;
    use crate::transfers::TransferCache;
    use std::sync::Arc;

    fn seeded() -> Arc<DbState> {
        let db = Arc::new(DbState::in_memory().unwrap());
        ProductCache::new(Arc::clone(&db))
            .upsert_many(&[CachedEntity::synced("p1", "store-a", Product::named("Cable", "CBL", 3.0))], "store-a")
            .unwrap();
        InventoryCache::new(Arc::clone(&db))
            .upsert_many(
                &[CachedEntity::synced("inv-1", "store-a", InventoryPosition::new("p1", 10))],
                "store-a",
            )
            .unwrap();
        db
    }

    #[test]
    fn test_restock_patches_cache_and_queues_once() {
        let db = seeded();
        let inventory = InventoryCache::new(Arc::clone(&db));
        let queue = OperationQueue::new(Arc::clone(&db));

        let mutation = Mutation::restock("store-a", "p1", 5);
        let first = apply_local(&db, &mutation).unwrap();
        let second = apply_local(&db, &mutation).unwrap();

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.queue_id, second.queue_id);

        let position = inventory.for_product("store-a", "p1").unwrap().unwrap();
        assert_eq!(position.data.available_qty, 15);
        assert_eq!(position.offline_status, OfflineStatus::Pending);
        assert_eq!(position.client_ref.as_deref(), Some(mutation.client_ref.as_str()));
        assert_eq!(queue.list("store-a", Some(QueueStatus::Pending)).unwrap().len(), 1);
    }

    #[test]
    fn test_create_product_is_visible_before_sync() {
        let db = seeded();
        let products = ProductCache::new(Arc::clone(&db));

        let result = apply_local(&db, &Mutation::create_product("store-a", Product::named("Case", "CSE", 9.0))).unwrap();
        assert!(result.entity_id().starts_with("offline-"));

        let cached = products.get_by_id("store-a", result.entity_id()).unwrap().unwrap();
        assert_eq!(cached.data.name, "Case");
        assert_eq!(cached.id, None);
        assert_eq!(cached.offline_id.as_deref(), Some(result.entity_id()));
        assert_eq!(cached.offline_status, OfflineStatus::Pending);
    }

    #[test]
    fn test_edit_of_synced_product_is_pending_update() {
        let db = seeded();
        let products = ProductCache::new(Arc::clone(&db));

        let op = Operation::UpdateProduct(ProductPayload {
            product_id: "p1".into(),
            product: Product::named("Cable 2m", "CBL", 4.5),
        });
        apply_local(&db, &Mutation::new("store-a", op)).unwrap();

        let cached = products.get_by_id("store-a", "p1").unwrap().unwrap();
        assert_eq!(cached.data.name, "Cable 2m");
        assert_eq!(cached.offline_status, OfflineStatus::PendingUpdate);
    }

    #[test]
    fn test_failed_validation_leaves_nothing_behind() {
        let db = seeded();
        let queue = OperationQueue::new(Arc::clone(&db));

        let err = apply_local(&db, &Mutation::transfer("p1", "store-a", "store-b", 11)).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        let err = apply_local(&db, &Mutation::adjust("store-a", "p1", -11, "damaged")).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        let err = apply_local(&db, &Mutation::restock("store-a", "p1", 0)).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));

        assert_eq!(queue.pending_count("store-a").unwrap(), 0);
        assert_eq!(InventoryCache::new(db).available_qty("store-a", "p1").unwrap(), 10);
    }

    #[test]
    fn test_transfer_deducts_source_and_records_pending_transfer() {
        let db = seeded();
        let result = apply_local(&db, &Mutation::transfer("p1", "store-a", "store-b", 3)).unwrap();

        assert_eq!(InventoryCache::new(Arc::clone(&db)).available_qty("store-a", "p1").unwrap(), 7);
        let transfer = TransferCache::new(Arc::clone(&db))
            .get_by_id("store-a", result.entity_id())
            .unwrap()
            .unwrap();
        assert_eq!(transfer.data.status, TransferStatus::Pending);
        assert!(transfer.data.local_deduction_applied);
        assert!(!transfer.data.source_deducted);
    }

    #[test]
    fn test_sale_decrements_tracked_lines_only() {
        let db = seeded();
        let sale = Sale {
            customer_id: None,
            lines: vec![
                SaleLine { product_id: "p1".into(), quantity: 2, unit_price: 3.0 },
                SaleLine { product_id: "gift-card".into(), quantity: 1, unit_price: 20.0 },
            ],
            total: 26.0,
            payment_method: "card".into(),
            sold_at: now_iso(),
        };
        let result = apply_local(&db, &Mutation::record_sale("store-a", sale)).unwrap();

        let position = InventoryCache::new(Arc::clone(&db)).for_product("store-a", "p1").unwrap().unwrap();
        assert_eq!(position.data.available_qty, 8);
        assert_eq!(position.data.quantity_sold, 2);
        assert!(InventoryCache::new(Arc::clone(&db)).for_product("store-a", "gift-card").unwrap().is_none());

        let sales: EntityCache<Sale> = EntityCache::new(db);
        assert!(sales.get_by_id("store-a", result.entity_id()).unwrap().is_some());
    }

    #[test]
    fn test_imei_add_rejects_duplicates() {
        let db = seeded();
        let add = |imei: &str| {
            Mutation::new(
                "store-a",
                Operation::AddImei(ImeiPayload {
                    product_id: "p1".into(),
                    imei: imei.into(),
                }),
            )
        };
        apply_local(&db, &add("356938035643809")).unwrap();
        assert!(matches!(
            apply_local(&db, &add("356938035643809")),
            Err(StoreError::Invalid(_))
        ));

        let product = ProductCache::new(db).get_by_id("store-a", "p1").unwrap().unwrap();
        assert_eq!(product.data.imeis, vec!["356938035643809".to_string()]);
    }
}
