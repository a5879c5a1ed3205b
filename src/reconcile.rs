//! Reconciliation of a remote outcome with the optimistic local state.
//!
//! `reconcile` is pure: it maps (local action, remote outcome) to the cache
//! writes and the queue transition the engine then commits in one
//! transaction via `apply_writes`.

use rusqlite::Connection;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::cache::{merge_fields, read_row, rekey_row, rows_by_field_any_store, write_row, CacheRow};
use crate::error::{RemoteError, StoreResult};
use crate::models::{EntityType, OfflineStatus};
use crate::mutations::LocalResult;
use crate::queue::Operation;
use crate::remote::record_id;
use crate::replay::{CommitFailure, CommitStage, InventoryTouch, RemoteOutcome, RemoteResult};

/// One change to the entity cache.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheWrite {
    /// Record the remote id and, while the row still carries this action's
    /// `client_ref` (no newer local change on top), take the remote data and
    /// mark it synced. A missing row is inserted only with `upsert` and
    /// `data`; otherwise it was deleted locally and stays gone.
    Confirm {
        entity: EntityType,
        store_id: String,
        key: String,
        remote_id: Option<String>,
        data: Option<Value>,
        client_ref: String,
        upsert: bool,
    },
    /// Move a row created offline to its remote id.
    Rekey {
        entity: EntityType,
        store_id: String,
        from: String,
        to: String,
    },
    /// Rewrite inventory positions keyed by an offline product id.
    RepointProduct { from: String, to: String },
    /// Set the row status, only while it still carries `client_ref`.
    SetStatus {
        entity: EntityType,
        store_id: String,
        key: String,
        status: OfflineStatus,
        client_ref: String,
    },
    /// Merge fields without touching status.
    Patch {
        entity: EntityType,
        store_id: String,
        key: String,
        fields: Value,
    },
    /// Take back an optimistic stock change the remote refused. Applies only
    /// while the position still carries `client_ref`; the position is then
    /// left synced so the next pull overwrites it with remote truth.
    RevertStock {
        store_id: String,
        product_id: String,
        available_delta: i64,
        sold_delta: i64,
        client_ref: String,
    },
    /// Reverse the optimistic source deduction of a transfer, at most once.
    CompensateTransfer {
        store_id: String,
        transfer_key: String,
        product_id: String,
        quantity: i64,
        client_ref: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueTransition {
    Synced,
    Failed {
        error: String,
        /// Eligible for automatic retry after backoff.
        retryable: bool,
        /// Surface the message to the user.
        notify: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub writes: Vec<CacheWrite>,
    pub transition: QueueTransition,
}

/// Decide the cache writes and queue transition for one replayed action.
pub fn reconcile(local: &LocalResult, outcome: &RemoteOutcome) -> Reconciliation {
    match outcome {
        RemoteOutcome::Committed(result) => Reconciliation {
            writes: confirm_writes(local, result),
            transition: QueueTransition::Synced,
        },
        RemoteOutcome::Failed(failure) => failure_reconciliation(local, failure),
    }
}

/// Remote row with transport-only fields removed.
fn remote_fields(record: &Value) -> Value {
    let mut map = match record {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    for key in ["id", "client_ref", "store_id", "created_at", "updated_at"] {
        map.remove(key);
    }
    Value::Object(map)
}

fn inventory_fields(touch: &InventoryTouch) -> Value {
    let mut fields = json!({
        "product_id": touch.product_key,
        "available_qty": touch.row.get("available_qty").cloned().unwrap_or(json!(0)),
        "quantity_sold": touch.row.get("quantity_sold").cloned().unwrap_or(json!(0)),
    });
    if let Some(level) = touch.row.get("reorder_level").filter(|v| !v.is_null()) {
        fields["reorder_level"] = level.clone();
    }
    fields
}

fn confirm_inventory(local: &LocalResult, touches: &[InventoryTouch]) -> Vec<CacheWrite> {
    touches
        .iter()
        .map(|touch| CacheWrite::Confirm {
            entity: EntityType::Inventory,
            store_id: touch.store_id.clone(),
            key: touch.product_key.clone(),
            remote_id: record_id(&touch.row),
            data: Some(inventory_fields(touch)),
            client_ref: local.client_ref.clone(),
            upsert: true,
        })
        .collect()
}

/// Rekey a record created offline to its remote id and confirm it.
fn confirm_created(local: &LocalResult, entity: EntityType, offline_id: &str, record: Option<&Value>) -> Vec<CacheWrite> {
    let store_id = local.store_id.clone();
    let remote_id = record.and_then(record_id);
    let mut writes = Vec::new();
    let key = match &remote_id {
        Some(remote_id) if remote_id != offline_id => {
            writes.push(CacheWrite::Rekey {
                entity,
                store_id: store_id.clone(),
                from: offline_id.to_string(),
                to: remote_id.clone(),
            });
            if entity == EntityType::Product {
                writes.push(CacheWrite::RepointProduct {
                    from: offline_id.to_string(),
                    to: remote_id.clone(),
                });
            }
            remote_id.clone()
        }
        _ => offline_id.to_string(),
    };
    writes.push(CacheWrite::Confirm {
        entity,
        store_id,
        key,
        remote_id,
        data: record.map(remote_fields),
        client_ref: local.client_ref.clone(),
        upsert: false,
    });
    writes
}

fn confirm_existing(local: &LocalResult, entity: EntityType, key: &str, record: Option<&Value>) -> Vec<CacheWrite> {
    vec![CacheWrite::Confirm {
        entity,
        store_id: local.store_id.clone(),
        key: key.to_string(),
        remote_id: record.and_then(record_id),
        data: record.map(remote_fields),
        client_ref: local.client_ref.clone(),
        upsert: false,
    }]
}

fn confirm_writes(local: &LocalResult, result: &RemoteResult) -> Vec<CacheWrite> {
    let record = result.record.as_ref();
    match &local.operation {
        Operation::CreateProduct(p) => confirm_created(local, EntityType::Product, &p.product_id, record),
        Operation::UpdateProduct(p) => confirm_existing(local, EntityType::Product, &p.product_id, record),
        Operation::CreateCustomer(c) => confirm_created(local, EntityType::Customer, &c.customer_id, record),
        Operation::UpdateCustomer(c) => confirm_existing(local, EntityType::Customer, &c.customer_id, record),
        // Rows were removed locally when the delete was queued.
        Operation::DeleteProduct(_) | Operation::DeleteCustomer(_) => Vec::new(),
        // The IMEI list lives on the product row; only its status changes.
        Operation::AddImei(i) | Operation::RemoveImei(i) => {
            confirm_existing(local, EntityType::Product, &i.product_id, None)
        }
        Operation::Restock(_) => confirm_inventory(local, &result.inventory),
        Operation::Adjust(a) => {
            let mut writes = confirm_inventory(local, &result.inventory);
            writes.extend(confirm_created(local, EntityType::AdjustmentLog, &a.adjustment_id, record));
            writes
        }
        Operation::RecordSale(s) => {
            let mut writes = confirm_created(local, EntityType::Sale, &s.sale_id, record);
            writes.extend(confirm_inventory(local, &result.inventory));
            writes
        }
        Operation::Transfer(t) => {
            let approved = record.map(|r| {
                let mut r = r.clone();
                if let Value::Object(map) = &mut r {
                    // The remote row knows nothing of the local bookkeeping flags.
                    map.insert("source_deducted".into(), Value::Bool(true));
                    map.insert("local_deduction_applied".into(), Value::Bool(false));
                    map.insert("status".into(), json!("APPROVED"));
                    map.insert("error".into(), Value::Null);
                }
                r
            });
            let mut writes = confirm_created(local, EntityType::StockTransfer, &t.transfer_id, approved.as_ref());
            writes.extend(confirm_inventory(local, &result.inventory));
            writes
        }
    }
}

/// Primary cached row an operation flagged locally, if any.
fn primary_row(operation: &Operation) -> Option<(EntityType, &str)> {
    match operation {
        Operation::CreateProduct(p) | Operation::UpdateProduct(p) => Some((EntityType::Product, p.product_id.as_str())),
        Operation::AddImei(i) | Operation::RemoveImei(i) => Some((EntityType::Product, i.product_id.as_str())),
        Operation::Adjust(a) => Some((EntityType::AdjustmentLog, a.adjustment_id.as_str())),
        Operation::RecordSale(s) => Some((EntityType::Sale, s.sale_id.as_str())),
        Operation::Transfer(t) => Some((EntityType::StockTransfer, t.transfer_id.as_str())),
        Operation::CreateCustomer(c) | Operation::UpdateCustomer(c) => Some((EntityType::Customer, c.customer_id.as_str())),
        Operation::Restock(_) | Operation::DeleteProduct(_) | Operation::DeleteCustomer(_) => None,
    }
}

/// Optimistic stock changes to take back when `operation` is refused.
fn stock_reverts(local: &LocalResult, partial: &RemoteResult) -> Vec<CacheWrite> {
    let revert = |product_id: &str, available_delta: i64, sold_delta: i64| CacheWrite::RevertStock {
        store_id: local.store_id.clone(),
        product_id: product_id.to_string(),
        available_delta,
        sold_delta,
        client_ref: local.client_ref.clone(),
    };
    match &local.operation {
        Operation::Restock(r) => vec![revert(&r.product_id, r.quantity, 0)],
        Operation::Adjust(a) if partial.inventory.is_empty() => vec![revert(&a.product_id, a.delta, 0)],
        // Lines are only booked after the sale itself is stored.
        Operation::RecordSale(s) if partial.record.is_none() => s
            .sale
            .lines
            .iter()
            .map(|line| revert(&line.product_id, -line.quantity, line.quantity))
            .collect(),
        _ => Vec::new(),
    }
}

fn failure_message(error: &RemoteError) -> String {
    if error.is_transient() {
        format!("{error} (will retry when online)")
    } else {
        error.to_string()
    }
}

fn failure_reconciliation(local: &LocalResult, failure: &CommitFailure) -> Reconciliation {
    let error = &failure.error;
    let retryable = !error.is_validation();
    let mut writes = Vec::new();

    if let Operation::Transfer(t) = &local.operation {
        let transfer_key = t.transfer_id.clone();
        if failure.partial.source_deducted || failure.stage == CommitStage::Destination {
            // The source deduction stands; retries resume at the destination.
            writes.push(CacheWrite::Patch {
                entity: EntityType::StockTransfer,
                store_id: local.store_id.clone(),
                key: transfer_key,
                fields: json!({ "source_deducted": true, "error": error.to_string() }),
            });
        } else if failure.stage == CommitStage::SourceDeduction && error.is_validation() {
            writes.push(CacheWrite::CompensateTransfer {
                store_id: local.store_id.clone(),
                transfer_key: transfer_key.clone(),
                product_id: t.product_id.clone(),
                quantity: t.quantity,
                client_ref: local.client_ref.clone(),
            });
            writes.push(CacheWrite::Patch {
                entity: EntityType::StockTransfer,
                store_id: local.store_id.clone(),
                key: transfer_key,
                fields: json!({ "status": "FAILED", "error": error.to_string() }),
            });
        }
    }

    if error.is_validation() {
        writes.extend(stock_reverts(local, &failure.partial));
        if let Some((entity, key)) = primary_row(&local.operation) {
            writes.push(CacheWrite::SetStatus {
                entity,
                store_id: local.store_id.clone(),
                key: key.to_string(),
                status: OfflineStatus::Failed,
                client_ref: local.client_ref.clone(),
            });
        }
    }

    Reconciliation {
        writes,
        transition: QueueTransition::Failed {
            error: failure_message(error),
            retryable,
            notify: !retryable,
        },
    }
}

// ---------------------------------------------------------------------------
// Applying writes
// ---------------------------------------------------------------------------

/// Apply reconciliation writes in order. Meant to run inside the same
/// transaction as the queue transition.
pub fn apply_writes(conn: &Connection, writes: &[CacheWrite]) -> StoreResult<()> {
    for write in writes {
        apply_write(conn, write)?;
    }
    Ok(())
}

fn carries_ref(row: &CacheRow, client_ref: &str) -> bool {
    row.client_ref.as_deref().map_or(true, |r| r == client_ref)
}

fn apply_write(conn: &Connection, write: &CacheWrite) -> StoreResult<()> {
    match write {
        CacheWrite::Confirm {
            entity,
            store_id,
            key,
            remote_id,
            data,
            client_ref,
            upsert,
        } => match read_row(conn, *entity, store_id, key)? {
            Some(mut row) => {
                if remote_id.is_some() {
                    row.remote_id = remote_id.clone();
                }
                if carries_ref(&row, client_ref) {
                    if let Some(data) = data {
                        merge_fields(&mut row.data, data)?;
                    }
                    row.offline_status = OfflineStatus::Synced;
                    row.client_ref = None;
                } else {
                    debug!(entity = %entity, store_id, key, "Newer local change pending, confirm keeps local data");
                }
                write_row(conn, &row)?;
            }
            None => match data {
                Some(data) if *upsert => {
                    let mut row = CacheRow::new(*entity, store_id, key, data.clone(), OfflineStatus::Synced);
                    row.remote_id = remote_id.clone();
                    write_row(conn, &row)?;
                }
                _ => debug!(entity = %entity, store_id, key, "Confirmed row no longer cached"),
            },
        },
        CacheWrite::Rekey {
            entity,
            store_id,
            from,
            to,
        } => {
            rekey_row(conn, *entity, store_id, from, to)?;
        }
        CacheWrite::RepointProduct { from, to } => {
            for mut row in rows_by_field_any_store(conn, EntityType::Inventory, "product_id", from)? {
                let old_key = row.cache_key.clone();
                merge_fields(&mut row.data, &json!({ "product_id": to }))?;
                if row.offline_id.is_none() {
                    // Keeps the row reachable under the offline id queued items use.
                    row.offline_id = Some(old_key.clone());
                }
                write_row(conn, &row)?;
                rekey_row(conn, EntityType::Inventory, &row.store_id, &old_key, to)?;
            }
        }
        CacheWrite::SetStatus {
            entity,
            store_id,
            key,
            status,
            client_ref,
        } => {
            if let Some(mut row) = read_row(conn, *entity, store_id, key)? {
                if carries_ref(&row, client_ref) {
                    row.offline_status = *status;
                    write_row(conn, &row)?;
                }
            }
        }
        CacheWrite::Patch {
            entity,
            store_id,
            key,
            fields,
        } => {
            if let Some(mut row) = read_row(conn, *entity, store_id, key)? {
                merge_fields(&mut row.data, fields)?;
                write_row(conn, &row)?;
            }
        }
        CacheWrite::RevertStock {
            store_id,
            product_id,
            available_delta,
            sold_delta,
            client_ref,
        } => {
            let Some(mut position) = read_row(conn, EntityType::Inventory, store_id, product_id)? else {
                return Ok(());
            };
            if position.client_ref.as_deref() != Some(client_ref.as_str()) {
                debug!(store_id, product_id, "Position moved on since the refused change, left to its confirm");
                return Ok(());
            }
            let fields = json!({
                "available_qty": position.i64_field("available_qty") - available_delta,
                "quantity_sold": position.i64_field("quantity_sold") - sold_delta,
            });
            merge_fields(&mut position.data, &fields)?;
            position.offline_status = OfflineStatus::Synced;
            position.client_ref = None;
            write_row(conn, &position)?;
            debug!(store_id, product_id, available_delta, "Reverted refused stock change");
        }
        CacheWrite::CompensateTransfer {
            store_id,
            transfer_key,
            product_id,
            quantity,
            client_ref,
        } => {
            let Some(mut transfer) = read_row(conn, EntityType::StockTransfer, store_id, transfer_key)? else {
                return Ok(());
            };
            let applied = transfer
                .data
                .get("local_deduction_applied")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !applied {
                return Ok(());
            }
            if let Some(mut position) = read_row(conn, EntityType::Inventory, store_id, product_id)? {
                let restored = position.i64_field("available_qty") + quantity;
                merge_fields(&mut position.data, &json!({ "available_qty": restored }))?;
                if position.client_ref.as_deref() == Some(client_ref.as_str()) {
                    position.offline_status = OfflineStatus::Synced;
                    position.client_ref = None;
                }
                write_row(conn, &position)?;
            }
            merge_fields(&mut transfer.data, &json!({ "local_deduction_applied": false }))?;
            write_row(conn, &transfer)?;
            debug!(store_id, transfer = %transfer_key, quantity, "Reversed local transfer deduction");
        }
    }
    Ok(())
}
