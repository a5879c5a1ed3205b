//! Remote half of a queued operation.
//!
//! `commit_remote` turns one queue item into calls against the remote store.
//! Multi-step operations tag each step with a derived idempotency token
//! (`{client_ref}:{step}`), so a retry after a partial failure replays the
//! completed steps as no-ops on the remote and only performs the rest.
//! Inserts dedupe on `client_ref`; stock changes go through the
//! `stock_movements` ledger because a PATCH carries no such guarantee.

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::cache::{read_row, resolve_remote_id};
use crate::db::DbState;
use crate::error::{RemoteError, StoreError, StoreResult};
use crate::models::EntityType;
use crate::queue::{
    has_unsynced_create, AdjustPayload, DeletePayload, ImeiPayload, Operation, QueueItem, RestockPayload,
    SalePayload, TransferPayload,
};
use crate::remote::{
    i64_field, record_id, RecordKey, RemoteStore, CUSTOMERS, INVENTORY, INVENTORY_ADJUSTMENTS, PRODUCTS,
    PRODUCT_IMEIS, SALES, STOCK_MOVEMENTS, STOCK_TRANSFERS,
};

/// Where in a multi-step operation the remote call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStage {
    /// A referenced record has no remote id yet.
    Resolve,
    /// The operation's main write.
    Apply,
    SourceDeduction,
    Destination,
    Log,
}

/// Inventory row as left on the remote by an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct InventoryTouch {
    pub store_id: String,
    /// Cache key of the position in `store_id` (the product's remote id).
    pub product_key: String,
    pub row: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteResult {
    /// Canonical remote record of the operation's primary entity.
    pub record: Option<Value>,
    pub inventory: Vec<InventoryTouch>,
    /// Transfers only: the source deduction is applied remotely.
    pub source_deducted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitFailure {
    pub error: RemoteError,
    pub stage: CommitStage,
    /// Steps that did complete before the failure.
    pub partial: RemoteResult,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    Committed(RemoteResult),
    Failed(CommitFailure),
}

impl RemoteOutcome {
    pub fn error(&self) -> Option<&RemoteError> {
        match self {
            RemoteOutcome::Committed(_) => None,
            RemoteOutcome::Failed(f) => Some(&f.error),
        }
    }
}

enum Halt {
    Store(StoreError),
    Remote { stage: CommitStage, error: RemoteError },
}

impl From<StoreError> for Halt {
    fn from(err: StoreError) -> Self {
        Halt::Store(err)
    }
}

impl From<serde_json::Error> for Halt {
    fn from(err: serde_json::Error) -> Self {
        Halt::Store(err.into())
    }
}

trait AtStage<T> {
    fn at(self, stage: CommitStage) -> Result<T, Halt>;
}

impl<T> AtStage<T> for Result<T, RemoteError> {
    fn at(self, stage: CommitStage) -> Result<T, Halt> {
        self.map_err(|error| Halt::Remote { stage, error })
    }
}

fn missing(what: &str) -> RemoteError {
    RemoteError::Rejected {
        status: 404,
        message: format!("{what} no longer exists remotely"),
    }
}

/// Apply one queue item to the remote store.
///
/// Local store failures are returned as `Err`; remote failures are part of
/// the outcome.
pub async fn commit_remote(remote: &dyn RemoteStore, db: &DbState, item: &QueueItem) -> StoreResult<RemoteOutcome> {
    let mut replay = Replay {
        remote,
        db,
        store_id: &item.store_id,
        client_ref: &item.client_ref,
        result: RemoteResult::default(),
    };

    let run = replay.run(&item.operation).await;
    match run {
        Ok(()) => {
            debug!(queue_id = item.queue_id, client_ref = %item.client_ref, "Remote commit succeeded");
            Ok(RemoteOutcome::Committed(replay.result))
        }
        Err(Halt::Store(err)) => Err(err),
        Err(Halt::Remote { stage, error }) => {
            warn!(
                queue_id = item.queue_id,
                client_ref = %item.client_ref,
                stage = ?stage,
                error = %error,
                "Remote commit failed"
            );
            Ok(RemoteOutcome::Failed(CommitFailure {
                error,
                stage,
                partial: replay.result,
            }))
        }
    }
}

struct Replay<'a> {
    remote: &'a dyn RemoteStore,
    db: &'a DbState,
    store_id: &'a str,
    client_ref: &'a str,
    result: RemoteResult,
}

impl Replay<'_> {
    fn step_ref(&self, step: &str) -> String {
        format!("{}:{step}", self.client_ref)
    }

    /// Remote id for a locally referenced record.
    fn resolve(&self, entity: EntityType, store_id: &str, id: &str) -> Result<String, Halt> {
        let resolved = self
            .db
            .read(|conn| resolve_remote_id(conn, entity, store_id, id))?;
        resolved.ok_or_else(|| Halt::Remote {
            stage: CommitStage::Resolve,
            error: RemoteError::Unresolved(format!("{entity} {id} has not synced yet")),
        })
    }

    async fn run(&mut self, operation: &Operation) -> Result<(), Halt> {
        match operation {
            Operation::CreateProduct(p) => {
                let record = with_store(serde_json::to_value(&p.product)?, self.store_id, &["imeis"]);
                self.create(PRODUCTS, record).await
            }
            Operation::UpdateProduct(p) => {
                let id = self.resolve(EntityType::Product, self.store_id, &p.product_id)?;
                let fields = with_store(serde_json::to_value(&p.product)?, self.store_id, &["imeis"]);
                self.update(PRODUCTS, &id, fields, "product").await
            }
            Operation::DeleteProduct(d) => self.delete(EntityType::Product, PRODUCTS, d).await,
            Operation::AddImei(i) => self.add_imei(i).await,
            Operation::RemoveImei(i) => self.remove_imei(i).await,
            Operation::Restock(r) => self.restock(r).await,
            Operation::Adjust(a) => self.adjust(a).await,
            Operation::RecordSale(s) => self.sale(s).await,
            Operation::Transfer(t) => self.transfer(t).await,
            Operation::CreateCustomer(c) => {
                let record = with_store(serde_json::to_value(&c.customer)?, self.store_id, &[]);
                self.create(CUSTOMERS, record).await
            }
            Operation::UpdateCustomer(c) => {
                let id = self.resolve(EntityType::Customer, self.store_id, &c.customer_id)?;
                let fields = with_store(serde_json::to_value(&c.customer)?, self.store_id, &[]);
                self.update(CUSTOMERS, &id, fields, "customer").await
            }
            Operation::DeleteCustomer(d) => self.delete(EntityType::Customer, CUSTOMERS, d).await,
        }
    }

    async fn create(&mut self, table: &str, record: Value) -> Result<(), Halt> {
        let stored = self
            .remote
            .insert(table, record, Some(self.client_ref))
            .await
            .at(CommitStage::Apply)?;
        self.result.record = Some(stored);
        Ok(())
    }

    async fn update(&mut self, table: &str, id: &str, fields: Value, what: &str) -> Result<(), Halt> {
        let stored = self
            .remote
            .update(table, &RecordKey::id(id), fields, Some(self.client_ref))
            .await
            .at(CommitStage::Apply)?
            .ok_or_else(|| missing(&format!("{what} {id}")))
            .at(CommitStage::Apply)?;
        self.result.record = Some(stored);
        Ok(())
    }

    /// Deleting a record that is already gone counts as success.
    async fn delete(&mut self, entity: EntityType, table: &str, d: &DeletePayload) -> Result<(), Halt> {
        let remote_id = match self.resolve(entity, self.store_id, &d.id) {
            Ok(remote_id) => remote_id,
            Err(Halt::Store(err)) => return Err(Halt::Store(err)),
            Err(unresolved) => match self.created_remote_id(table, d).await? {
                Some(remote_id) => remote_id,
                None => return self.wait_for_create(&d.id, unresolved),
            },
        };
        let deleted = self
            .remote
            .delete(table, &RecordKey::id(&remote_id), Some(self.client_ref))
            .await
            .at(CommitStage::Apply)?;
        if !deleted {
            debug!(table, id = %remote_id, "Delete target already absent remotely");
        }
        Ok(())
    }

    /// Remote id of a record created offline whose local row is already
    /// gone, found through the create's `client_ref`.
    async fn created_remote_id(&self, table: &str, d: &DeletePayload) -> Result<Option<String>, Halt> {
        let Some(created_ref) = &d.created_ref else {
            return Ok(None);
        };
        let key = RecordKey::new().eq("store_id", self.store_id).eq("client_ref", created_ref);
        let found = self.remote.select(table, &key).await.at(CommitStage::Resolve)?;
        Ok(found.as_ref().and_then(record_id))
    }

    /// While the create is still queued the delete must wait for it;
    /// otherwise the record never reached the remote.
    fn wait_for_create(&self, id: &str, unresolved: Halt) -> Result<(), Halt> {
        let pending = self
            .db
            .read(|conn| has_unsynced_create(conn, self.store_id, id))?;
        if pending {
            return Err(unresolved);
        }
        debug!(id, "Deleted record never reached the remote");
        Ok(())
    }

    async fn add_imei(&mut self, i: &ImeiPayload) -> Result<(), Halt> {
        let product_id = self.resolve(EntityType::Product, self.store_id, &i.product_id)?;
        let stored = self
            .remote
            .insert(
                PRODUCT_IMEIS,
                json!({ "store_id": self.store_id, "product_id": product_id, "imei": i.imei }),
                Some(self.client_ref),
            )
            .await
            .at(CommitStage::Apply)?;
        self.result.record = Some(stored);
        Ok(())
    }

    async fn remove_imei(&mut self, i: &ImeiPayload) -> Result<(), Halt> {
        let product_id = self.resolve(EntityType::Product, self.store_id, &i.product_id)?;
        let key = RecordKey::new()
            .eq("store_id", self.store_id)
            .eq("product_id", &product_id)
            .eq("imei", &i.imei);
        self.remote
            .delete(PRODUCT_IMEIS, &key, Some(self.client_ref))
            .await
            .at(CommitStage::Apply)?;
        Ok(())
    }

    async fn select_inventory(&self, store_id: &str, product_id: &str, stage: CommitStage) -> Result<Option<Value>, Halt> {
        let key = RecordKey::new().eq("store_id", store_id).eq("product_id", product_id);
        self.remote.select(INVENTORY, &key).await.at(stage)
    }

    /// Apply one stock movement exactly once.
    ///
    /// The movement is first recorded in the ledger under its step ref. The
    /// position is then patched conditionally on the quantity and the last
    /// movement ref it was read with, and stamped with this step's ref. A
    /// writer that finds another movement's ref on the row marks that
    /// movement applied before overwriting it, so a retry can always tell
    /// whether its own earlier attempt landed.
    ///
    /// Returns the stored position and the quantity it held before, or
    /// `None` when the position does not exist and `create` is off.
    async fn apply_movement(&self, m: &Movement<'_>) -> Result<Option<(Value, i64)>, Halt> {
        let stage = m.stage;
        let recorded = self.movement(m.step_ref, stage).await?;
        if let Some(done) = self.already_applied(m, recorded.as_ref()).await? {
            return Ok(Some(done));
        }

        let mut current = self.select_inventory(m.store_id, m.product_id, stage).await?;
        if recorded.is_none() {
            if current.is_none() && !m.create {
                return Ok(None);
            }
            let movement = json!({
                "store_id": m.store_id,
                "product_id": m.product_id,
                "delta": m.delta,
                "quantity_sold": m.sold,
                "applied": false,
            });
            self.remote
                .insert(STOCK_MOVEMENTS, movement, Some(m.step_ref))
                .await
                .at(stage)?;
        }

        for _ in 0..MAX_STOCK_CONFLICTS {
            match self.try_movement(m, current.take(), recorded.is_some()).await? {
                Attempt::Applied(row, previous) => {
                    self.mark_applied(m.step_ref, previous, Some(m.step_ref), stage).await?;
                    return Ok(Some((row, previous)));
                }
                Attempt::Landed(row, previous) => return Ok(Some((row, previous))),
                Attempt::Conflict => {
                    debug!(step_ref = m.step_ref, product_id = m.product_id, "Inventory changed underneath, re-reading");
                    current = self.select_inventory(m.store_id, m.product_id, stage).await?;
                }
            }
        }
        Err(RemoteError::Server {
            status: 409,
            message: format!("inventory of {} kept changing during the update", m.product_id),
        })
        .at(stage)
    }

    async fn movement(&self, step_ref: &str, stage: CommitStage) -> Result<Option<Value>, Halt> {
        let key = RecordKey::new().eq("client_ref", step_ref);
        self.remote.select(STOCK_MOVEMENTS, &key).await.at(stage)
    }

    /// Position and previous quantity of a movement the ledger already
    /// marks applied.
    async fn already_applied(&self, m: &Movement<'_>, recorded: Option<&Value>) -> Result<Option<(Value, i64)>, Halt> {
        let Some(movement) = recorded.filter(|mv| is_applied(mv)) else {
            return Ok(None);
        };
        debug!(step_ref = m.step_ref, "Stock movement already applied");
        let row = self
            .select_inventory(m.store_id, m.product_id, m.stage)
            .await?
            .ok_or_else(|| missing(&format!("inventory of {}", m.product_id)))
            .at(m.stage)?;
        Ok(Some((row, i64_field(movement, "previous_qty"))))
    }

    async fn try_movement(&self, m: &Movement<'_>, current: Option<Value>, resumed: bool) -> Result<Attempt, Halt> {
        let stage = m.stage;
        let Some(row) = current else {
            if !m.create {
                return Err(RemoteError::Rejected {
                    status: 422,
                    message: format!("no stock of {} at {}", m.product_id, m.store_id),
                })
                .at(stage);
            }
            let record = json!({
                "store_id": m.store_id,
                "product_id": m.product_id,
                "available_qty": m.delta,
                "quantity_sold": m.sold,
                "last_movement_ref": m.step_ref,
            });
            return match self.remote.insert(INVENTORY, record, Some(m.step_ref)).await {
                Ok(row) => Ok(Attempt::Applied(row, 0)),
                // Another writer opened the position first.
                Err(RemoteError::Rejected { status: 409, .. }) => Ok(Attempt::Conflict),
                Err(error) => Err(Halt::Remote { stage, error }),
            };
        };

        let previous = i64_field(&row, "available_qty");
        let last = row.get("last_movement_ref").and_then(Value::as_str);
        if last == Some(m.step_ref) {
            return Ok(Attempt::Applied(row.clone(), previous - m.delta));
        }
        if resumed {
            // Whoever overwrote our ref marked our movement first.
            let own = self.movement(m.step_ref, stage).await?;
            if let Some((row, previous)) = self.already_applied(m, own.as_ref()).await? {
                return Ok(Attempt::Landed(row, previous));
            }
        }
        if let Some(other) = last {
            self.settle(other, previous, stage).await?;
        }
        if let Some(needed) = m.needs {
            if previous < needed {
                return Err(RemoteError::Rejected {
                    status: 422,
                    message: format!(
                        "insufficient stock at {}: {previous} available, {needed} requested",
                        m.store_id
                    ),
                })
                .at(stage);
            }
        }

        let id = record_id(&row)
            .ok_or_else(|| RemoteError::InvalidResponse("inventory row without id".into()))
            .at(stage)?;
        let guard = RecordKey::id(&id)
            .eq("available_qty", &previous.to_string())
            .eq_or_null("last_movement_ref", last);
        let fields = json!({
            "available_qty": previous + m.delta,
            "quantity_sold": i64_field(&row, "quantity_sold") + m.sold,
            "last_movement_ref": m.step_ref,
        });
        let stored = self
            .remote
            .update(INVENTORY, &guard, fields, Some(m.step_ref))
            .await
            .at(stage)?;
        Ok(match stored {
            Some(stored) => Attempt::Applied(stored, previous),
            None => Attempt::Conflict,
        })
    }

    /// Mark the movement stamped on a position applied, if its writer
    /// never got to.
    async fn settle(&self, other_ref: &str, row_qty: i64, stage: CommitStage) -> Result<(), Halt> {
        let Some(movement) = self.movement(other_ref, stage).await? else {
            return Ok(());
        };
        if is_applied(&movement) {
            return Ok(());
        }
        let previous = row_qty - i64_field(&movement, "delta");
        debug!(step_ref = other_ref, "Settling stock movement left unmarked");
        self.mark_applied(other_ref, previous, None, stage).await
    }

    async fn mark_applied(&self, step_ref: &str, previous: i64, token: Option<&str>, stage: CommitStage) -> Result<(), Halt> {
        let key = RecordKey::new().eq("client_ref", step_ref);
        let fields = json!({ "applied": true, "previous_qty": previous });
        self.remote
            .update(STOCK_MOVEMENTS, &key, fields, token)
            .await
            .at(stage)?;
        Ok(())
    }

    fn touch(&mut self, store_id: &str, product_key: &str, row: Value) {
        self.result.inventory.push(InventoryTouch {
            store_id: store_id.to_string(),
            product_key: product_key.to_string(),
            row,
        });
    }

    async fn restock(&mut self, r: &RestockPayload) -> Result<(), Halt> {
        let product_id = self.resolve(EntityType::Product, self.store_id, &r.product_id)?;
        let store_id = self.store_id;
        let movement = Movement::create(store_id, &product_id, r.quantity, self.client_ref, CommitStage::Apply);
        if let Some((row, _)) = self.apply_movement(&movement).await? {
            self.touch(store_id, &product_id, row);
        }
        Ok(())
    }

    async fn adjust(&mut self, a: &AdjustPayload) -> Result<(), Halt> {
        let product_id = self.resolve(EntityType::Product, self.store_id, &a.product_id)?;
        let store_id = self.store_id;
        let movement = Movement::create(store_id, &product_id, a.delta, self.client_ref, CommitStage::Apply);
        let (row, previous) = self
            .apply_movement(&movement)
            .await?
            .ok_or_else(|| missing(&format!("inventory of {product_id}")))
            .at(CommitStage::Apply)?;
        let new_qty = i64_field(&row, "available_qty");
        self.touch(store_id, &product_id, row);

        let log = json!({
            "store_id": store_id,
            "product_id": product_id,
            "delta": a.delta,
            "reason": a.reason,
            "previous_qty": previous,
            "new_qty": new_qty,
        });
        let stored = self
            .remote
            .insert(INVENTORY_ADJUSTMENTS, log, Some(&self.step_ref("log")))
            .await
            .at(CommitStage::Log)?;
        self.result.record = Some(stored);
        Ok(())
    }

    async fn sale(&mut self, s: &SalePayload) -> Result<(), Halt> {
        let customer_id = match &s.sale.customer_id {
            Some(id) => Some(self.resolve(EntityType::Customer, self.store_id, id)?),
            None => None,
        };
        let mut product_ids = Vec::with_capacity(s.sale.lines.len());
        for line in &s.sale.lines {
            product_ids.push(self.resolve(EntityType::Product, self.store_id, &line.product_id)?);
        }
        let lines: Vec<Value> = s
            .sale
            .lines
            .iter()
            .zip(&product_ids)
            .map(|(line, product_id)| {
                json!({
                    "product_id": product_id,
                    "quantity": line.quantity,
                    "unit_price": line.unit_price,
                })
            })
            .collect();

        let record = json!({
            "store_id": self.store_id,
            "customer_id": customer_id,
            "lines": lines,
            "total": s.sale.total,
            "payment_method": s.sale.payment_method,
            "sold_at": s.sale.sold_at,
        });
        let stored = self
            .remote
            .insert(SALES, record, Some(self.client_ref))
            .await
            .at(CommitStage::Apply)?;
        self.result.record = Some(stored);

        let store_id = self.store_id;
        for (n, (line, product_id)) in s.sale.lines.iter().zip(&product_ids).enumerate() {
            let step = self.step_ref(&format!("line:{n}"));
            let movement = Movement {
                sold: line.quantity,
                create: false,
                ..Movement::create(store_id, product_id, -line.quantity, &step, CommitStage::Apply)
            };
            // Products without a tracked position are not decremented.
            if let Some((row, _)) = self.apply_movement(&movement).await? {
                self.touch(store_id, product_id, row);
            }
        }
        Ok(())
    }

    async fn transfer(&mut self, t: &TransferPayload) -> Result<(), Halt> {
        let product_id = self.resolve(EntityType::Product, &t.from_store_id, &t.product_id)?;

        let already_deducted = self
            .db
            .read(|conn| read_row(conn, EntityType::StockTransfer, &t.from_store_id, &t.transfer_id))?
            .and_then(|row| row.data.get("source_deducted").and_then(Value::as_bool))
            .unwrap_or(false);

        if already_deducted {
            debug!(transfer_id = %t.transfer_id, "Source already deducted, skipping deduction");
            if let Some(row) = self
                .select_inventory(&t.from_store_id, &product_id, CommitStage::SourceDeduction)
                .await?
            {
                self.touch(&t.from_store_id, &product_id, row);
            }
        } else {
            self.deduct_source(t, &product_id).await?;
        }
        self.result.source_deducted = true;

        // Destination: the product must exist in the destination store's
        // catalog before stock can be booked against it.
        let source_product = self
            .remote
            .select(PRODUCTS, &RecordKey::id(&product_id))
            .await
            .at(CommitStage::Destination)?
            .ok_or_else(|| missing(&format!("product {product_id}")))
            .at(CommitStage::Destination)?;
        let dest_product_id = self
            .ensure_destination_product(t, &source_product)
            .await?;

        let dest_ref = self.step_ref("dest");
        let movement = Movement::create(&t.to_store_id, &dest_product_id, t.quantity, &dest_ref, CommitStage::Destination);
        if let Some((dest_row, _)) = self.apply_movement(&movement).await? {
            self.touch(&t.to_store_id, &dest_product_id, dest_row);
        }

        let record = json!({
            "store_id": t.from_store_id,
            "product_id": product_id,
            "from_store_id": t.from_store_id,
            "to_store_id": t.to_store_id,
            "quantity": t.quantity,
            "status": "APPROVED",
        });
        let stored = self
            .remote
            .insert(STOCK_TRANSFERS, record, Some(self.client_ref))
            .await
            .at(CommitStage::Destination)?;
        self.result.record = Some(stored);
        Ok(())
    }

    async fn deduct_source(&mut self, t: &TransferPayload, product_id: &str) -> Result<(), Halt> {
        let deduct_ref = self.step_ref("deduct");
        let movement = Movement {
            needs: Some(t.quantity),
            create: false,
            ..Movement::create(&t.from_store_id, product_id, -t.quantity, &deduct_ref, CommitStage::SourceDeduction)
        };
        let (row, _) = self
            .apply_movement(&movement)
            .await?
            .ok_or_else(|| RemoteError::Rejected {
                status: 422,
                message: format!("no stock of {product_id} at {}", t.from_store_id),
            })
            .at(CommitStage::SourceDeduction)?;
        self.touch(&t.from_store_id, product_id, row);
        Ok(())
    }

    /// Destination product id, matched by SKU or copied from the source.
    async fn ensure_destination_product(&self, t: &TransferPayload, source_product: &Value) -> Result<String, Halt> {
        let stage = CommitStage::Destination;
        let sku = source_product.get("sku").and_then(Value::as_str).unwrap_or_default();
        let key = RecordKey::new().eq("store_id", &t.to_store_id).eq("sku", sku);
        if let Some(existing) = self.remote.select(PRODUCTS, &key).await.at(stage)? {
            if let Some(id) = record_id(&existing) {
                return Ok(id);
            }
        }

        let copy = with_store(source_product.clone(), &t.to_store_id, &["id", "client_ref"]);
        let stored = self
            .remote
            .insert(PRODUCTS, copy, Some(&self.step_ref("dest_product")))
            .await
            .at(stage)?;
        record_id(&stored)
            .ok_or_else(|| RemoteError::InvalidResponse("inserted product without id".into()))
            .at(stage)
    }
}

const MAX_STOCK_CONFLICTS: usize = 3;

/// One stock change against an inventory position.
struct Movement<'m> {
    store_id: &'m str,
    product_id: &'m str,
    delta: i64,
    sold: i64,
    step_ref: &'m str,
    stage: CommitStage,
    /// Reject when less than this is available.
    needs: Option<i64>,
    /// Open the position when it does not exist yet.
    create: bool,
}

impl<'m> Movement<'m> {
    fn create(store_id: &'m str, product_id: &'m str, delta: i64, step_ref: &'m str, stage: CommitStage) -> Self {
        Self {
            store_id,
            product_id,
            delta,
            sold: 0,
            step_ref,
            stage,
            needs: None,
            create: true,
        }
    }
}

enum Attempt {
    /// Written by this attempt, or found stamped with this step's ref.
    Applied(Value, i64),
    /// An earlier attempt landed and was already marked in the ledger.
    Landed(Value, i64),
    /// The position changed since it was read.
    Conflict,
}

fn is_applied(movement: &Value) -> bool {
    movement.get("applied").and_then(Value::as_bool).unwrap_or(false)
}

/// Object `record` with `store_id` set and the `drop` keys removed.
fn with_store(record: Value, store_id: &str, drop: &[&str]) -> Value {
    let mut map = match record {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    for key in drop {
        map.remove(*key);
    }
    map.insert("store_id".into(), Value::String(store_id.to_string()));
    Value::Object(map)
}
