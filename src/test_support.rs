//! In-memory remote store and fixtures shared by the unit tests.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::config::SyncConfig;
use crate::db::DbState;
use crate::error::RemoteError;
use crate::remote::{record_id, RecordKey, RemoteStore, INVENTORY, PRODUCTS};
use crate::sync::SyncEngine;

#[derive(Debug, Clone)]
enum Applied {
    Insert(Value),
    Delete(bool),
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Vec<Value>>,
    applied: HashMap<String, Applied>,
    next_id: u64,
    offline: bool,
    unauthorized: bool,
    failing_refs: HashMap<String, RemoteError>,
    failing_tables: HashMap<String, VecDeque<RemoteError>>,
    lost_responses: HashMap<String, usize>,
}

impl State {
    fn gate(&self) -> Result<(), RemoteError> {
        if self.offline {
            return Err(RemoteError::Unreachable("connection refused".into()));
        }
        if self.unauthorized {
            return Err(RemoteError::Unauthorized("Invalid API key".into()));
        }
        Ok(())
    }

    fn gate_write(&mut self, table: &str, client_ref: Option<&str>) -> Result<(), RemoteError> {
        self.gate()?;
        if let Some(err) = client_ref.and_then(|r| self.failing_refs.get(r)) {
            return Err(err.clone());
        }
        if let Some(err) = self.failing_tables.get_mut(table).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(())
    }

    /// Called after a write landed: whether its response is dropped.
    fn lose_response(&mut self, table: &str) -> Result<(), RemoteError> {
        match self.lost_responses.get_mut(table) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Err(RemoteError::Unreachable("Connection timed out".into()))
            }
            _ => Ok(()),
        }
    }

    fn store(&mut self, table: &str, record: Value) -> Value {
        let mut map = match record {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if !map.contains_key("id") {
            self.next_id += 1;
            map.insert("id".into(), json!(format!("{table}-{}", self.next_id)));
        }
        let stored = Value::Object(map);
        self.tables.entry(table.to_string()).or_default().push(stored.clone());
        stored
    }
}

/// Remote double with PostgREST-like semantics: an insert or delete
/// carrying a `client_ref` already seen in that table returns the stored
/// result instead of applying again. Updates are always applied.
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl MemoryRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Put a row straight into `table`, bypassing idempotency. Returns its id.
    pub fn seed(&self, table: &str, record: Value) -> String {
        let mut state = self.state.lock().unwrap();
        let stored = state.store(table, record);
        record_id(&stored).unwrap()
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        let state = self.state.lock().unwrap();
        state.tables.get(table).cloned().unwrap_or_default()
    }

    pub fn find(&self, table: &str, key: &RecordKey) -> Option<Value> {
        self.rows(table).into_iter().find(|row| key.matches(row))
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.state.lock().unwrap().unauthorized = unauthorized;
    }

    /// Every write tagged with `client_ref` fails with `err` until cleared.
    pub fn fail_ref(&self, client_ref: &str, err: RemoteError) {
        self.state
            .lock()
            .unwrap()
            .failing_refs
            .insert(client_ref.to_string(), err);
    }

    /// The next write to `table` fails with `err`.
    pub fn fail_next_write(&self, table: &str, err: RemoteError) {
        self.state
            .lock()
            .unwrap()
            .failing_tables
            .entry(table.to_string())
            .or_default()
            .push_back(err);
    }

    /// The next `count` writes to `table` land but report a timeout.
    pub fn lose_responses(&self, table: &str, count: usize) {
        *self
            .state
            .lock()
            .unwrap()
            .lost_responses
            .entry(table.to_string())
            .or_default() += count;
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.failing_refs.clear();
        state.failing_tables.clear();
        state.lost_responses.clear();
    }
}

fn applied_key(table: &str, client_ref: &str) -> String {
    format!("{table}/{client_ref}")
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn select(&self, table: &str, key: &RecordKey) -> Result<Option<Value>, RemoteError> {
        let state = self.state.lock().unwrap();
        state.gate()?;
        Ok(state
            .tables
            .get(table)
            .and_then(|rows| rows.iter().find(|row| key.matches(row)).cloned()))
    }

    async fn select_all(&self, table: &str, store_id: &str) -> Result<Vec<Value>, RemoteError> {
        let state = self.state.lock().unwrap();
        state.gate()?;
        let key = RecordKey::new().eq("store_id", store_id);
        Ok(state
            .tables
            .get(table)
            .map(|rows| rows.iter().filter(|row| key.matches(row)).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert(&self, table: &str, record: Value, client_ref: Option<&str>) -> Result<Value, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.gate_write(table, client_ref)?;
        if let Some(r) = client_ref {
            if let Some(Applied::Insert(stored)) = state.applied.get(&applied_key(table, r)) {
                return Ok(stored.clone());
            }
        }
        let mut record = record;
        if let (Some(r), Value::Object(map)) = (client_ref, &mut record) {
            map.insert("client_ref".into(), json!(r));
        }
        let stored = state.store(table, record);
        if let Some(r) = client_ref {
            state.applied.insert(applied_key(table, r), Applied::Insert(stored.clone()));
        }
        state.lose_response(table)?;
        Ok(stored)
    }

    async fn update(
        &self,
        table: &str,
        key: &RecordKey,
        fields: Value,
        client_ref: Option<&str>,
    ) -> Result<Option<Value>, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.gate_write(table, client_ref)?;
        let updated = state
            .tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|row| key.matches(row)))
            .map(|row| {
                if let (Value::Object(target), Value::Object(patch)) = (&mut *row, &fields) {
                    for (k, v) in patch {
                        target.insert(k.clone(), v.clone());
                    }
                }
                row.clone()
            });
        state.lose_response(table)?;
        Ok(updated)
    }

    async fn delete(&self, table: &str, key: &RecordKey, client_ref: Option<&str>) -> Result<bool, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.gate_write(table, client_ref)?;
        if let Some(r) = client_ref {
            if let Some(Applied::Delete(deleted)) = state.applied.get(&applied_key(table, r)) {
                return Ok(*deleted);
            }
        }
        let deleted = match state.tables.get_mut(table) {
            Some(rows) => {
                let before = rows.len();
                rows.retain(|row| !key.matches(row));
                rows.len() < before
            }
            None => false,
        };
        if let Some(r) = client_ref {
            state.applied.insert(applied_key(table, r), Applied::Delete(deleted));
        }
        state.lose_response(table)?;
        Ok(deleted)
    }

    async fn health_check(&self) -> Result<(), RemoteError> {
        self.state.lock().unwrap().gate()
    }
}

/// Config with pacing and backoff short enough for tests.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        item_delay_ms: 0,
        reconnect_debounce_ms: 20,
        retry_interval_secs: 1,
        health_check_interval_secs: 0,
        ..SyncConfig::default()
    }
}

pub fn engine_with(db: Arc<DbState>, remote: Arc<MemoryRemote>, config: SyncConfig) -> Arc<SyncEngine> {
    Arc::new(SyncEngine::new(db, remote, config).unwrap())
}

pub fn engine(remote: Arc<MemoryRemote>) -> (Arc<DbState>, Arc<SyncEngine>) {
    let db = Arc::new(DbState::in_memory().unwrap());
    let engine = engine_with(Arc::clone(&db), remote, test_config());
    (db, engine)
}

/// Seed a product with stock in `store_id` on the remote. Returns the
/// product id.
pub fn seed_stocked_product(remote: &MemoryRemote, store_id: &str, sku: &str, qty: i64) -> String {
    let product_id = remote.seed(
        PRODUCTS,
        json!({ "store_id": store_id, "name": format!("Item {sku}"), "sku": sku, "price": 5.0 }),
    );
    remote.seed(
        INVENTORY,
        json!({
            "store_id": store_id,
            "product_id": product_id,
            "available_qty": qty,
            "quantity_sold": 0,
        }),
    );
    product_id
}

/// Remote `available_qty` of a product in a store.
pub fn remote_qty(remote: &MemoryRemote, store_id: &str, product_id: &str) -> Option<i64> {
    remote
        .find(
            INVENTORY,
            &RecordKey::new().eq("store_id", store_id).eq("product_id", product_id),
        )
        .map(|row| crate::remote::i64_field(&row, "available_qty"))
}
