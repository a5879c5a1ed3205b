//! Narrow interface to the remote system of record.
//!
//! The pipeline only needs keyed insert / update / delete / select against a
//! handful of tables. Inserts carry an idempotency token stored as
//! `client_ref` under a unique constraint, so a replayed insert resolves to
//! the row the first attempt stored. Updates are not deduplicated by the
//! remote; callers that need exactly-once updates filter on the state they
//! read.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RemoteError;

pub const PRODUCTS: &str = "products";
pub const INVENTORY: &str = "inventory";
pub const CUSTOMERS: &str = "customers";
pub const SALES: &str = "sales";
pub const STOCK_TRANSFERS: &str = "stock_transfers";
pub const INVENTORY_ADJUSTMENTS: &str = "inventory_adjustments";
pub const PRODUCT_IMEIS: &str = "product_imeis";
pub const STOCK_MOVEMENTS: &str = "stock_movements";

/// Filters identifying remote rows (`id = x`, or a compound key such as
/// `store_id = s AND product_id = p`). A `None` value means `column IS NULL`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordKey {
    filters: Vec<(String, Option<String>)>,
}

impl RecordKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(id: &str) -> Self {
        Self::new().eq("id", id)
    }

    pub fn eq(mut self, column: &str, value: &str) -> Self {
        self.filters.push((column.to_string(), Some(value.to_string())));
        self
    }

    pub fn is_null(mut self, column: &str) -> Self {
        self.filters.push((column.to_string(), None));
        self
    }

    /// `eq` when `value` is set, `is_null` otherwise.
    pub fn eq_or_null(self, column: &str, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.eq(column, value),
            None => self.is_null(column),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Whether `record` satisfies every filter. Numbers and booleans compare
    /// by their JSON text.
    pub fn matches(&self, record: &Value) -> bool {
        self.filters.iter().all(|(column, expected)| {
            match (record.get(column), expected) {
                (Some(Value::Null) | None, None) => true,
                (Some(Value::Null) | None, Some(_)) | (Some(_), None) => false,
                (Some(Value::String(s)), Some(expected)) => s == expected,
                (Some(other), Some(expected)) => other.to_string() == *expected,
            }
        })
    }

    /// PostgREST query pairs (`column=eq.value`, `column=is.null`).
    pub fn to_query(&self) -> Vec<(String, String)> {
        self.filters
            .iter()
            .map(|(column, value)| match value {
                Some(value) => (column.clone(), format!("eq.{value}")),
                None => (column.clone(), "is.null".to_string()),
            })
            .collect()
    }
}

/// Remote id of a record, accepting string or numeric ids.
pub fn record_id(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn i64_field(record: &Value, field: &str) -> i64 {
    record.get(field).and_then(Value::as_i64).unwrap_or(0)
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn select(&self, table: &str, key: &RecordKey) -> Result<Option<Value>, RemoteError>;

    /// Every row of `table` belonging to `store_id`.
    async fn select_all(&self, table: &str, store_id: &str) -> Result<Vec<Value>, RemoteError>;

    /// Insert `record` and return the stored row (with its remote `id`).
    async fn insert(&self, table: &str, record: Value, client_ref: Option<&str>) -> Result<Value, RemoteError>;

    /// Patch the row matching `key`. `Ok(None)` when nothing matched.
    async fn update(
        &self,
        table: &str,
        key: &RecordKey,
        fields: Value,
        client_ref: Option<&str>,
    ) -> Result<Option<Value>, RemoteError>;

    /// Delete rows matching `key`. `Ok(false)` when nothing matched.
    async fn delete(&self, table: &str, key: &RecordKey, client_ref: Option<&str>) -> Result<bool, RemoteError>;

    /// Cheap reachability and credential check.
    async fn health_check(&self) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_key_matching() {
        let key = RecordKey::new().eq("store_id", "s1").eq("product_id", "42");
        assert!(key.matches(&json!({ "store_id": "s1", "product_id": 42 })));
        assert!(key.matches(&json!({ "store_id": "s1", "product_id": "42" })));
        assert!(!key.matches(&json!({ "store_id": "s2", "product_id": "42" })));
        assert!(!key.matches(&json!({ "store_id": "s1" })));
        assert_eq!(
            key.to_query(),
            vec![
                ("store_id".to_string(), "eq.s1".to_string()),
                ("product_id".to_string(), "eq.42".to_string())
            ]
        );
    }

    #[test]
    fn test_null_filters() {
        let key = RecordKey::id("inv-1").eq("available_qty", "10").is_null("last_movement_ref");
        assert!(key.matches(&json!({ "id": "inv-1", "available_qty": 10 })));
        assert!(key.matches(&json!({ "id": "inv-1", "available_qty": 10, "last_movement_ref": null })));
        assert!(!key.matches(&json!({ "id": "inv-1", "available_qty": 10, "last_movement_ref": "r1" })));
        assert!(!key.matches(&json!({ "id": "inv-1", "available_qty": 11 })));
        assert_eq!(
            key.to_query()[2],
            ("last_movement_ref".to_string(), "is.null".to_string())
        );

        let guarded = RecordKey::new().eq_or_null("last_movement_ref", Some("r1"));
        assert!(guarded.matches(&json!({ "last_movement_ref": "r1" })));
        assert!(RecordKey::new().is_empty());
        assert!(!guarded.is_empty());
    }

    #[test]
    fn test_record_id_accepts_numbers() {
        assert_eq!(record_id(&json!({ "id": 7 })).as_deref(), Some("7"));
        assert_eq!(record_id(&json!({ "id": "uuid-1" })).as_deref(), Some("uuid-1"));
        assert_eq!(record_id(&json!({ "name": "x" })), None);
    }
}
