//! Inventory position cache. One position per product per store, keyed by
//! `product_id`.

use serde::{Deserialize, Serialize};

use crate::cache::EntityCache;
use crate::error::StoreResult;
use crate::models::{CacheRecord, CachedEntity, EntityType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryPosition {
    pub product_id: String,
    #[serde(default)]
    pub available_qty: i64,
    #[serde(default)]
    pub quantity_sold: i64,
    #[serde(default)]
    pub reorder_level: Option<i64>,
}

impl InventoryPosition {
    pub fn new(product_id: &str, available_qty: i64) -> Self {
        Self {
            product_id: product_id.to_string(),
            available_qty,
            quantity_sold: 0,
            reorder_level: None,
        }
    }
}

impl CacheRecord for InventoryPosition {
    const ENTITY: EntityType = EntityType::Inventory;

    fn natural_key(&self) -> Option<String> {
        Some(self.product_id.clone())
    }
}

pub type InventoryCache = EntityCache<InventoryPosition>;

impl EntityCache<InventoryPosition> {
    pub fn for_product(
        &self,
        store_id: &str,
        product_id: &str,
    ) -> StoreResult<Option<CachedEntity<InventoryPosition>>> {
        self.get_by_id(store_id, product_id)
    }

    /// Available quantity, 0 when the product has no position in this store.
    pub fn available_qty(&self, store_id: &str, product_id: &str) -> StoreResult<i64> {
        Ok(self
            .for_product(store_id, product_id)?
            .map(|p| p.data.available_qty)
            .unwrap_or(0))
    }

    /// Positions at or below their reorder level.
    pub fn low_stock(&self, store_id: &str) -> StoreResult<Vec<CachedEntity<InventoryPosition>>> {
        Ok(self
            .get_all(store_id)?
            .into_iter()
            .filter(|p| matches!(p.data.reorder_level, Some(level) if p.data.available_qty <= level))
            .collect())
    }
}
