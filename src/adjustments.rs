//! Stock adjustment log (manual corrections, shrinkage, damage).

use serde::{Deserialize, Serialize};

use crate::cache::EntityCache;
use crate::error::StoreResult;
use crate::models::{CacheRecord, CachedEntity, EntityType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentLog {
    pub product_id: String,
    pub delta: i64,
    pub reason: String,
    pub previous_qty: i64,
    pub new_qty: i64,
}

impl CacheRecord for AdjustmentLog {
    const ENTITY: EntityType = EntityType::AdjustmentLog;
}

pub type AdjustmentCache = EntityCache<AdjustmentLog>;

impl EntityCache<AdjustmentLog> {
    pub fn for_product(&self, store_id: &str, product_id: &str) -> StoreResult<Vec<CachedEntity<AdjustmentLog>>> {
        self.find_by_field(store_id, "product_id", product_id)
    }
}
