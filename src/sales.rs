//! Sales recorded at the till.

use serde::{Deserialize, Serialize};

use crate::cache::EntityCache;
use crate::error::StoreResult;
use crate::models::{CacheRecord, CachedEntity, EntityType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleLine {
    pub product_id: String,
    pub quantity: i64,
    pub unit_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sale {
    #[serde(default)]
    pub customer_id: Option<String>,
    pub lines: Vec<SaleLine>,
    pub total: f64,
    #[serde(default = "default_payment_method")]
    pub payment_method: String,
    pub sold_at: String,
}

fn default_payment_method() -> String {
    "cash".to_string()
}

impl Sale {
    pub fn line_total(&self) -> f64 {
        self.lines
            .iter()
            .map(|l| l.unit_price * l.quantity as f64)
            .sum()
    }
}

impl CacheRecord for Sale {
    const ENTITY: EntityType = EntityType::Sale;
}

pub type SaleCache = EntityCache<Sale>;

impl EntityCache<Sale> {
    pub fn for_customer(&self, store_id: &str, customer_id: &str) -> StoreResult<Vec<CachedEntity<Sale>>> {
        self.find_by_field(store_id, "customer_id", customer_id)
    }
}
