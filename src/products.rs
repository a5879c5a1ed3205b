//! Product catalog cache (including IMEI/serial lists).

use serde::{Deserialize, Serialize};

use crate::cache::EntityCache;
use crate::error::StoreResult;
use crate::models::{CacheRecord, CachedEntity, EntityType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    pub sku: String,
    #[serde(default)]
    pub barcode: Option<String>,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub category: Option<String>,
    /// IMEI / serial numbers on hand for serialized products.
    #[serde(default)]
    pub imeis: Vec<String>,
}

impl Product {
    pub fn named(name: &str, sku: &str, price: f64) -> Self {
        Self {
            name: name.to_string(),
            sku: sku.to_string(),
            barcode: None,
            price,
            category: None,
            imeis: Vec::new(),
        }
    }
}

impl CacheRecord for Product {
    const ENTITY: EntityType = EntityType::Product;
}

pub type ProductCache = EntityCache<Product>;

impl EntityCache<Product> {
    pub fn by_barcode(&self, store_id: &str, barcode: &str) -> StoreResult<Option<CachedEntity<Product>>> {
        Ok(self.find_by_field(store_id, "barcode", barcode)?.into_iter().next())
    }

    pub fn by_sku(&self, store_id: &str, sku: &str) -> StoreResult<Option<CachedEntity<Product>>> {
        Ok(self.find_by_field(store_id, "sku", sku)?.into_iter().next())
    }

    /// Product carrying the given IMEI/serial, if any.
    pub fn by_imei(&self, store_id: &str, imei: &str) -> StoreResult<Option<CachedEntity<Product>>> {
        Ok(self
            .get_all(store_id)?
            .into_iter()
            .find(|p| p.data.imeis.iter().any(|i| i == imei)))
    }
}
