//! Customer cache.

use serde::{Deserialize, Serialize};

use crate::cache::EntityCache;
use crate::error::StoreResult;
use crate::models::{CacheRecord, CachedEntity, EntityType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub loyalty_points: i64,
}

impl CacheRecord for Customer {
    const ENTITY: EntityType = EntityType::Customer;
}

pub type CustomerCache = EntityCache<Customer>;

impl EntityCache<Customer> {
    pub fn by_phone(&self, store_id: &str, phone: &str) -> StoreResult<Option<CachedEntity<Customer>>> {
        Ok(self.find_by_field(store_id, "phone", phone)?.into_iter().next())
    }
}
