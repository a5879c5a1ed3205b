//! Stock transfers between store partitions.
//!
//! A transfer is cached in the source store's partition. `source_deducted`
//! records that the remote deduction at the source has happened, so a retry
//! after a destination-side failure never deducts twice.
//! `local_deduction_applied` tracks whether the optimistic local deduction is
//! currently reflected in the source inventory cache, so the compensating
//! reversal runs at most once.

use serde::{Deserialize, Serialize};

use crate::cache::{rows_by_field_any_store, CacheRow, EntityCache};
use crate::error::StoreResult;
use crate::models::{CacheRecord, CachedEntity, EntityType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Pending,
    Approved,
    Failed,
}

impl TransferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Pending => "PENDING",
            TransferStatus::Approved => "APPROVED",
            TransferStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockTransfer {
    pub product_id: String,
    pub from_store_id: String,
    pub to_store_id: String,
    pub quantity: i64,
    pub status: TransferStatus,
    #[serde(default)]
    pub source_deducted: bool,
    #[serde(default)]
    pub local_deduction_applied: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub requested_at: Option<String>,
}

impl CacheRecord for StockTransfer {
    const ENTITY: EntityType = EntityType::StockTransfer;
}

pub type TransferCache = EntityCache<StockTransfer>;

impl EntityCache<StockTransfer> {
    /// Transfers leaving `store_id`.
    pub fn outgoing(&self, store_id: &str) -> StoreResult<Vec<CachedEntity<StockTransfer>>> {
        self.get_all(store_id)
    }

    /// Transfers headed to `store_id`, whichever partition they live in.
    pub fn incoming(&self, store_id: &str) -> StoreResult<Vec<CachedEntity<StockTransfer>>> {
        let rows = self
            .db()
            .read(|conn| rows_by_field_any_store(conn, EntityType::StockTransfer, "to_store_id", store_id))?;
        rows.into_iter().map(CacheRow::into_entity).collect()
    }

    pub fn by_status(
        &self,
        store_id: &str,
        status: TransferStatus,
    ) -> StoreResult<Vec<CachedEntity<StockTransfer>>> {
        self.find_by_field(store_id, "status", status.as_str())
    }
}
