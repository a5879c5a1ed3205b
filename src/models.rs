//! Shared record shapes for the entity cache.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StoreError;

/// Local sync state of a cached record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineStatus {
    Synced,
    Pending,
    PendingUpdate,
    Failed,
}

impl OfflineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OfflineStatus::Synced => "synced",
            OfflineStatus::Pending => "pending",
            OfflineStatus::PendingUpdate => "pending_update",
            OfflineStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "synced" => Ok(OfflineStatus::Synced),
            "pending" => Ok(OfflineStatus::Pending),
            "pending_update" => Ok(OfflineStatus::PendingUpdate),
            "failed" => Ok(OfflineStatus::Failed),
            other => Err(StoreError::Corrupt {
                kind: "offline_status",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for OfflineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds of records the pipeline caches or queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Product,
    ProductImei,
    Inventory,
    AdjustmentLog,
    Sale,
    StockTransfer,
    Customer,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Product => "product",
            EntityType::ProductImei => "product_imei",
            EntityType::Inventory => "inventory",
            EntityType::AdjustmentLog => "adjustment_log",
            EntityType::Sale => "sale",
            EntityType::StockTransfer => "stock_transfer",
            EntityType::Customer => "customer",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "product" => Ok(EntityType::Product),
            "product_imei" => Ok(EntityType::ProductImei),
            "inventory" => Ok(EntityType::Inventory),
            "adjustment_log" => Ok(EntityType::AdjustmentLog),
            "sale" => Ok(EntityType::Sale),
            "stock_transfer" => Ok(EntityType::StockTransfer),
            "customer" => Ok(EntityType::Customer),
            other => Err(StoreError::Corrupt {
                kind: "entity_type",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity payload that can live in the entity cache.
pub trait CacheRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const ENTITY: EntityType;

    /// Key used instead of the remote/offline id, for records addressed by a
    /// natural key (inventory positions are keyed by product).
    fn natural_key(&self) -> Option<String> {
        None
    }
}

/// Locally stored copy of a remote record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntity<T> {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "_offline_id", default)]
    pub offline_id: Option<String>,
    #[serde(rename = "_client_ref", default)]
    pub client_ref: Option<String>,
    #[serde(rename = "_offline_status")]
    pub offline_status: OfflineStatus,
    pub store_id: String,
    #[serde(flatten)]
    pub data: T,
}

impl<T: CacheRecord> CachedEntity<T> {
    /// A record as delivered by the remote store.
    pub fn synced(id: impl Into<String>, store_id: impl Into<String>, data: T) -> Self {
        Self {
            id: Some(id.into()),
            offline_id: None,
            client_ref: None,
            offline_status: OfflineStatus::Synced,
            store_id: store_id.into(),
            data,
        }
    }

    /// Key of this record inside its `(entity_type, store_id)` partition.
    pub fn cache_key(&self) -> Result<String, StoreError> {
        self.data
            .natural_key()
            .or_else(|| self.id.clone())
            .or_else(|| self.offline_id.clone())
            .ok_or_else(|| {
                StoreError::Invalid(format!("{} record has neither id nor _offline_id", T::ENTITY))
            })
    }

    pub fn is_synced(&self) -> bool {
        self.offline_status == OfflineStatus::Synced
    }
}

/// New client-generated identity for a record created offline.
pub fn new_offline_id() -> String {
    format!("offline-{}", uuid::Uuid::new_v4())
}

/// New idempotency token for one logical operation.
pub fn new_client_ref() -> String {
    uuid::Uuid::new_v4().to_string()
}
