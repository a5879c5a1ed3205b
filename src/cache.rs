//! Generic entity cache over the `entity_cache` table.
//!
//! Each record type gets an `EntityCache<T>`; entity-specific getters live
//! next to the record types (`inventory.rs`, `products.rs`, ...). The free
//! `*_row` functions take a plain `&Connection` so callers can compose them
//! with queue writes inside one transaction.

use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

use crate::db::{now_iso, DbState};
use crate::error::{StoreError, StoreResult};
use crate::models::{CacheRecord, CachedEntity, EntityType, OfflineStatus};

/// Raw cache row, independent of the record type.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRow {
    pub entity_type: EntityType,
    pub store_id: String,
    pub cache_key: String,
    pub remote_id: Option<String>,
    pub offline_id: Option<String>,
    pub client_ref: Option<String>,
    pub offline_status: OfflineStatus,
    pub data: Value,
    pub created_at: String,
    pub updated_at: String,
}

impl CacheRow {
    pub fn new(
        entity_type: EntityType,
        store_id: &str,
        cache_key: &str,
        data: Value,
        offline_status: OfflineStatus,
    ) -> Self {
        let now = now_iso();
        Self {
            entity_type,
            store_id: store_id.to_string(),
            cache_key: cache_key.to_string(),
            remote_id: None,
            offline_id: None,
            client_ref: None,
            offline_status,
            data,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn into_entity<T: CacheRecord>(self) -> StoreResult<CachedEntity<T>> {
        Ok(CachedEntity {
            id: self.remote_id,
            offline_id: self.offline_id,
            client_ref: self.client_ref,
            offline_status: self.offline_status,
            store_id: self.store_id,
            data: serde_json::from_value(self.data)?,
        })
    }

    pub fn i64_field(&self, key: &str) -> i64 {
        self.data.get(key).and_then(Value::as_i64).unwrap_or(0)
    }
}

const ROW_COLUMNS: &str = "entity_type, store_id, cache_key, remote_id, offline_id, client_ref,
                           offline_status, data, created_at, updated_at";

fn map_row(row: &Row<'_>) -> rusqlite::Result<(CacheRowRaw, String, String)> {
    Ok((
        CacheRowRaw {
            store_id: row.get(1)?,
            cache_key: row.get(2)?,
            remote_id: row.get(3)?,
            offline_id: row.get(4)?,
            client_ref: row.get(5)?,
            data: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        },
        row.get(0)?,
        row.get(6)?,
    ))
}

struct CacheRowRaw {
    store_id: String,
    cache_key: String,
    remote_id: Option<String>,
    offline_id: Option<String>,
    client_ref: Option<String>,
    data: String,
    created_at: String,
    updated_at: String,
}

fn finish_row((raw, entity, status): (CacheRowRaw, String, String)) -> StoreResult<CacheRow> {
    Ok(CacheRow {
        entity_type: EntityType::parse(&entity)?,
        store_id: raw.store_id,
        cache_key: raw.cache_key,
        remote_id: raw.remote_id,
        offline_id: raw.offline_id,
        client_ref: raw.client_ref,
        offline_status: OfflineStatus::parse(&status)?,
        data: serde_json::from_str(&raw.data)?,
        created_at: raw.created_at,
        updated_at: raw.updated_at,
    })
}

fn query_rows(conn: &Connection, sql: &str, args: &[&dyn ToSql]) -> StoreResult<Vec<CacheRow>> {
    let mut stmt = conn.prepare(sql)?;
    let raw = stmt
        .query_map(args, map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    raw.into_iter().map(finish_row).collect()
}

/// Look up a row by cache key, remote id or offline id (in that preference).
pub fn read_row(
    conn: &Connection,
    entity: EntityType,
    store_id: &str,
    id: &str,
) -> StoreResult<Option<CacheRow>> {
    let sql = format!(
        "SELECT {ROW_COLUMNS} FROM entity_cache
         WHERE entity_type = ?1 AND store_id = ?2
           AND (cache_key = ?3 OR remote_id = ?3 OR offline_id = ?3)
         ORDER BY (cache_key = ?3) DESC, (remote_id = ?3) DESC
         LIMIT 1"
    );
    let raw = conn
        .query_row(&sql, params![entity.as_str(), store_id, id], map_row)
        .optional()?;
    raw.map(finish_row).transpose()
}

/// Like `read_row`, but a missing row is an error.
pub fn require_row(
    conn: &Connection,
    entity: EntityType,
    store_id: &str,
    id: &str,
) -> StoreResult<CacheRow> {
    read_row(conn, entity, store_id, id)?.ok_or_else(|| StoreError::NotFound {
        entity: entity.as_str(),
        key: id.to_string(),
        store_id: store_id.to_string(),
    })
}

/// Insert or replace a row wholesale. Returns `false` when the stored row
/// already had identical content (nothing written).
pub fn write_row(conn: &Connection, row: &CacheRow) -> StoreResult<bool> {
    let data = serde_json::to_string(&row.data)?;
    let changed = conn.execute(
        "INSERT INTO entity_cache (
            entity_type, store_id, cache_key, remote_id, offline_id, client_ref,
            offline_status, data, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(entity_type, store_id, cache_key) DO UPDATE SET
            remote_id = excluded.remote_id,
            offline_id = excluded.offline_id,
            client_ref = excluded.client_ref,
            offline_status = excluded.offline_status,
            data = excluded.data,
            updated_at = excluded.updated_at
         WHERE entity_cache.data IS NOT excluded.data
            OR entity_cache.offline_status IS NOT excluded.offline_status
            OR entity_cache.remote_id IS NOT excluded.remote_id
            OR entity_cache.offline_id IS NOT excluded.offline_id
            OR entity_cache.client_ref IS NOT excluded.client_ref",
        params![
            row.entity_type.as_str(),
            row.store_id,
            row.cache_key,
            row.remote_id,
            row.offline_id,
            row.client_ref,
            row.offline_status.as_str(),
            data,
            row.created_at,
            now_iso(),
        ],
    )?;
    Ok(changed > 0)
}

/// Merge a server record into the cache. Rows holding unsynced local changes
/// are left alone; they are reconciled when their queue item syncs.
pub fn refresh_row(
    conn: &Connection,
    entity: EntityType,
    store_id: &str,
    key: &str,
    remote_id: Option<&str>,
    data: Value,
) -> StoreResult<bool> {
    let existing = read_row(conn, entity, store_id, key)?;
    if let Some(ref row) = existing {
        if row.offline_status != OfflineStatus::Synced {
            debug!(
                entity = %entity,
                store_id,
                key,
                status = %row.offline_status,
                "Refresh skipped row with unsynced local changes"
            );
            return Ok(false);
        }
    }

    let mut row = match existing {
        Some(row) => row,
        None => CacheRow::new(entity, store_id, key, Value::Null, OfflineStatus::Synced),
    };
    row.remote_id = remote_id.map(str::to_string).or(row.remote_id);
    row.client_ref = None;
    row.offline_status = OfflineStatus::Synced;
    row.data = data;
    write_row(conn, &row)
}

/// Patch only the given top-level fields of an existing row and flag it as
/// carrying local changes.
pub fn patch_row(
    conn: &Connection,
    entity: EntityType,
    store_id: &str,
    id: &str,
    fields: &Value,
    client_ref: &str,
    status: OfflineStatus,
) -> StoreResult<CacheRow> {
    let mut row = require_row(conn, entity, store_id, id)?;
    merge_fields(&mut row.data, fields)?;
    row.client_ref = Some(client_ref.to_string());
    row.offline_status = status;
    write_row(conn, &row)?;
    Ok(row)
}

/// Shallow merge of `fields` (an object) into `target`.
pub fn merge_fields(target: &mut Value, fields: &Value) -> StoreResult<()> {
    let Value::Object(patch) = fields else {
        return Err(StoreError::Invalid("patch must be a JSON object".into()));
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(obj) = target {
        for (k, v) in patch {
            obj.insert(k.clone(), v.clone());
        }
    }
    Ok(())
}

pub fn delete_row(conn: &Connection, entity: EntityType, store_id: &str, id: &str) -> StoreResult<bool> {
    let Some(row) = read_row(conn, entity, store_id, id)? else {
        return Ok(false);
    };
    let n = conn.execute(
        "DELETE FROM entity_cache WHERE entity_type = ?1 AND store_id = ?2 AND cache_key = ?3",
        params![entity.as_str(), store_id, row.cache_key],
    )?;
    Ok(n > 0)
}

/// Move a row to a new cache key (offline id -> remote id). A row already
/// stored under the target key is replaced.
pub fn rekey_row(
    conn: &Connection,
    entity: EntityType,
    store_id: &str,
    from: &str,
    to: &str,
) -> StoreResult<bool> {
    if from == to {
        return Ok(false);
    }
    conn.execute(
        "DELETE FROM entity_cache WHERE entity_type = ?1 AND store_id = ?2 AND cache_key = ?3
           AND EXISTS (SELECT 1 FROM entity_cache WHERE entity_type = ?1 AND store_id = ?2 AND cache_key = ?4)",
        params![entity.as_str(), store_id, to, from],
    )?;
    let n = conn.execute(
        "UPDATE entity_cache SET cache_key = ?4, updated_at = ?5
         WHERE entity_type = ?1 AND store_id = ?2 AND cache_key = ?3",
        params![entity.as_str(), store_id, from, to, now_iso()],
    )?;
    Ok(n > 0)
}

/// Remote id for a record referenced by remote or offline id, if known.
pub fn resolve_remote_id(
    conn: &Connection,
    entity: EntityType,
    store_id: &str,
    id: &str,
) -> StoreResult<Option<String>> {
    match read_row(conn, entity, store_id, id)? {
        Some(row) => Ok(row.remote_id),
        // Not cached locally: assume the caller already holds a remote id.
        None if !id.starts_with("offline-") => Ok(Some(id.to_string())),
        None => Ok(None),
    }
}

pub fn rows_for_store(conn: &Connection, entity: EntityType, store_id: &str) -> StoreResult<Vec<CacheRow>> {
    let sql = format!(
        "SELECT {ROW_COLUMNS} FROM entity_cache
         WHERE entity_type = ?1 AND store_id = ?2
         ORDER BY created_at ASC, cache_key ASC"
    );
    query_rows(conn, &sql, &[&entity.as_str(), &store_id])
}

/// Rows whose JSON field equals `value` across every store partition.
pub fn rows_by_field_any_store(
    conn: &Connection,
    entity: EntityType,
    field: &str,
    value: &str,
) -> StoreResult<Vec<CacheRow>> {
    let sql = format!(
        "SELECT {ROW_COLUMNS} FROM entity_cache
         WHERE entity_type = ?1 AND json_extract(data, ?2) = ?3
         ORDER BY created_at ASC, cache_key ASC"
    );
    let path = format!("$.{field}");
    query_rows(conn, &sql, &[&entity.as_str(), &path, &value])
}

// ---------------------------------------------------------------------------
// Typed cache handle
// ---------------------------------------------------------------------------

/// Typed access to one entity type in the local store.
pub struct EntityCache<T> {
    db: Arc<DbState>,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for EntityCache<T> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            _record: PhantomData,
        }
    }
}

impl<T: CacheRecord> EntityCache<T> {
    pub fn new(db: Arc<DbState>) -> Self {
        Self {
            db,
            _record: PhantomData,
        }
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    pub fn get_all(&self, store_id: &str) -> StoreResult<Vec<CachedEntity<T>>> {
        let rows = self.db.read(|conn| rows_for_store(conn, T::ENTITY, store_id))?;
        rows.into_iter().map(CacheRow::into_entity).collect()
    }

    pub fn get_by_id(&self, store_id: &str, id: &str) -> StoreResult<Option<CachedEntity<T>>> {
        let row = self.db.read(|conn| read_row(conn, T::ENTITY, store_id, id))?;
        row.map(CacheRow::into_entity).transpose()
    }

    /// Uses the `(store_id, offline_status)` index.
    pub fn get_by_status(
        &self,
        store_id: &str,
        status: OfflineStatus,
    ) -> StoreResult<Vec<CachedEntity<T>>> {
        let rows = self.db.read(|conn| {
            let sql = format!(
                "SELECT {ROW_COLUMNS} FROM entity_cache
                 WHERE entity_type = ?1 AND store_id = ?2 AND offline_status = ?3
                 ORDER BY created_at ASC, cache_key ASC"
            );
            query_rows(conn, &sql, &[&T::ENTITY.as_str(), &store_id, &status.as_str()])
        })?;
        rows.into_iter().map(CacheRow::into_entity).collect()
    }

    pub fn count_by_status(&self, store_id: &str, status: OfflineStatus) -> StoreResult<i64> {
        self.db.read(|conn| {
            let n = conn.query_row(
                "SELECT COUNT(*) FROM entity_cache
                 WHERE entity_type = ?1 AND store_id = ?2 AND offline_status = ?3",
                params![T::ENTITY.as_str(), store_id, status.as_str()],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }

    /// Records whose top-level JSON `field` equals `value` in this store.
    pub fn find_by_field(
        &self,
        store_id: &str,
        field: &str,
        value: &str,
    ) -> StoreResult<Vec<CachedEntity<T>>> {
        let path = format!("$.{field}");
        let rows = self.db.read(|conn| {
            let sql = format!(
                "SELECT {ROW_COLUMNS} FROM entity_cache
                 WHERE entity_type = ?1 AND store_id = ?2 AND json_extract(data, ?3) = ?4
                 ORDER BY created_at ASC, cache_key ASC"
            );
            query_rows(conn, &sql, &[&T::ENTITY.as_str(), &store_id, &path, &value])
        })?;
        rows.into_iter().map(CacheRow::into_entity).collect()
    }

    /// Write many records in one transaction.
    ///
    /// Synced records (a server refresh) replace the cached row wholesale
    /// unless it carries unsynced local changes. Records in any other status
    /// are local writes and replace the row unconditionally. Re-applying the
    /// same set changes nothing. Returns the number of rows written.
    pub fn upsert_many(&self, records: &[CachedEntity<T>], store_id: &str) -> StoreResult<usize> {
        let written = self.db.transaction(|tx| {
            let mut written = 0;
            for record in records {
                let key = record.cache_key()?;
                let data = serde_json::to_value(&record.data)?;
                let changed = if record.offline_status == OfflineStatus::Synced {
                    refresh_row(tx, T::ENTITY, store_id, &key, record.id.as_deref(), data)?
                } else {
                    let mut row = match read_row(tx, T::ENTITY, store_id, &key)? {
                        Some(row) => row,
                        None => CacheRow::new(T::ENTITY, store_id, &key, Value::Null, record.offline_status),
                    };
                    row.remote_id = record.id.clone();
                    row.offline_id = record.offline_id.clone();
                    row.client_ref = record.client_ref.clone();
                    row.offline_status = record.offline_status;
                    row.data = data;
                    write_row(tx, &row)?
                };
                if changed {
                    written += 1;
                }
            }
            Ok(written)
        })?;
        debug!(entity = %T::ENTITY, store_id, written, "Cache upsert");
        Ok(written)
    }

    /// Optimistic local patch: only `fields` change, the row is flagged with
    /// `status` and tagged with `client_ref`.
    pub fn patch_local(
        &self,
        store_id: &str,
        id: &str,
        fields: &Value,
        client_ref: &str,
        status: OfflineStatus,
    ) -> StoreResult<CachedEntity<T>> {
        let row = self
            .db
            .transaction(|tx| patch_row(tx, T::ENTITY, store_id, id, fields, client_ref, status))?;
        row.into_entity()
    }
}
