//! Local SQLite store for the offline pipeline.
//!
//! Uses rusqlite with WAL mode. Holds the entity cache, the durable sync
//! queue, notifications, the sync log and per-store sync metadata. Every
//! transactional table carries a `store_id` partition key.

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info};

use crate::error::{StoreError, StoreResult};

pub const DB_FILE: &str = "pos-offline.db";

/// Shared handle to the local database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Initialize the database at `{data_dir}/pos-offline.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas and
/// runs pending migrations. Open failures are returned as-is: the pending
/// queue lives in this file, so it is never deleted to recover.
pub fn init(data_dir: &Path) -> StoreResult<DbState> {
    fs::create_dir_all(data_dir)?;

    let db_path = data_dir.join(DB_FILE);
    info!("Opening offline store at {}", db_path.display());

    let conn = open_and_configure(&db_path)?;
    run_migrations(&conn)?;

    info!("Offline store initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

impl DbState {
    /// Fresh in-memory store with the full schema applied.
    pub fn in_memory() -> StoreResult<DbState> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        run_migrations(&conn)?;
        Ok(DbState {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }

    /// Run `f` inside one SQLite transaction and commit it as a group.
    ///
    /// Nothing written by `f` is visible if it returns an error.
    pub fn transaction<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> StoreResult<T>,
    {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run a read-only closure against the connection.
    pub fn read<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T>,
    {
        let conn = self.conn.lock()?;
        f(&conn)
    }
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> StoreResult<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// UTC timestamp with millisecond precision. Lexicographic order matches
/// chronological order, which the queue relies on for `next_retry_at`.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Offline store schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating offline store from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: cache, queue, notifications, sync log, metadata, settings.
fn migrate_v1(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        -- entity_cache (one row per cached record, partitioned by store)
        CREATE TABLE IF NOT EXISTS entity_cache (
            entity_type TEXT NOT NULL,
            store_id TEXT NOT NULL,
            cache_key TEXT NOT NULL,
            remote_id TEXT,
            offline_id TEXT,
            client_ref TEXT,
            offline_status TEXT NOT NULL DEFAULT 'synced'
                CHECK (offline_status IN ('synced', 'pending', 'pending_update', 'failed')),
            data TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (entity_type, store_id, cache_key)
        );

        -- sync_queue (append-only payloads; status/attempts/error mutate)
        CREATE TABLE IF NOT EXISTS sync_queue (
            queue_id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            operation TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            store_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'synced', 'failed')),
            priority INTEGER NOT NULL DEFAULT 0,
            sync_attempts INTEGER NOT NULL DEFAULT 0,
            client_ref TEXT UNIQUE NOT NULL,
            error_message TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            synced_at TEXT
        );

        -- notifications (user-visible sync failures)
        CREATE TABLE IF NOT EXISTS notifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            store_id TEXT NOT NULL,
            level TEXT NOT NULL CHECK (level IN ('info', 'warning', 'error')),
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            queue_id INTEGER,
            is_read INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        -- sync_log (one row per drain)
        CREATE TABLE IF NOT EXISTS sync_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            store_id TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            outcome TEXT NOT NULL DEFAULT 'running'
                CHECK (outcome IN ('running', 'completed', 'paused', 'error')),
            success_count INTEGER NOT NULL DEFAULT 0,
            failed_count INTEGER NOT NULL DEFAULT 0,
            error TEXT
        );

        -- sync_metadata (per-store sync bookkeeping)
        CREATE TABLE IF NOT EXISTS sync_metadata (
            store_id TEXT PRIMARY KEY,
            last_sync_time TEXT,
            last_pull_time TEXT,
            updated_at TEXT NOT NULL
        );

        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_entity_cache_store_status
            ON entity_cache(store_id, offline_status);
        CREATE INDEX IF NOT EXISTS idx_entity_cache_type_store_status
            ON entity_cache(entity_type, store_id, offline_status);
        CREATE INDEX IF NOT EXISTS idx_entity_cache_store_created
            ON entity_cache(store_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_entity_cache_remote_id
            ON entity_cache(entity_type, store_id, remote_id);
        CREATE INDEX IF NOT EXISTS idx_entity_cache_offline_id
            ON entity_cache(entity_type, store_id, offline_id);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_type_status
            ON sync_queue(entity_type, status);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_store_status
            ON sync_queue(store_id, status);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_store_created
            ON sync_queue(store_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_notifications_store_read
            ON notifications(store_id, is_read);
        CREATE INDEX IF NOT EXISTS idx_sync_log_store_started
            ON sync_log(store_id, started_at);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        StoreError::from(e)
    })?;

    info!("Applied migration v1");
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> StoreResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Migration v2: sync queue retry scheduling.
///
/// Adds:
/// - `next_retry_at` for exponential backoff of transient failures
/// - `retryable` so validation rejections are not retried automatically
fn migrate_v2(conn: &Connection) -> StoreResult<()> {
    if !column_exists(conn, "sync_queue", "next_retry_at")? {
        conn.execute_batch("ALTER TABLE sync_queue ADD COLUMN next_retry_at TEXT;")?;
    }
    if !column_exists(conn, "sync_queue", "retryable")? {
        conn.execute_batch(
            "ALTER TABLE sync_queue ADD COLUMN retryable INTEGER NOT NULL DEFAULT 1;",
        )?;
    }
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_retry
            ON sync_queue(store_id, status, next_retry_at);
         INSERT INTO schema_version (version) VALUES (2);",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        StoreError::from(e)
    })?;

    info!("Applied migration v2 (sync queue retry scheduling)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> StoreResult<Option<String>> {
    let value = conn
        .query_row(
            "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
            params![category, key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}
