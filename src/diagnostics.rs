//! Diagnostics for the offline pipeline.
//!
//! Provides:
//! - **Logging setup**: console + daily rolling file via `tracing-appender`.
//! - **Log rotation helpers**: pruning old rolled files.
//! - **Sync health**: queue backlog, per-store sync metadata, recent errors
//!   and recent runs, for a support screen or a diagnostics dump.

use rusqlite::{params, Connection};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::db::DbState;
use crate::error::StoreResult;
use crate::metadata::{self, SyncMetadata, SyncRun};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

const LOG_FILE_PREFIX: &str = "pos-offline";
const DEFAULT_FILTER: &str = "info,small_pos_offline=debug";

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Write the file log as JSON lines instead of plain text.
    pub json_file: bool,
    pub keep_files: usize,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            json_file: false,
            keep_files: MAX_LOG_FILES,
        }
    }
}

/// Initialize structured logging (console + rolling file) with defaults.
///
/// Keep the returned guard alive for the lifetime of the process; dropping
/// it flushes and stops the file writer.
pub fn init_logging(log_dir: &Path) -> std::io::Result<WorkerGuard> {
    init_logging_with(log_dir, &LogOptions::default())
}

pub fn init_logging_with(log_dir: &Path, options: &LogOptions) -> std::io::Result<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    fs::create_dir_all(log_dir)?;
    prune_old_logs(log_dir, options.keep_files);

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let text_file_layer = (!options.json_file).then(|| {
        fmt::layer()
            .with_writer(non_blocking.clone())
            .with_ansi(false)
            .with_target(true)
    });
    let json_file_layer = options.json_file.then(|| {
        fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_target(true)
    });
    let console_layer = fmt::layer().with_target(true);

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(text_file_layer)
        .with(json_file_layer)
        .try_init();
    if let Err(e) = installed {
        // A host application may already own the global subscriber.
        warn!("Logging already initialized, keeping existing subscriber: {e}");
    }

    Ok(guard)
}

/// Platform log directory (`.../com.thesmall.pos/logs`).
pub fn get_log_dir() -> PathBuf {
    crate::config::default_data_dir().join("logs")
}

/// Prune old log files in `log_dir`, keeping only the most recent `keep`.
/// Returns the number of files removed.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> usize {
    if !log_dir.exists() {
        return 0;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first; ties broken by name so dated files order predictably.
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

// ---------------------------------------------------------------------------
// Sync health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacklogEntry {
    pub entity_type: String,
    pub status: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncErrorEntry {
    pub queue_id: i64,
    pub entity_type: String,
    pub operation: String,
    pub error: String,
    pub attempts: i64,
    pub retryable: bool,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncHealth {
    pub version: &'static str,
    pub schema_version: i32,
    pub db_size_bytes: u64,
    pub metadata: SyncMetadata,
    pub backlog: Vec<BacklogEntry>,
    pub recent_errors: Vec<SyncErrorEntry>,
    pub recent_runs: Vec<SyncRun>,
}

/// Snapshot of the sync pipeline for `store_id`.
pub fn sync_health(db: &DbState, store_id: &str) -> StoreResult<SyncHealth> {
    let db_size_bytes = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);
    db.read(|conn| {
        Ok(SyncHealth {
            version: env!("CARGO_PKG_VERSION"),
            schema_version: conn.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )?,
            db_size_bytes,
            metadata: metadata::sync_metadata(conn, store_id)?,
            backlog: sync_backlog(conn, store_id)?,
            recent_errors: recent_sync_errors(conn, store_id, 20)?,
            recent_runs: metadata::recent_runs(conn, store_id, 10)?,
        })
    })
}

fn sync_backlog(conn: &Connection, store_id: &str) -> StoreResult<Vec<BacklogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT entity_type, status, COUNT(*) FROM sync_queue
         WHERE store_id = ?1
         GROUP BY entity_type, status
         ORDER BY entity_type, status",
    )?;
    let rows = stmt
        .query_map(params![store_id], |row| {
            Ok(BacklogEntry {
                entity_type: row.get(0)?,
                status: row.get(1)?,
                count: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn recent_sync_errors(conn: &Connection, store_id: &str, limit: i64) -> StoreResult<Vec<SyncErrorEntry>> {
    let mut stmt = conn.prepare(
        "SELECT queue_id, entity_type, operation, error_message, sync_attempts, retryable, updated_at
         FROM sync_queue
         WHERE store_id = ?1 AND error_message IS NOT NULL AND error_message != ''
         ORDER BY updated_at DESC, queue_id DESC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![store_id, limit], |row| {
            Ok(SyncErrorEntry {
                queue_id: row.get(0)?,
                entity_type: row.get(1)?,
                operation: row.get(2)?,
                error: row.get(3)?,
                attempts: row.get(4)?,
                retryable: row.get::<_, i64>(5)? != 0,
                updated_at: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
