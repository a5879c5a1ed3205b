//! Per-store sync bookkeeping: last sync/pull times, queue counts and the
//! run log.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::time::Duration;

use crate::db::now_iso;
use crate::error::{StoreError, StoreResult};
use crate::queue;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncMetadata {
    pub store_id: String,
    pub last_sync_time: Option<String>,
    pub last_pull_time: Option<String>,
    /// Items not yet applied remotely, failed ones included. Same number
    /// as `pending_count`.
    pub pending_count: i64,
    /// The part of `pending_count` that has failed at least once.
    pub failed_count: i64,
}

pub fn get_last_sync_time(conn: &Connection, store_id: &str) -> StoreResult<Option<String>> {
    let value = conn
        .query_row(
            "SELECT last_sync_time FROM sync_metadata WHERE store_id = ?1",
            params![store_id],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?;
    Ok(value.flatten())
}

pub fn get_last_pull_time(conn: &Connection, store_id: &str) -> StoreResult<Option<String>> {
    let value = conn
        .query_row(
            "SELECT last_pull_time FROM sync_metadata WHERE store_id = ?1",
            params![store_id],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?;
    Ok(value.flatten())
}

pub fn set_last_sync(conn: &Connection, store_id: &str, at: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO sync_metadata (store_id, last_sync_time, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(store_id) DO UPDATE SET
            last_sync_time = excluded.last_sync_time,
            updated_at = excluded.updated_at",
        params![store_id, at, now_iso()],
    )?;
    Ok(())
}

pub fn set_last_pull(conn: &Connection, store_id: &str, at: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO sync_metadata (store_id, last_pull_time, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(store_id) DO UPDATE SET
            last_pull_time = excluded.last_pull_time,
            updated_at = excluded.updated_at",
        params![store_id, at, now_iso()],
    )?;
    Ok(())
}

/// Items not yet applied remotely.
pub fn pending_count(conn: &Connection, store_id: &str) -> StoreResult<i64> {
    queue::pending_count(conn, store_id)
}

pub fn sync_metadata(conn: &Connection, store_id: &str) -> StoreResult<SyncMetadata> {
    let counts = queue::counts(conn, store_id)?;
    Ok(SyncMetadata {
        store_id: store_id.to_string(),
        last_sync_time: get_last_sync_time(conn, store_id)?,
        last_pull_time: get_last_pull_time(conn, store_id)?,
        pending_count: counts.outstanding(),
        failed_count: counts.failed,
    })
}

fn parse_time(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt {
            kind: "timestamp",
            value: raw.to_string(),
        })
}

/// Whether cached reference data is older than `stale_after` (or was never
/// pulled).
pub fn needs_refresh(conn: &Connection, store_id: &str, stale_after: Duration, now: DateTime<Utc>) -> StoreResult<bool> {
    let Some(last) = get_last_pull_time(conn, store_id)? else {
        return Ok(true);
    };
    let age = now.signed_duration_since(parse_time(&last)?);
    let limit = ChronoDuration::from_std(stale_after).unwrap_or_else(|_| ChronoDuration::weeks(52 * 100));
    Ok(age >= limit)
}

// ---------------------------------------------------------------------------
// Sync log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Running,
    Completed,
    Paused,
    Error,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Running => "running",
            RunOutcome::Completed => "completed",
            RunOutcome::Paused => "paused",
            RunOutcome::Error => "error",
        }
    }

    fn parse(raw: &str) -> StoreResult<Self> {
        match raw {
            "running" => Ok(RunOutcome::Running),
            "completed" => Ok(RunOutcome::Completed),
            "paused" => Ok(RunOutcome::Paused),
            "error" => Ok(RunOutcome::Error),
            other => Err(StoreError::Corrupt {
                kind: "sync_log outcome",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncRun {
    pub id: i64,
    pub store_id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub outcome: RunOutcome,
    pub success_count: i64,
    pub failed_count: i64,
    pub error: Option<String>,
}

pub fn begin_run(conn: &Connection, store_id: &str) -> StoreResult<i64> {
    conn.execute(
        "INSERT INTO sync_log (store_id, started_at, outcome) VALUES (?1, ?2, 'running')",
        params![store_id, now_iso()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn finish_run(
    conn: &Connection,
    run_id: i64,
    outcome: RunOutcome,
    success_count: i64,
    failed_count: i64,
    error: Option<&str>,
) -> StoreResult<()> {
    conn.execute(
        "UPDATE sync_log
         SET finished_at = ?1, outcome = ?2, success_count = ?3, failed_count = ?4, error = ?5
         WHERE id = ?6",
        params![now_iso(), outcome.as_str(), success_count, failed_count, error, run_id],
    )?;
    Ok(())
}

/// Most recent runs first.
pub fn recent_runs(conn: &Connection, store_id: &str, limit: usize) -> StoreResult<Vec<SyncRun>> {
    let mut stmt = conn.prepare(
        "SELECT id, store_id, started_at, finished_at, outcome, success_count, failed_count, error
         FROM sync_log WHERE store_id = ?1
         ORDER BY id DESC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![store_id, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(
            |(id, store_id, started_at, finished_at, outcome, success_count, failed_count, error)| {
                Ok(SyncRun {
                    id,
                    store_id,
                    started_at,
                    finished_at,
                    outcome: RunOutcome::parse(&outcome)?,
                    success_count,
                    failed_count,
                    error,
                })
            },
        )
        .collect()
}
