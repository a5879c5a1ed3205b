//! User-visible notifications for sync failures that need attention.

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::db::now_iso;
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
        }
    }

    fn parse(raw: &str) -> StoreResult<Self> {
        match raw {
            "info" => Ok(Level::Info),
            "warning" => Ok(Level::Warning),
            "error" => Ok(Level::Error),
            other => Err(StoreError::Corrupt {
                kind: "notification level",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: i64,
    pub store_id: String,
    pub level: Level,
    pub title: String,
    pub message: String,
    pub queue_id: Option<i64>,
    pub is_read: bool,
    pub created_at: String,
}

pub fn record(
    conn: &Connection,
    store_id: &str,
    level: Level,
    title: &str,
    message: &str,
    queue_id: Option<i64>,
) -> StoreResult<i64> {
    conn.execute(
        "INSERT INTO notifications (store_id, level, title, message, queue_id, is_read, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
        params![store_id, level.as_str(), title, message, queue_id, now_iso()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn unread(conn: &Connection, store_id: &str) -> StoreResult<Vec<Notification>> {
    let mut stmt = conn.prepare(
        "SELECT id, store_id, level, title, message, queue_id, is_read, created_at
         FROM notifications WHERE store_id = ?1 AND is_read = 0
         ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![store_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<i64>>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, store_id, level, title, message, queue_id, is_read, created_at)| {
            Ok(Notification {
                id,
                store_id,
                level: Level::parse(&level)?,
                title,
                message,
                queue_id,
                is_read: is_read != 0,
                created_at,
            })
        })
        .collect()
}

pub fn mark_read(conn: &Connection, id: i64) -> StoreResult<bool> {
    let n = conn.execute("UPDATE notifications SET is_read = 1 WHERE id = ?1", params![id])?;
    Ok(n > 0)
}
