use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::db::models::{format_ts, parse_ts, UsageEvent};
use crate::db::DbPool;
use crate::error::AppError;

const DEFAULT_LIMIT: i64 = 50;

fn row_to_event(row: &Row) -> rusqlite::Result<UsageEvent> {
    let raw_ts: String = row.get("timestamp")?;
    Ok(UsageEvent {
        id: row.get("id")?,
        key_id: row.get("key_id")?,
        timestamp: parse_ts(&raw_ts).unwrap_or_default(),
        status_code: row.get("status_code")?,
        error_type: row.get("error_type")?,
    })
}

/// Append one outcome record. Never updates existing rows.
pub fn append(
    conn: &Connection,
    key_id: i64,
    status_code: u16,
    error_type: &str,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    conn.execute(
        "INSERT INTO api_usage_log (key_id, timestamp, status_code, error_type)
         VALUES (?1, ?2, ?3, ?4)",
        params![key_id, format_ts(now), status_code, error_type],
    )?;
    Ok(())
}

/// Newest-first events for one credential.
pub fn get_by_key(
    pool: &DbPool,
    key_id: i64,
    limit: Option<i64>,
) -> Result<Vec<UsageEvent>, AppError> {
    let lim = limit.unwrap_or(DEFAULT_LIMIT);
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM api_usage_log
         WHERE key_id = ?1
         ORDER BY timestamp DESC, id DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![key_id, lim], row_to_event)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}
