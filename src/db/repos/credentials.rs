use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::db::models::{
    format_ts, parse_ts, CreateCredentialInput, CredentialRecord, CredentialStatus, HealthState,
};
use crate::db::DbPool;
use crate::error::AppError;

// ============================================================================
// Row Mappers
// ============================================================================

fn ts_column(row: &Row, col: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<String>>(col)?.as_deref().and_then(parse_ts))
}

fn row_to_credential(row: &Row) -> rusqlite::Result<CredentialRecord> {
    let created_at = ts_column(row, "created_at")?.unwrap_or_else(Utc::now);
    Ok(CredentialRecord {
        id: row.get("id")?,
        service: row.get("service")?,
        key_hash: row.get("key_hash")?,
        encrypted_key: row.get("encrypted_key")?,
        name: row.get::<_, Option<String>>("name")?.unwrap_or_default(),
        monthly_limit: row.get::<_, Option<i64>>("monthly_limit")?.unwrap_or(0),
        daily_limit: row.get::<_, Option<i64>>("daily_limit")?.unwrap_or(0),
        usage_count: row.get::<_, Option<i64>>("usage_count")?.unwrap_or(0),
        daily_usage: row.get::<_, Option<i64>>("daily_usage")?.unwrap_or(0),
        total_usage: row.get::<_, Option<i64>>("total_usage")?.unwrap_or(0),
        status: CredentialStatus::from_db(row.get::<_, Option<String>>("status")?.as_deref()),
        suspended_until: ts_column(row, "suspended_until")?,
        consecutive_failures: row
            .get::<_, Option<i64>>("consecutive_failures")?
            .unwrap_or(0),
        last_used_at: ts_column(row, "last_used_at")?,
        last_reset_at: ts_column(row, "last_reset_at")?.unwrap_or(created_at),
        created_at,
    })
}

fn not_found(id: i64) -> AppError {
    AppError::NotFound(format!("Key {id}"))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

// ============================================================================
// Catalog CRUD
// ============================================================================

/// Insert a credential and return its new id. A repeated (service, key_hash)
/// pair surfaces as `AppError::Conflict`.
pub fn create(
    pool: &DbPool,
    input: &CreateCredentialInput,
    now: DateTime<Utc>,
) -> Result<i64, AppError> {
    let now = format_ts(now);
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO api_keys
         (service, key_hash, encrypted_key, name, monthly_limit, daily_limit,
          status, last_reset_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', ?7, ?7)",
        params![
            input.service,
            input.key_hash,
            input.encrypted_key,
            input.name,
            input.monthly_limit,
            input.daily_limit,
            now,
        ],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            AppError::Conflict("Key already exists".into())
        } else {
            AppError::Database(e)
        }
    })?;

    Ok(conn.last_insert_rowid())
}

pub fn get_by_id(pool: &DbPool, id: i64) -> Result<CredentialRecord, AppError> {
    let conn = pool.get()?;
    load(&conn, id)
}

pub fn get_by_service(pool: &DbPool, service: &str) -> Result<Vec<CredentialRecord>, AppError> {
    let conn = pool.get()?;
    load_by_service(&conn, service)
}

/// Delete a credential and its usage events. Returns `false` when no row matched.
pub fn delete(pool: &DbPool, id: i64) -> Result<bool, AppError> {
    let mut conn = pool.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    // Explicit cleanup so no orphans remain even if PRAGMA foreign_keys is off.
    tx.execute("DELETE FROM api_usage_log WHERE key_id = ?1", params![id])?;
    let rows = tx.execute("DELETE FROM api_keys WHERE id = ?1", params![id])?;
    tx.commit()?;
    Ok(rows > 0)
}

// ============================================================================
// Transaction-scoped helpers
//
// These take a `Connection` (a `Transaction` derefs to one) so the key manager
// can compose a read-modify-write into a single atomic unit.
// ============================================================================

pub fn load(conn: &Connection, id: i64) -> Result<CredentialRecord, AppError> {
    conn.query_row(
        "SELECT * FROM api_keys WHERE id = ?1",
        params![id],
        row_to_credential,
    )
    .optional()?
    .ok_or_else(|| not_found(id))
}

pub fn load_by_service(conn: &Connection, service: &str) -> Result<Vec<CredentialRecord>, AppError> {
    let mut stmt = conn.prepare("SELECT * FROM api_keys WHERE service = ?1 ORDER BY id")?;
    let rows = stmt.query_map(params![service], row_to_credential)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

pub fn reset_monthly_usage(conn: &Connection, id: i64, now: DateTime<Utc>) -> Result<(), AppError> {
    conn.execute(
        "UPDATE api_keys SET usage_count = 0, last_reset_at = ?1 WHERE id = ?2",
        params![format_ts(now), id],
    )?;
    Ok(())
}

pub fn reset_daily_usage(conn: &Connection, id: i64) -> Result<(), AppError> {
    conn.execute("UPDATE api_keys SET daily_usage = 0 WHERE id = ?1", params![id])?;
    Ok(())
}

/// Bump all three usage counters, clear the failure streak and stamp `last_used_at`.
pub fn record_use(conn: &Connection, id: i64, now: DateTime<Utc>) -> Result<(), AppError> {
    let rows = conn.execute(
        "UPDATE api_keys
         SET usage_count = usage_count + 1,
             daily_usage = daily_usage + 1,
             total_usage = total_usage + 1,
             consecutive_failures = 0,
             last_used_at = ?1
         WHERE id = ?2",
        params![format_ts(now), id],
    )?;
    if rows == 0 {
        return Err(not_found(id));
    }
    Ok(())
}

/// Persist a new health state (status, suspension expiry, failure streak).
pub fn write_health(
    conn: &Connection,
    id: i64,
    health: &HealthState,
    last_used_at: Option<DateTime<Utc>>,
) -> Result<(), AppError> {
    let rows = conn.execute(
        "UPDATE api_keys
         SET status = ?1,
             suspended_until = ?2,
             consecutive_failures = ?3,
             last_used_at = ?4
         WHERE id = ?5",
        params![
            health.status.as_str(),
            health.suspended_until.map(format_ts),
            health.consecutive_failures,
            last_used_at.map(format_ts),
            id,
        ],
    )?;
    if rows == 0 {
        return Err(not_found(id));
    }
    Ok(())
}

pub fn update_encrypted_key(conn: &Connection, id: i64, encrypted_key: &str) -> Result<(), AppError> {
    conn.execute(
        "UPDATE api_keys SET encrypted_key = ?1 WHERE id = ?2",
        params![encrypted_key, id],
    )?;
    Ok(())
}
