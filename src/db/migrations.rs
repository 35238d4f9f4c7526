use rusqlite::Connection;

use crate::error::AppError;

/// Apply the idempotent schema. Safe to run on every startup.
pub fn run(conn: &Connection) -> Result<(), AppError> {
    tracing::debug!("Running database migrations");

    conn.execute_batch(SCHEMA)?;

    tracing::info!("Database migrations complete");
    Ok(())
}

const SCHEMA: &str = r#"

-- ============================================================================
-- Credential catalog
-- ============================================================================

CREATE TABLE IF NOT EXISTS api_keys (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    service               TEXT NOT NULL DEFAULT 'google',
    key_hash              TEXT NOT NULL,
    encrypted_key         TEXT NOT NULL,
    name                  TEXT NOT NULL DEFAULT '',
    monthly_limit         INTEGER NOT NULL DEFAULT 0,
    daily_limit           INTEGER NOT NULL DEFAULT 0,
    usage_count           INTEGER NOT NULL DEFAULT 0,
    daily_usage           INTEGER NOT NULL DEFAULT 0,
    total_usage           INTEGER NOT NULL DEFAULT 0,
    status                TEXT NOT NULL DEFAULT 'active',
    suspended_until       TEXT,
    consecutive_failures  INTEGER NOT NULL DEFAULT 0,
    last_used_at          TEXT,
    last_reset_at         TEXT NOT NULL,
    created_at            TEXT NOT NULL,
    UNIQUE(service, key_hash)
);
CREATE INDEX IF NOT EXISTS idx_api_keys_service ON api_keys(service);

-- ============================================================================
-- Usage log (append-only)
-- ============================================================================

CREATE TABLE IF NOT EXISTS api_usage_log (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    key_id       INTEGER NOT NULL REFERENCES api_keys(id) ON DELETE CASCADE,
    timestamp    TEXT NOT NULL,
    status_code  INTEGER NOT NULL,
    error_type   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_api_usage_log_key ON api_usage_log(key_id, timestamp);

"#;
