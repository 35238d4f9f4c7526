use chrono::{DateTime, Utc};
use serde::Serialize;

/// One append-only outcome record against a credential.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageEvent {
    pub id: i64,
    pub key_id: i64,
    pub timestamp: DateTime<Utc>,
    /// 200 for success, otherwise the upstream status code reported.
    pub status_code: i64,
    /// Coarse tag: `success`, `rate_limit`, `auth`, `server`, `client` or `timeout`.
    pub error_type: String,
}
