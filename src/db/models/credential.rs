use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Credential status
// ============================================================================

/// Health status of a stored credential. `Disabled` is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    #[default]
    Active,
    /// Temporarily out of rotation until `suspended_until`.
    Suspended,
    /// Rejected by the upstream as invalid. Never re-enabled automatically.
    Disabled,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Suspended => "suspended",
            CredentialStatus::Disabled => "disabled",
        }
    }

    /// Unknown or missing values read as `Active`, matching the column default.
    pub fn from_db(raw: Option<&str>) -> Self {
        match raw {
            Some("suspended") => CredentialStatus::Suspended,
            Some("disabled") => CredentialStatus::Disabled,
            _ => CredentialStatus::Active,
        }
    }
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Health state
// ============================================================================

/// The part of a credential the failure/success protocol mutates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthState {
    pub status: CredentialStatus,
    pub suspended_until: Option<DateTime<Utc>>,
    pub consecutive_failures: i64,
}

// ============================================================================
// Credential record
// ============================================================================

/// One row of the credential catalog.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialRecord {
    pub id: i64,
    pub service: String,
    pub key_hash: String,
    /// Never serialized; only the cipher reads it.
    #[serde(skip_serializing)]
    pub encrypted_key: String,
    pub name: String,
    /// 0 = unlimited.
    pub monthly_limit: i64,
    /// 0 = unlimited.
    pub daily_limit: i64,
    pub usage_count: i64,
    pub daily_usage: i64,
    pub total_usage: i64,
    pub status: CredentialStatus,
    pub suspended_until: Option<DateTime<Utc>>,
    pub consecutive_failures: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_reset_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl CredentialRecord {
    pub fn health(&self) -> HealthState {
        HealthState {
            status: self.status,
            suspended_until: self.suspended_until,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateCredentialInput {
    pub service: String,
    pub key_hash: String,
    pub encrypted_key: String,
    pub name: String,
    pub monthly_limit: i64,
    pub daily_limit: i64,
}

// ============================================================================
// Listing
// ============================================================================

/// Metadata view of a credential. Carries no secret material, encrypted or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CredentialSummary {
    pub id: i64,
    pub service: String,
    pub name: String,
    pub monthly_limit: i64,
    pub daily_limit: i64,
    pub usage_count: i64,
    pub daily_usage: i64,
    pub total_usage: i64,
    pub status: CredentialStatus,
    /// `usage_count / monthly_limit`, rounded to 4 places; 0 for unlimited credentials.
    pub usage_ratio: f64,
    pub suspended_until: Option<DateTime<Utc>>,
    pub consecutive_failures: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_reset_at: DateTime<Utc>,
}

impl From<&CredentialRecord> for CredentialSummary {
    fn from(rec: &CredentialRecord) -> Self {
        let usage_ratio = if rec.monthly_limit > 0 {
            let raw = rec.usage_count as f64 / rec.monthly_limit as f64;
            (raw * 10_000.0).round() / 10_000.0
        } else {
            0.0
        };

        Self {
            id: rec.id,
            service: rec.service.clone(),
            name: rec.name.clone(),
            monthly_limit: rec.monthly_limit,
            daily_limit: rec.daily_limit,
            usage_count: rec.usage_count,
            daily_usage: rec.daily_usage,
            total_usage: rec.total_usage,
            status: rec.status,
            usage_ratio,
            suspended_until: rec.suspended_until,
            consecutive_failures: rec.consecutive_failures,
            last_used_at: rec.last_used_at,
            last_reset_at: rec.last_reset_at,
        }
    }
}
