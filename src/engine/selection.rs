//! Availability, load ranking and lazy reconciliation of quota windows.
//!
//! Everything here is a pure function of a [`CredentialRecord`] and a
//! timestamp, so the key manager can evaluate it inside a transaction and
//! tests can pin the clock.

use chrono::{DateTime, Datelike, Utc};

use crate::db::models::{CredentialRecord, CredentialStatus};

/// Unlimited credentials rank by raw usage scaled down by this divisor, so any
/// of them compares as less loaded than a quota-bound credential in use.
pub const UNLIMITED_RATIO_DIVISOR: f64 = 1_000_000.0;

// =============================================================================
// Availability & ranking
// =============================================================================

pub fn is_available(rec: &CredentialRecord, now: DateTime<Utc>) -> bool {
    match rec.status {
        CredentialStatus::Disabled => return false,
        CredentialStatus::Suspended => {
            if rec.suspended_until.is_some_and(|until| now < until) {
                return false;
            }
        }
        CredentialStatus::Active => {}
    }
    if rec.monthly_limit > 0 && rec.usage_count >= rec.monthly_limit {
        return false;
    }
    if rec.daily_limit > 0 && rec.daily_usage >= rec.daily_limit {
        return false;
    }
    true
}

/// Load metric used for ranking. Lower is preferred.
pub fn usage_ratio(rec: &CredentialRecord) -> f64 {
    if rec.monthly_limit > 0 {
        rec.usage_count as f64 / rec.monthly_limit as f64
    } else {
        rec.usage_count as f64 / UNLIMITED_RATIO_DIVISOR
    }
}

/// The available credential with the lowest usage ratio; ties go to the lowest id.
pub fn pick_best(records: &[CredentialRecord], now: DateTime<Utc>) -> Option<&CredentialRecord> {
    records
        .iter()
        .filter(|rec| is_available(rec, now))
        .min_by(|a, b| {
            usage_ratio(a)
                .total_cmp(&usage_ratio(b))
                .then_with(|| a.id.cmp(&b.id))
        })
}

// =============================================================================
// Lazy reset
// =============================================================================

/// Which windows of one credential have lapsed at `now`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetPlan {
    /// The calendar month changed since `last_reset_at`.
    pub monthly: bool,
    /// The credential was used on an earlier calendar day.
    pub daily: bool,
    /// Suspended and the expiry has passed.
    pub reactivate: bool,
}

impl ResetPlan {
    pub fn is_empty(&self) -> bool {
        !(self.monthly || self.daily || self.reactivate)
    }
}

pub fn reset_plan(rec: &CredentialRecord, now: DateTime<Utc>) -> ResetPlan {
    let monthly = (rec.last_reset_at.year(), rec.last_reset_at.month()) != (now.year(), now.month());
    let daily = rec
        .last_used_at
        .is_some_and(|used| used.date_naive() != now.date_naive());
    let reactivate = rec.status == CredentialStatus::Suspended
        && rec.suspended_until.is_some_and(|until| until <= now);

    ResetPlan {
        monthly,
        daily,
        reactivate,
    }
}

// =============================================================================
// Tests
// =============================================================================
