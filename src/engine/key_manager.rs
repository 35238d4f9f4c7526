//! The key manager: the single writer of credential health state.
//!
//! Holds no credential state in memory. Every call is a fresh
//! read-modify-write against the store, and every read path first runs the
//! lazy reset so expired suspensions and lapsed quota windows are corrected
//! without a background task.

use std::fmt;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::config::KeyPoolConfig;
use crate::db::models::{
    CreateCredentialInput, CredentialRecord, CredentialStatus, CredentialSummary, HealthState,
    UsageEvent,
};
use crate::db::repos::{credentials as cred_repo, usage_log};
use crate::db::{self, DbPool};
use crate::error::AppError;
use crate::validation;

use super::crypto::{MasterKey, SecretCipher};
use super::health::{self, ErrorClass, Transition};
use super::selection;

/// Id reported for the configuration-sourced fallback credential.
pub const FALLBACK_CREDENTIAL_ID: i64 = -1;

// =============================================================================
// Public types
// =============================================================================

/// Input for [`KeyManager::add`].
#[derive(Clone, Default)]
pub struct NewCredential {
    pub secret: String,
    pub name: String,
    /// 0 = unlimited.
    pub monthly_quota: i64,
    /// 0 = unlimited.
    pub daily_quota: i64,
}

impl NewCredential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn monthly_quota(mut self, quota: i64) -> Self {
        self.monthly_quota = quota;
        self
    }

    pub fn daily_quota(mut self, quota: i64) -> Self {
        self.daily_quota = quota;
        self
    }
}

impl fmt::Debug for NewCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewCredential")
            .field("secret", &"<redacted>")
            .field("name", &self.name)
            .field("monthly_quota", &self.monthly_quota)
            .field("daily_quota", &self.daily_quota)
            .finish()
    }
}

/// Which credential a success/failure report is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialHandle {
    Stored(i64),
    Fallback,
}

impl From<i64> for CredentialHandle {
    /// Non-positive ids are reserved for the fallback credential.
    fn from(id: i64) -> Self {
        if id > 0 {
            CredentialHandle::Stored(id)
        } else {
            CredentialHandle::Fallback
        }
    }
}

/// A persisted credential with its decrypted secret.
pub struct StoredCredential {
    pub record: CredentialRecord,
    secret: Zeroizing<String>,
}

/// The non-persisted secret taken from process configuration.
pub struct FallbackCredential {
    pub service: String,
    pub name: String,
    secret: Zeroizing<String>,
}

/// What [`KeyManager::select`] hands to the upstream-call wrapper.
pub enum Credential {
    Persisted(StoredCredential),
    EnvironmentFallback(FallbackCredential),
}

impl Credential {
    pub fn id(&self) -> i64 {
        match self {
            Credential::Persisted(c) => c.record.id,
            Credential::EnvironmentFallback(_) => FALLBACK_CREDENTIAL_ID,
        }
    }

    pub fn handle(&self) -> CredentialHandle {
        match self {
            Credential::Persisted(c) => CredentialHandle::Stored(c.record.id),
            Credential::EnvironmentFallback(_) => CredentialHandle::Fallback,
        }
    }

    pub fn secret(&self) -> &str {
        match self {
            Credential::Persisted(c) => &c.secret,
            Credential::EnvironmentFallback(c) => &c.secret,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Credential::Persisted(c) => &c.record.name,
            Credential::EnvironmentFallback(c) => &c.name,
        }
    }

    pub fn service(&self) -> &str {
        match self {
            Credential::Persisted(c) => &c.record.service,
            Credential::EnvironmentFallback(c) => &c.service,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Credential::EnvironmentFallback(_))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match self {
            Credential::Persisted(_) => "Persisted",
            Credential::EnvironmentFallback(_) => "EnvironmentFallback",
        };
        f.debug_struct(variant)
            .field("id", &self.id())
            .field("name", &self.name())
            .field("service", &self.service())
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedCredential {
    pub id: i64,
    pub name: String,
}

// =============================================================================
// KeyManager
// =============================================================================

struct FallbackSource {
    name: String,
    secret: Zeroizing<String>,
}

/// Selects credentials and applies the success/failure feedback protocol.
///
/// Construct once at startup and share by reference (or `Arc`); it is
/// `Send + Sync` and needs no locking beyond what SQLite provides.
pub struct KeyManager {
    pool: DbPool,
    cipher: SecretCipher,
    service: String,
    fallback: Option<FallbackSource>,
}

impl KeyManager {
    pub fn new(pool: DbPool, cipher: SecretCipher, config: &KeyPoolConfig) -> Self {
        let fallback = config.fallback_secret.as_ref().map(|secret| FallbackSource {
            name: config.fallback_label(),
            secret: Zeroizing::new(secret.clone()),
        });
        Self {
            pool,
            cipher,
            service: config.service.clone(),
            fallback,
        }
    }

    /// Open the store and master key described by `config`.
    ///
    /// Fails if the database cannot be opened or migrated, or the master key
    /// cannot be read or created; callers should abort startup.
    pub fn open(config: &KeyPoolConfig) -> Result<Self, AppError> {
        let pool = db::init_db(&config.db_path)?;
        let key = MasterKey::load_or_create(&config.master_key_path)?;
        let manager = Self::new(pool, SecretCipher::new(&key), config);
        tracing::info!(service = %manager.service, "Key manager ready");
        Ok(manager)
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    // -------------------------------------------------------------------------
    // Catalog
    // -------------------------------------------------------------------------

    /// Register a new secret. Returns the id assigned by the store.
    pub fn add(&self, input: NewCredential) -> Result<i64, AppError> {
        self.add_at(input, Utc::now())
    }

    pub fn add_at(&self, input: NewCredential, now: DateTime<Utc>) -> Result<i64, AppError> {
        validation::require_secret(&input.secret)?;
        validation::require_non_negative("monthly_limit", input.monthly_quota)?;
        validation::require_non_negative("daily_limit", input.daily_quota)?;

        let secret = Zeroizing::new(input.secret.trim().to_string());
        let record = CreateCredentialInput {
            service: self.service.clone(),
            key_hash: hash_secret(&secret),
            encrypted_key: self.cipher.encrypt(&secret)?,
            name: input.name.trim().to_string(),
            monthly_limit: input.monthly_quota,
            daily_limit: input.daily_quota,
        };

        let id = cred_repo::create(&self.pool, &record, now)?;
        tracing::info!(key_id = id, service = %self.service, "Added key");
        Ok(id)
    }

    pub fn remove(&self, id: i64) -> Result<RemovedCredential, AppError> {
        let existing = {
            let conn = self.pool.get()?;
            self.load_own(&conn, id)?
        };
        if !cred_repo::delete(&self.pool, id)? {
            return Err(AppError::NotFound(format!("Key {id}")));
        }
        tracing::info!(key_id = id, name = %existing.name, "Removed key");
        Ok(RemovedCredential {
            id,
            name: existing.name,
        })
    }

    /// Metadata for every credential of this service, after lazy reset.
    pub fn list(&self) -> Result<Vec<CredentialSummary>, AppError> {
        self.list_at(Utc::now())
    }

    pub fn list_at(&self, now: DateTime<Utc>) -> Result<Vec<CredentialSummary>, AppError> {
        self.lazy_reset(now)?;
        let records = cred_repo::get_by_service(&self.pool, &self.service)?;
        Ok(records.iter().map(CredentialSummary::from).collect())
    }

    /// Newest-first audit trail of one credential (default limit 50).
    pub fn usage_events(&self, id: i64, limit: Option<i64>) -> Result<Vec<UsageEvent>, AppError> {
        {
            let conn = self.pool.get()?;
            self.load_own(&conn, id)?;
        }
        usage_log::get_by_key(&self.pool, id, limit)
    }

    // -------------------------------------------------------------------------
    // Selection
    // -------------------------------------------------------------------------

    /// The least-loaded available credential, else the fallback, else `None`.
    pub fn select(&self) -> Result<Option<Credential>, AppError> {
        self.select_at(Utc::now())
    }

    pub fn select_at(&self, now: DateTime<Utc>) -> Result<Option<Credential>, AppError> {
        self.lazy_reset(now)?;

        let records = cred_repo::get_by_service(&self.pool, &self.service)?;
        if let Some(best) = selection::pick_best(&records, now) {
            tracing::debug!(
                key_id = best.id,
                name = %best.name,
                usage_ratio = selection::usage_ratio(best),
                "Selected key"
            );
            let secret = Zeroizing::new(self.cipher.decrypt_or_passthrough(&best.encrypted_key));
            return Ok(Some(Credential::Persisted(StoredCredential {
                record: best.clone(),
                secret,
            })));
        }

        match &self.fallback {
            Some(source) => {
                tracing::debug!(service = %self.service, "Using configured fallback key");
                Ok(Some(Credential::EnvironmentFallback(FallbackCredential {
                    service: self.service.clone(),
                    name: source.name.clone(),
                    secret: source.secret.clone(),
                })))
            }
            None => {
                tracing::warn!(service = %self.service, "No API key available");
                Ok(None)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Feedback
    // -------------------------------------------------------------------------

    pub fn report_success(&self, handle: impl Into<CredentialHandle>) -> Result<(), AppError> {
        self.report_success_at(handle, Utc::now())
    }

    pub fn report_success_at(
        &self,
        handle: impl Into<CredentialHandle>,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let id = match handle.into() {
            CredentialHandle::Stored(id) => id,
            CredentialHandle::Fallback => return Ok(()),
        };

        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let record = self.load_own(&tx, id)?;
        roll_daily_window(&tx, &record, now)?;
        cred_repo::record_use(&tx, id, now)?;
        usage_log::append(
            &tx,
            id,
            health::SUCCESS_STATUS,
            ErrorClass::Success.as_str(),
            now,
        )?;
        tx.commit()?;

        tracing::debug!(key_id = id, "Reported success");
        Ok(())
    }

    /// Feed an upstream failure into the state machine. The status code is
    /// data: the call only fails for unknown ids or storage faults.
    pub fn report_failure(
        &self,
        handle: impl Into<CredentialHandle>,
        status_code: u16,
    ) -> Result<(), AppError> {
        self.report_failure_at(handle, status_code, Utc::now())
    }

    pub fn report_failure_at(
        &self,
        handle: impl Into<CredentialHandle>,
        status_code: u16,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let id = match handle.into() {
            CredentialHandle::Stored(id) => id,
            CredentialHandle::Fallback => {
                tracing::warn!(status_code, "Fallback key got an upstream error");
                return Ok(());
            }
        };

        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let record = self.load_own(&tx, id)?;
        if record.status != CredentialStatus::Disabled {
            roll_daily_window(&tx, &record, now)?;
        }
        let outcome = health::on_failure(&record.health(), status_code, now);
        let last_used_at = if record.status == CredentialStatus::Disabled {
            record.last_used_at
        } else {
            Some(now)
        };
        cred_repo::write_health(&tx, id, &outcome.next, last_used_at)?;
        usage_log::append(
            &tx,
            id,
            status_code,
            ErrorClass::from_status(status_code).as_str(),
            now,
        )?;
        tx.commit()?;

        match outcome.transition {
            Transition::SuspendedRateLimit { until } => {
                tracing::warn!(key_id = id, %until, status_code, "Key suspended (rate limited)");
            }
            Transition::SuspendedCircuitBreaker { until, failures } => {
                tracing::warn!(
                    key_id = id,
                    %until,
                    failures,
                    "Key suspended (circuit breaker: {} failures)",
                    failures
                );
            }
            Transition::Disabled => {
                tracing::error!(key_id = id, status_code, "Key disabled permanently");
            }
            Transition::Unchanged => {
                tracing::debug!(
                    key_id = id,
                    status_code,
                    failures = outcome.next.consecutive_failures,
                    "Reported failure"
                );
            }
        }
        Ok(())
    }

    /// Report a failure described only by the upstream's error message.
    pub fn report_upstream_error(
        &self,
        handle: impl Into<CredentialHandle>,
        message: &str,
    ) -> Result<(), AppError> {
        self.report_failure(handle, health::classify_upstream_error(message))
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Encrypt rows still holding plaintext from before encryption existed.
    /// Runs in one transaction; returns how many rows were rewritten.
    pub fn encrypt_legacy_plaintext(&self) -> Result<usize, AppError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut migrated = 0;
        for record in cred_repo::load_by_service(&tx, &self.service)? {
            if self.cipher.is_ciphertext(&record.encrypted_key) {
                continue;
            }
            let encrypted = self.cipher.encrypt(&record.encrypted_key)?;
            cred_repo::update_encrypted_key(&tx, record.id, &encrypted)?;
            migrated += 1;
        }
        tx.commit()?;

        if migrated > 0 {
            tracing::info!(migrated, "Encrypted legacy plaintext keys");
        }
        Ok(migrated)
    }

    /// Load a credential of this manager's service. Rows filed under another
    /// service are reported as missing.
    fn load_own(&self, conn: &Connection, id: i64) -> Result<CredentialRecord, AppError> {
        let record = cred_repo::load(conn, id)?;
        if record.service != self.service {
            return Err(AppError::NotFound(format!("Key {id}")));
        }
        Ok(record)
    }

    /// Reconcile quota windows and suspension expiry against `now`.
    fn lazy_reset(&self, now: DateTime<Utc>) -> Result<(), AppError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        for record in cred_repo::load_by_service(&tx, &self.service)? {
            let plan = selection::reset_plan(&record, now);
            if plan.is_empty() {
                continue;
            }
            if plan.monthly {
                cred_repo::reset_monthly_usage(&tx, record.id, now)?;
            }
            if plan.daily {
                cred_repo::reset_daily_usage(&tx, record.id)?;
            }
            if plan.reactivate {
                let health = HealthState {
                    status: CredentialStatus::Active,
                    suspended_until: None,
                    consecutive_failures: 0,
                };
                cred_repo::write_health(&tx, record.id, &health, record.last_used_at)?;
                tracing::info!(key_id = record.id, "Suspension expired, key reactivated");
            }
            tracing::debug!(key_id = record.id, ?plan, "Lazy reset applied");
        }

        tx.commit()?;
        Ok(())
    }
}

/// Zero the daily counter if `record` was last used on an earlier day.
/// Reports stamp `last_used_at`, so the pending reset must land first.
fn roll_daily_window(
    conn: &Connection,
    record: &CredentialRecord,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    if selection::reset_plan(record, now).daily {
        cred_repo::reset_daily_usage(conn, record.id)?;
    }
    Ok(())
}

/// Stable, non-reversible fingerprint used for de-duplication.
fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::error::ValidationError;
    use chrono::{Duration, TimeZone};
    use rusqlite::params;

    fn manager() -> KeyManager {
        manager_with_fallback(None)
    }

    fn manager_with_fallback(fallback: Option<&str>) -> KeyManager {
        let pool = init_test_db().unwrap();
        let config = KeyPoolConfig::in_dir(&std::env::temp_dir())
            .with_fallback_secret(fallback.map(str::to_string));
        KeyManager::new(pool, SecretCipher::new(&MasterKey::generate()), &config)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
    }

    fn set_usage(km: &KeyManager, id: i64, usage: i64) {
        let conn = km.pool().get().unwrap();
        conn.execute(
            "UPDATE api_keys SET usage_count = ?1 WHERE id = ?2",
            params![usage, id],
        )
        .unwrap();
    }

    fn summary(km: &KeyManager, id: i64, at: DateTime<Utc>) -> CredentialSummary {
        km.list_at(at)
            .unwrap()
            .into_iter()
            .find(|s| s.id == id)
            .unwrap()
    }

    // -- add / remove / list ------------------------------------------------

    #[test]
    fn test_add_key() {
        let km = manager();
        let id = km
            .add(NewCredential::new("test_key_123").name("Test Key").monthly_quota(100))
            .unwrap();
        assert!(id > 0);

        let listed = km.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "Test Key");
        assert_eq!(listed[0].monthly_limit, 100);
        assert_eq!(listed[0].status, CredentialStatus::Active);
    }

    #[test]
    fn test_add_rejects_invalid_input() {
        let km = manager();
        for blank in ["", "   "] {
            let err = km.add(NewCredential::new(blank)).unwrap_err();
            assert!(matches!(err, AppError::Validation(ValidationError::EmptySecret)));
        }

        let err = km.add(NewCredential::new("k").monthly_quota(-1)).unwrap_err();
        assert!(matches!(
            err,
            AppError::Validation(ValidationError::NegativeQuota { field: "monthly_limit" })
        ));
        let err = km.add(NewCredential::new("k").daily_quota(-1)).unwrap_err();
        assert!(matches!(
            err,
            AppError::Validation(ValidationError::NegativeQuota { field: "daily_limit" })
        ));

        // Nothing was written.
        assert!(km.list().unwrap().is_empty());
    }

    #[test]
    fn test_add_duplicate_key() {
        let km = manager();
        km.add(NewCredential::new("same_key")).unwrap();
        let err = km.add(NewCredential::new("same_key")).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert!(err.to_string().to_lowercase().contains("already exists"));

        // Surrounding whitespace does not make a different secret.
        let err = km.add(NewCredential::new("  same_key\n")).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn test_add_stores_encrypted() {
        let km = manager();
        let id = km.add(NewCredential::new("my_secret_api_key_xyz")).unwrap();

        let stored = cred_repo::get_by_id(km.pool(), id).unwrap();
        assert_ne!(stored.encrypted_key, "my_secret_api_key_xyz");
        assert!(!stored.encrypted_key.contains("my_secret_api_key_xyz"));
        assert_eq!(stored.key_hash, hash_secret("my_secret_api_key_xyz"));
    }

    #[test]
    fn test_list_never_exposes_secret_material() {
        let km = manager();
        let id = km.add(NewCredential::new("list_secret_value")).unwrap();
        let stored = cred_repo::get_by_id(km.pool(), id).unwrap();

        let json = serde_json::to_string(&km.list().unwrap()).unwrap();
        assert!(!json.contains("list_secret_value"));
        assert!(!json.contains(&stored.encrypted_key));
        assert!(!json.contains(&stored.key_hash));
    }

    #[test]
    fn test_remove_key() {
        let km = manager();
        let id = km.add(NewCredential::new("to_remove").name("Remove Me")).unwrap();
        km.report_success(id).unwrap();

        let removed = km.remove(id).unwrap();
        assert_eq!(removed, RemovedCredential { id, name: "Remove Me".into() });
        assert!(km.list().unwrap().is_empty());
    }

    #[test]
    fn test_remove_nonexistent_key() {
        let km = manager();
        let err = km.remove(99999).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(err.to_string(), "Not found: Key 99999");
    }

    // -- selection --------------------------------------------------------------

    #[test]
    fn test_select_usage_ratio_balancing() {
        let km = manager();
        let k1 = km.add(NewCredential::new("key1").monthly_quota(100)).unwrap();
        let k2 = km.add(NewCredential::new("key2").monthly_quota(100)).unwrap();
        set_usage(&km, k1, 80);
        set_usage(&km, k2, 20);

        let selected = km.select().unwrap().unwrap();
        assert_eq!(selected.id(), k2);
        assert_eq!(selected.secret(), "key2");
        assert!(!selected.is_fallback());
    }

    #[test]
    fn test_select_ties_go_to_lowest_id() {
        let km = manager();
        let k1 = km.add(NewCredential::new("key1")).unwrap();
        km.add(NewCredential::new("key2")).unwrap();
        assert_eq!(km.select().unwrap().unwrap().id(), k1);
    }

    #[test]
    fn test_select_skips_exhausted_quota() {
        let km = manager();
        let k1 = km.add(NewCredential::new("key1").monthly_quota(10)).unwrap();
        let k2 = km.add(NewCredential::new("key2").monthly_quota(1000)).unwrap();
        set_usage(&km, k1, 10);
        set_usage(&km, k2, 900);
        assert_eq!(km.select().unwrap().unwrap().id(), k2);

        set_usage(&km, k2, 1000);
        assert!(km.select().unwrap().is_none());
    }

    #[test]
    fn test_select_skips_exhausted_daily_quota() {
        let km = manager();
        let k1 = km.add_at(NewCredential::new("key1").daily_quota(2), now()).unwrap();
        let k2 = km.add_at(NewCredential::new("key2").monthly_quota(100), now()).unwrap();
        set_usage(&km, k2, 50);

        km.report_success_at(k1, now()).unwrap();
        assert_eq!(km.select_at(now()).unwrap().unwrap().id(), k1);
        km.report_success_at(k1, now()).unwrap();
        assert_eq!(km.select_at(now()).unwrap().unwrap().id(), k2);

        // Next day the daily window lapses.
        assert_eq!(
            km.select_at(now() + Duration::days(1)).unwrap().unwrap().id(),
            k1
        );
    }

    #[test]
    fn test_suspended_key_excluded() {
        let km = manager();
        let k1 = km.add(NewCredential::new("key1")).unwrap();
        let k2 = km.add(NewCredential::new("key2")).unwrap();
        set_usage(&km, k1, 10);

        let future = Utc::now() + Duration::hours(1);
        let conn = km.pool().get().unwrap();
        conn.execute(
            "UPDATE api_keys SET status = 'suspended', suspended_until = ?1 WHERE id = ?2",
            params![crate::db::models::format_ts(future), k2],
        )
        .unwrap();
        drop(conn);

        assert_eq!(km.select().unwrap().unwrap().id(), k1);
    }

    #[test]
    fn test_disabled_key_excluded() {
        let km = manager();
        let id = km.add(NewCredential::new("key1")).unwrap();
        km.report_failure(id, 401).unwrap();
        assert!(km.select().unwrap().is_none());
    }

    #[test]
    fn test_env_fallback() {
        let km = manager_with_fallback(Some("env_fallback_key"));
        let selected = km.select().unwrap().unwrap();
        assert!(selected.is_fallback());
        assert_eq!(selected.id(), FALLBACK_CREDENTIAL_ID);
        assert_eq!(selected.handle(), CredentialHandle::Fallback);
        assert_eq!(selected.secret(), "env_fallback_key");
        assert!(selected.name().contains(".env"));

        // Reports against the fallback are discarded.
        km.report_success(selected.handle()).unwrap();
        km.report_failure(selected.handle(), 401).unwrap();
        km.report_failure(FALLBACK_CREDENTIAL_ID, 500).unwrap();
        assert!(km.list().unwrap().is_empty());
        assert!(km.select().unwrap().unwrap().is_fallback());
    }

    #[test]
    fn test_fallback_only_when_pool_exhausted() {
        let km = manager_with_fallback(Some("env_fallback_key"));
        let id = km.add(NewCredential::new("stored")).unwrap();
        assert_eq!(km.select().unwrap().unwrap().id(), id);

        km.report_failure(id, 403).unwrap();
        assert!(km.select().unwrap().unwrap().is_fallback());
    }

    #[test]
    fn test_select_returns_decrypted_secret() {
        let km = manager();
        km.add(NewCredential::new("my_secret_api_key_abc")).unwrap();
        let selected = km.select().unwrap().unwrap();
        assert_eq!(selected.secret(), "my_secret_api_key_abc");
        assert!(!format!("{selected:?}").contains("my_secret_api_key_abc"));
    }

    #[test]
    fn test_select_reads_legacy_plaintext_rows() {
        let km = manager();
        let id = km.add(NewCredential::new("placeholder")).unwrap();
        let conn = km.pool().get().unwrap();
        conn.execute(
            "UPDATE api_keys SET encrypted_key = 'legacy_plain_key' WHERE id = ?1",
            params![id],
        )
        .unwrap();
        drop(conn);

        assert_eq!(km.select().unwrap().unwrap().secret(), "legacy_plain_key");
    }

    #[test]
    fn test_select_ignores_other_services() {
        let km = manager();
        let conn = km.pool().get().unwrap();
        conn.execute(
            "INSERT INTO api_keys (service, key_hash, encrypted_key, last_reset_at, created_at)
             VALUES ('openai', 'h', 'sk-other', ?1, ?1)",
            params![crate::db::models::format_ts(Utc::now())],
        )
        .unwrap();
        drop(conn);

        assert!(km.select().unwrap().is_none());
        assert!(km.list().unwrap().is_empty());
    }

    // -- feedback -----------------------------------------------------------------

    #[test]
    fn test_report_success() {
        let km = manager();
        let id = km.add(NewCredential::new("key1")).unwrap();
        for _ in 0..3 {
            km.report_success(id).unwrap();
        }

        let s = &km.list().unwrap()[0];
        assert_eq!((s.usage_count, s.daily_usage, s.total_usage), (3, 3, 3));
        assert!(s.last_used_at.is_some());

        let events = km.usage_events(id, None).unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.status_code == 200 && e.error_type == "success"));
    }

    #[test]
    fn test_report_failure_suspends_on_429() {
        let km = manager();
        let id = km.add_at(NewCredential::new("key1"), now()).unwrap();
        km.report_failure_at(id, 429, now()).unwrap();

        let s = summary(&km, id, now());
        assert_eq!(s.status, CredentialStatus::Suspended);
        assert_eq!(s.suspended_until, Some(now() + Duration::minutes(15)));
        assert_eq!(s.consecutive_failures, 1);

        let events = km.usage_events(id, None).unwrap();
        assert_eq!(events[0].status_code, 429);
        assert_eq!(events[0].error_type, "rate_limit");
    }

    #[test]
    fn test_report_failure_disables_on_401() {
        let km = manager();
        let id = km.add_at(NewCredential::new("key1"), now()).unwrap();
        km.report_failure_at(id, 401, now()).unwrap();
        assert_eq!(summary(&km, id, now()).status, CredentialStatus::Disabled);

        // Failures against a disabled key leave the streak frozen.
        km.report_failure_at(id, 500, now()).unwrap();
        assert_eq!(summary(&km, id, now()).consecutive_failures, 1);

        // A success still clears the streak but nothing brings it back.
        km.report_success_at(id, now()).unwrap();
        let s = summary(&km, id, now());
        assert_eq!(s.status, CredentialStatus::Disabled);
        assert_eq!(s.consecutive_failures, 0);
        assert_eq!(s.total_usage, 1);

        let later = now() + Duration::days(40);
        let s = summary(&km, id, later);
        assert_eq!(s.status, CredentialStatus::Disabled);
        assert!(s.suspended_until.is_none());
        assert!(km.select_at(later).unwrap().is_none());

        let events = km.usage_events(id, None).unwrap();
        assert!(events.iter().any(|e| e.error_type == "auth"));
    }

    #[test]
    fn test_circuit_breaker() {
        let km = manager();
        let id = km.add_at(NewCredential::new("key1"), now()).unwrap();
        for _ in 0..health::MAX_CONSECUTIVE_FAILURES {
            km.report_failure_at(id, 500, now()).unwrap();
        }

        let s = summary(&km, id, now());
        assert_eq!(s.status, CredentialStatus::Suspended);
        assert_eq!(s.consecutive_failures, health::MAX_CONSECUTIVE_FAILURES);
        assert!(s.suspended_until.is_some());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let km = manager();
        let id = km.add_at(NewCredential::new("key1"), now()).unwrap();

        for _ in 0..4 {
            km.report_failure_at(id, 500, now()).unwrap();
        }
        assert_eq!(summary(&km, id, now()).consecutive_failures, 4);

        km.report_success_at(id, now()).unwrap();
        assert_eq!(summary(&km, id, now()).consecutive_failures, 0);

        // The streak restarts from zero: four more failures stay active.
        for _ in 0..4 {
            km.report_failure_at(id, 500, now()).unwrap();
        }
        assert_eq!(summary(&km, id, now()).status, CredentialStatus::Active);
        km.report_failure_at(id, 500, now()).unwrap();
        assert_eq!(summary(&km, id, now()).status, CredentialStatus::Suspended);
    }

    #[test]
    fn test_suspension_expires_after_cooldown() {
        let km = manager();
        let id = km.add_at(NewCredential::new("key1"), now()).unwrap();
        km.report_failure_at(id, 429, now()).unwrap();

        let almost = now() + Duration::minutes(15) - Duration::seconds(1);
        assert!(km.select_at(almost).unwrap().is_none());
        assert_eq!(summary(&km, id, almost).status, CredentialStatus::Suspended);

        let expired = now() + Duration::minutes(15);
        assert_eq!(km.select_at(expired).unwrap().unwrap().id(), id);

        let s = summary(&km, id, expired);
        assert_eq!(s.status, CredentialStatus::Active);
        assert!(s.suspended_until.is_none());
        assert_eq!(s.consecutive_failures, 0);
    }

    #[test]
    fn test_failures_while_suspended_do_not_extend() {
        let km = manager();
        let id = km.add_at(NewCredential::new("key1"), now()).unwrap();
        km.report_failure_at(id, 429, now()).unwrap();
        km.report_failure_at(id, 429, now() + Duration::minutes(5)).unwrap();
        km.report_failure_at(id, 401, now() + Duration::minutes(6)).unwrap();

        let s = summary(&km, id, now() + Duration::minutes(6));
        assert_eq!(s.status, CredentialStatus::Suspended);
        assert_eq!(s.suspended_until, Some(now() + Duration::minutes(15)));
        assert_eq!(s.consecutive_failures, 3);
    }

    #[test]
    fn test_report_unknown_id_is_not_found() {
        let km = manager();
        assert!(matches!(km.report_success(4242), Err(AppError::NotFound(_))));
        assert!(matches!(km.report_failure(4242, 500), Err(AppError::NotFound(_))));
        assert!(matches!(km.usage_events(4242, None), Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_other_service_rows_are_not_found() {
        let km = manager();
        let conn = km.pool().get().unwrap();
        conn.execute(
            "INSERT INTO api_keys (service, key_hash, encrypted_key, last_reset_at, created_at)
             VALUES ('openai', 'h', 'sk-other', ?1, ?1)",
            params![crate::db::models::format_ts(Utc::now())],
        )
        .unwrap();
        let foreign = conn.last_insert_rowid();
        drop(conn);

        assert!(matches!(km.remove(foreign), Err(AppError::NotFound(_))));
        assert!(matches!(km.report_success(foreign), Err(AppError::NotFound(_))));
        assert!(matches!(km.report_failure(foreign, 401), Err(AppError::NotFound(_))));
        assert!(matches!(km.usage_events(foreign, None), Err(AppError::NotFound(_))));

        let untouched = cred_repo::get_by_id(km.pool(), foreign).unwrap();
        assert_eq!(untouched.service, "openai");
        assert_eq!(untouched.status, CredentialStatus::Active);
        assert_eq!(untouched.total_usage, 0);
        assert!(usage_log::get_by_key(km.pool(), foreign, None).unwrap().is_empty());
    }

    #[test]
    fn test_report_upstream_error() {
        let km = manager();
        let id = km.add(NewCredential::new("key1")).unwrap();
        km.report_upstream_error(id, "429 RESOURCE_EXHAUSTED").unwrap();
        assert_eq!(km.list().unwrap()[0].status, CredentialStatus::Suspended);

        let other = km.add(NewCredential::new("key2")).unwrap();
        km.report_upstream_error(other, "PERMISSION_DENIED").unwrap();
        let events = km.usage_events(other, None).unwrap();
        assert_eq!(events[0].status_code, 403);
    }

    // -- lazy reset ---------------------------------------------------------------

    #[test]
    fn test_monthly_reset() {
        let km = manager();
        let id = km.add_at(NewCredential::new("key1").monthly_quota(100), now()).unwrap();
        set_usage(&km, id, 100);
        assert!(km.select_at(now()).unwrap().is_none());

        let next_month = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 1).unwrap();
        assert_eq!(km.select_at(next_month).unwrap().unwrap().id(), id);

        let s = summary(&km, id, next_month);
        assert_eq!(s.usage_count, 0);
        assert_eq!(s.last_reset_at, next_month);
    }

    #[test]
    fn test_daily_reset_keeps_lifetime_usage() {
        let km = manager();
        let id = km.add_at(NewCredential::new("key1"), now()).unwrap();
        km.report_success_at(id, now()).unwrap();
        km.report_success_at(id, now()).unwrap();

        let tomorrow = now() + Duration::days(1);
        let s = summary(&km, id, tomorrow);
        assert_eq!(s.daily_usage, 0);
        assert_eq!(s.usage_count, 2);
        assert_eq!(s.total_usage, 2);
    }

    fn just_before_midnight() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 23, 59, 0).unwrap()
    }

    fn just_after_midnight() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 11, 0, 0, 5).unwrap()
    }

    #[test]
    fn test_failure_after_midnight_keeps_daily_reset() {
        let km = manager();
        let id = km.add_at(NewCredential::new("key1").daily_quota(2), now()).unwrap();
        km.report_success_at(id, just_before_midnight()).unwrap();
        km.report_success_at(id, just_before_midnight()).unwrap();
        assert!(km.select_at(just_before_midnight()).unwrap().is_none());

        km.report_failure_at(id, 500, just_after_midnight()).unwrap();

        let noon = Utc.with_ymd_and_hms(2026, 3, 11, 12, 0, 0).unwrap();
        let s = summary(&km, id, noon);
        assert_eq!(s.daily_usage, 0);
        assert_eq!(s.usage_count, 2);
        assert_eq!(km.select_at(noon).unwrap().unwrap().id(), id);
    }

    #[test]
    fn test_success_after_midnight_counts_only_today() {
        let km = manager();
        let id = km.add_at(NewCredential::new("key1").daily_quota(2), now()).unwrap();
        km.report_success_at(id, just_before_midnight()).unwrap();
        km.report_success_at(id, just_before_midnight()).unwrap();

        km.report_success_at(id, just_after_midnight()).unwrap();

        let s = summary(&km, id, just_after_midnight());
        assert_eq!(s.daily_usage, 1);
        assert_eq!(s.usage_count, 3);
        assert_eq!(s.total_usage, 3);
        assert_eq!(
            km.select_at(just_after_midnight()).unwrap().unwrap().id(),
            id
        );
    }

    #[test]
    fn test_end_to_end_ratio_selection() {
        let km = manager();
        let a = km.add(NewCredential::new("alpha").monthly_quota(100)).unwrap();
        let b = km.add(NewCredential::new("beta").monthly_quota(100)).unwrap();
        set_usage(&km, a, 80);
        set_usage(&km, b, 20);

        let selected = km.select().unwrap().unwrap();
        assert_eq!(selected.id(), b);
        km.report_success(selected.handle()).unwrap();

        let listed = km.list().unwrap();
        let beta = listed.iter().find(|s| s.id == b).unwrap();
        assert_eq!(beta.usage_count, 21);
        assert_eq!(beta.usage_ratio, 0.21);
    }

    // -- maintenance --------------------------------------------------------------

    #[test]
    fn test_encrypt_legacy_plaintext() {
        let km = manager();
        let legacy = km.add(NewCredential::new("placeholder")).unwrap();
        let modern = km.add(NewCredential::new("modern_key")).unwrap();
        let conn = km.pool().get().unwrap();
        conn.execute(
            "UPDATE api_keys SET encrypted_key = 'legacy_plain_key' WHERE id = ?1",
            params![legacy],
        )
        .unwrap();
        drop(conn);
        let modern_before = cred_repo::get_by_id(km.pool(), modern).unwrap().encrypted_key;

        assert_eq!(km.encrypt_legacy_plaintext().unwrap(), 1);
        assert_eq!(km.encrypt_legacy_plaintext().unwrap(), 0);

        let rewritten = cred_repo::get_by_id(km.pool(), legacy).unwrap().encrypted_key;
        assert_ne!(rewritten, "legacy_plain_key");
        assert_eq!(
            cred_repo::get_by_id(km.pool(), modern).unwrap().encrypted_key,
            modern_before
        );
        assert_eq!(km.select().unwrap().unwrap().secret(), "legacy_plain_key");
    }

    #[test]
    fn test_open_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = KeyPoolConfig::in_dir(dir.path());
        let id = {
            let km = KeyManager::open(&config).unwrap();
            km.add(NewCredential::new("persisted_key")).unwrap()
        };
        assert!(config.master_key_path.exists());

        // A second instance reuses the same master key and sees the same rows.
        let km = KeyManager::open(&config).unwrap();
        let selected = km.select().unwrap().unwrap();
        assert_eq!(selected.id(), id);
        assert_eq!(selected.secret(), "persisted_key");
    }

    #[test]
    fn test_manager_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<KeyManager>();

        let km = std::sync::Arc::new(manager());
        let id = km.add(NewCredential::new("shared")).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let km = km.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        km.report_success(id).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(km.list().unwrap()[0].total_usage, 20);
    }
}
