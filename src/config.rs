//! Process configuration for the key pool.
//!
//! Values come from the environment (a `.env` file is loaded first when
//! present). Tests build a config directly and override fields with the
//! `with_*` helpers instead of touching process-wide env vars.

use std::path::{Path, PathBuf};

use crate::error::AppError;

pub const ENV_DB_PATH: &str = "KEYPOOL_DB_PATH";
pub const ENV_MASTER_KEY_PATH: &str = "KEYPOOL_MASTER_KEY_PATH";
pub const ENV_SERVICE: &str = "KEYPOOL_SERVICE";
pub const ENV_FALLBACK_VAR: &str = "KEYPOOL_FALLBACK_ENV";

pub const DEFAULT_SERVICE: &str = "google";
pub const DEFAULT_FALLBACK_VAR: &str = "GOOGLE_API_KEY";

const APP_DIR: &str = "keypool";
const DB_FILE: &str = "keypool.db";
const MASTER_KEY_FILE: &str = ".master_key";

#[derive(Clone)]
pub struct KeyPoolConfig {
    pub db_path: PathBuf,
    pub master_key_path: PathBuf,
    /// Service tag every stored credential is filed under.
    pub service: String,
    /// Name of the env var the fallback secret was read from (used for its label).
    pub fallback_var: String,
    pub fallback_secret: Option<String>,
}

impl KeyPoolConfig {
    /// Load configuration from the environment, reading `.env` if one exists.
    pub fn from_env() -> Result<Self, AppError> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!(path = %path.display(), "Loaded .env"),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(AppError::Config(format!("Failed to load .env: {e}"))),
        }

        let base = default_base_dir()?;
        let db_path = env_path(ENV_DB_PATH).unwrap_or_else(|| base.join(DB_FILE));
        let master_key_path = env_path(ENV_MASTER_KEY_PATH).unwrap_or_else(|| {
            db_path
                .parent()
                .map(|dir| dir.join(MASTER_KEY_FILE))
                .unwrap_or_else(|| base.join(MASTER_KEY_FILE))
        });

        let service = env_non_empty(ENV_SERVICE).unwrap_or_else(|| DEFAULT_SERVICE.to_string());
        let fallback_var =
            env_non_empty(ENV_FALLBACK_VAR).unwrap_or_else(|| DEFAULT_FALLBACK_VAR.to_string());
        let fallback_secret = env_non_empty(&fallback_var);

        Ok(Self {
            db_path,
            master_key_path,
            service,
            fallback_var,
            fallback_secret,
        })
    }

    /// A config rooted at `dir` with no fallback secret. Used by tests and embedders.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            db_path: dir.join(DB_FILE),
            master_key_path: dir.join(MASTER_KEY_FILE),
            service: DEFAULT_SERVICE.to_string(),
            fallback_var: DEFAULT_FALLBACK_VAR.to_string(),
            fallback_secret: None,
        }
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    pub fn with_master_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.master_key_path = path.into();
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn with_fallback_secret(mut self, secret: Option<String>) -> Self {
        self.fallback_secret = secret.filter(|s| !s.trim().is_empty());
        self
    }

    /// Display label for the synthetic fallback credential.
    pub fn fallback_label(&self) -> String {
        format!(".env ({})", self.fallback_var)
    }
}

impl std::fmt::Debug for KeyPoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPoolConfig")
            .field("db_path", &self.db_path)
            .field("master_key_path", &self.master_key_path)
            .field("service", &self.service)
            .field("fallback_var", &self.fallback_var)
            .field(
                "fallback_secret",
                &self.fallback_secret.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

fn default_base_dir() -> Result<PathBuf, AppError> {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .map(|dir| dir.join(APP_DIR))
        .ok_or_else(|| AppError::Config("Cannot resolve a data or home directory".into()))
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_path(name: &str) -> Option<PathBuf> {
    env_non_empty(name).map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_dir_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config = KeyPoolConfig::in_dir(dir.path());
        assert_eq!(config.db_path, dir.path().join("keypool.db"));
        assert_eq!(config.master_key_path, dir.path().join(".master_key"));
        assert_eq!(config.service, "google");
        assert!(config.fallback_secret.is_none());
    }

    #[test]
    fn test_blank_fallback_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            KeyPoolConfig::in_dir(dir.path()).with_fallback_secret(Some("   ".into()));
        assert!(config.fallback_secret.is_none());
    }

    #[test]
    fn test_debug_redacts_fallback_secret() {
        let dir = tempfile::tempdir().unwrap();
        let config = KeyPoolConfig::in_dir(dir.path())
            .with_fallback_secret(Some("AIza-super-secret".into()));
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("AIza-super-secret"));
        assert!(rendered.contains("<redacted>"));
        assert_eq!(config.fallback_label(), ".env (GOOGLE_API_KEY)");
    }
}
