//! Pooled API credentials for one upstream service.
//!
//! Callers ask the [`KeyManager`] for a credential before each upstream call
//! and report the outcome afterwards. The manager persists every credential
//! encrypted at rest, tracks quota and health per credential, and always
//! hands out the least-loaded healthy one.
//!
//! ```no_run
//! use keypool::{KeyManager, KeyPoolConfig};
//!
//! # fn main() -> Result<(), keypool::AppError> {
//! keypool::logging::init();
//! let manager = KeyManager::open(&KeyPoolConfig::from_env()?)?;
//! if let Some(credential) = manager.select()? {
//!     // ... call the upstream with credential.secret() ...
//!     manager.report_success(credential.handle())?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod validation;

pub use config::KeyPoolConfig;
pub use db::models::{CredentialStatus, CredentialSummary, UsageEvent};
pub use engine::crypto::{CryptoError, MasterKey, SecretCipher};
pub use engine::health::classify_upstream_error;
pub use engine::key_manager::{
    Credential, CredentialHandle, KeyManager, NewCredential, RemovedCredential,
    FALLBACK_CREDENTIAL_ID,
};
pub use error::{AppError, ValidationError};
