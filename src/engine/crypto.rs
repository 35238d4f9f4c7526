use std::fs;
use std::io::Write;
use std::path::Path;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use zeroize::Zeroizing;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[cfg(unix)]
const KEY_FILE_MODE: u32 = 0o600;

/// Error type for crypto operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encrypt(String),
    #[error("Decryption failed: {0}")]
    Decrypt(String),
    #[error("Key management error: {0}")]
    KeyManagement(String),
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

// ---------------------------------------------------------------------------
// Key Management
// ---------------------------------------------------------------------------

/// The per-installation symmetric key. Wiped from memory on drop.
pub struct MasterKey(Zeroizing<[u8; KEY_LEN]>);

impl MasterKey {
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut key[..]);
        Self(key)
    }

    /// Load the key persisted at `path`, or generate one and persist it there
    /// with owner-only permissions. An existing key is never regenerated.
    pub fn load_or_create(path: &Path) -> Result<Self, CryptoError> {
        if let Some(key) = Self::load(path)? {
            return Ok(key);
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                CryptoError::KeyManagement(format!("Failed creating key dir: {}", e))
            })?;
        }

        let key = Self::generate();
        match write_new_key_file(path, &key) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "Generated new master encryption key");
                Ok(key)
            }
            // Another process won the race; use what it wrote.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Self::load(path)?
                .ok_or_else(|| CryptoError::KeyManagement("Master key vanished after create race".into())),
            Err(e) => Err(CryptoError::KeyManagement(format!(
                "Failed writing key file {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn load(path: &Path) -> Result<Option<Self>, CryptoError> {
        if !path.exists() {
            return Ok(None);
        }

        let raw = Zeroizing::new(fs::read_to_string(path).map_err(|e| {
            CryptoError::KeyManagement(format!("Failed reading key file {}: {}", path.display(), e))
        })?);
        let bytes = Zeroizing::new(B64.decode(raw.trim())?);
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::KeyManagement(format!(
                "Stored key has wrong length: {} (expected {})",
                bytes.len(),
                KEY_LEN
            )));
        }

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&bytes[..]);
        tracing::debug!(path = %path.display(), "Master key loaded");
        Ok(Some(Self(key)))
    }

    fn encoded(&self) -> Zeroizing<String> {
        Zeroizing::new(B64.encode(&self.0[..]))
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

fn write_new_key_file(path: &Path, key: &MasterKey) -> std::io::Result<()> {
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(KEY_FILE_MODE);
    }

    let mut file = opts.open(path)?;
    file.write_all(key.encoded().as_bytes())?;
    file.sync_all()?;

    // The umask may have narrowed the create mode; pin it explicitly.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(KEY_FILE_MODE))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Core Encryption / Decryption
// ---------------------------------------------------------------------------

/// AES-256-GCM over secrets stored in the credential catalog.
///
/// Stored form is `base64(nonce || ciphertext)` with a fresh random nonce per value.
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    pub fn new(key: &MasterKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0[..])),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ciphertext);
        Ok(B64.encode(payload))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, CryptoError> {
        let payload = B64.decode(stored)?;
        if payload.len() <= NONCE_LEN {
            return Err(CryptoError::Decrypt(format!(
                "Payload too short: {} bytes",
                payload.len()
            )));
        }

        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| CryptoError::Decrypt(format!("Invalid UTF-8 in decrypted data: {}", e)))
    }

    /// Decrypt, or hand back `stored` unchanged if it does not decrypt.
    ///
    /// Rows written before encryption existed hold the plaintext secret, so a
    /// failed decrypt is read as "legacy plaintext". Corrupted ciphertext is
    /// indistinguishable from that case and is returned as-is too.
    pub fn decrypt_or_passthrough(&self, stored: &str) -> String {
        match self.decrypt(stored) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::debug!("Stored key is not ciphertext ({}), treating as plaintext", e);
                stored.to_string()
            }
        }
    }

    /// True when `stored` decrypts under this key.
    pub fn is_ciphertext(&self, stored: &str) -> bool {
        self.decrypt(stored).is_ok()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
