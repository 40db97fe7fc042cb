//! Secret store implementations.
//!
//! [`PlaintextSecretStore`] is the development default and stores values
//! as-is. [`EncryptedSecretStore`] seals values with ChaCha20-Poly1305
//! under a key file and is the one to deploy.

use std::path::Path;

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::warn;

use crucible_core::secrets::{SecretError, SecretStore};

use crate::database::Database;
use crate::error::StoreError;

const NONCE_LEN: usize = 12;

fn upsert(db: &Database, key: &str, value: &str) -> Result<(), StoreError> {
    let now = Utc::now().to_rfc3339();
    db.with_conn(|conn| {
        let _ = conn.execute(
            "INSERT INTO secrets (key, value, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value, now],
        )?;
        Ok(())
    })
}

fn select(db: &Database, key: &str) -> Result<Option<String>, StoreError> {
    db.with_conn(|conn| {
        conn.query_row(
            "SELECT value FROM secrets WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(StoreError::from)
    })
}

fn remove(db: &Database, key: &str) -> Result<bool, StoreError> {
    db.with_conn(|conn| {
        let changed = conn.execute("DELETE FROM secrets WHERE key = ?1", params![key])?;
        Ok(changed > 0)
    })
}

fn storage_err(e: StoreError) -> SecretError {
    SecretError::Storage(e.to_string())
}

/// Plaintext secret storage.
///
/// DEVELOPMENT ONLY: values are stored exactly as given. Deploy
/// [`EncryptedSecretStore`] instead.
pub struct PlaintextSecretStore {
    db: Database,
}

impl PlaintextSecretStore {
    pub fn new(db: Database) -> Self {
        warn!(
            "PlaintextSecretStore in use: secrets are stored UNENCRYPTED. \
             Do not use this store in production."
        );
        Self { db }
    }
}

#[async_trait]
impl SecretStore for PlaintextSecretStore {
    async fn store(&self, key: &str, value: &str) -> Result<(), SecretError> {
        if key.is_empty() {
            return Err(SecretError::Storage("key must be non-empty".into()));
        }
        upsert(&self.db, key, value).map_err(storage_err)
    }

    async fn retrieve(&self, key: &str) -> Result<Option<String>, SecretError> {
        if key.is_empty() {
            return Ok(None);
        }
        select(&self.db, key).map_err(storage_err)
    }

    async fn delete(&self, key: &str) -> Result<bool, SecretError> {
        remove(&self.db, key).map_err(storage_err)
    }

    async fn exists(&self, key: &str) -> Result<bool, SecretError> {
        Ok(select(&self.db, key).map_err(storage_err)?.is_some())
    }
}

/// ChaCha20-Poly1305 sealed secret storage over the same table.
/// Values are stored as base64(nonce || ciphertext).
pub struct EncryptedSecretStore {
    db: Database,
    key: [u8; 32],
}

impl EncryptedSecretStore {
    pub fn new(db: Database, key: [u8; 32]) -> Self {
        Self { db, key }
    }

    /// Open with the key file at `path`, generating one (mode 0600) on
    /// first use.
    pub fn with_key_file(db: Database, path: &Path) -> Result<Self, SecretError> {
        Ok(Self::new(db, load_or_create_key(path)?))
    }

    fn seal(&self, plaintext: &str) -> Result<String, SecretError> {
        let cipher = ChaCha20Poly1305::new((&self.key).into());
        let mut nonce_bytes = [0u8; NONCE_LEN];
        chacha20poly1305::aead::rand_core::RngCore::fill_bytes(&mut OsRng, &mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| SecretError::Crypto("encryption failed".into()))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            &combined,
        ))
    }

    fn open(&self, encoded: &str) -> Result<String, SecretError> {
        let combined = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
            .map_err(|_| SecretError::Crypto("invalid encoding".into()))?;
        if combined.len() < NONCE_LEN {
            return Err(SecretError::Crypto("invalid encoding".into()));
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new((&self.key).into());
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| SecretError::Crypto("decryption failed".into()))?;
        String::from_utf8(plaintext).map_err(|_| SecretError::Crypto("invalid UTF-8".into()))
    }
}

#[async_trait]
impl SecretStore for EncryptedSecretStore {
    async fn store(&self, key: &str, value: &str) -> Result<(), SecretError> {
        if key.is_empty() {
            return Err(SecretError::Storage("key must be non-empty".into()));
        }
        let sealed = self.seal(value)?;
        upsert(&self.db, key, &sealed).map_err(storage_err)
    }

    async fn retrieve(&self, key: &str) -> Result<Option<String>, SecretError> {
        if key.is_empty() {
            return Ok(None);
        }
        match select(&self.db, key).map_err(storage_err)? {
            Some(sealed) => Ok(Some(self.open(&sealed)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, SecretError> {
        remove(&self.db, key).map_err(storage_err)
    }

    async fn exists(&self, key: &str) -> Result<bool, SecretError> {
        Ok(select(&self.db, key).map_err(storage_err)?.is_some())
    }
}

/// Generate a random 256-bit key.
pub fn generate_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    chacha20poly1305::aead::rand_core::RngCore::fill_bytes(&mut OsRng, &mut key);
    key
}

/// Load or create the secret key file.
pub fn load_or_create_key(path: &Path) -> Result<[u8; 32], SecretError> {
    if path.exists() {
        let encoded = std::fs::read_to_string(path)
            .map_err(|e| SecretError::Storage(format!("read key file: {e}")))?;
        let bytes =
            base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded.trim())
                .map_err(|_| SecretError::Crypto("invalid key encoding".into()))?;
        if bytes.len() != 32 {
            return Err(SecretError::Crypto("invalid key length".into()));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(key)
    } else {
        let key = generate_key();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SecretError::Storage(format!("create key dir: {e}")))?;
        }
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, key);
        std::fs::write(path, &encoded)
            .map_err(|e| SecretError::Storage(format!("write key file: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| SecretError::Storage(format!("chmod key file: {e}")))?;
        }

        Ok(key)
    }
}
