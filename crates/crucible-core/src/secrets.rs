//! Secret storage seam consumed by provider strategies.

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret storage error: {0}")]
    Storage(String),

    #[error("secret crypto error: {0}")]
    Crypto(String),
}

/// Pluggable secret storage. Keys are opaque references held on provider
/// records; values are the credentials themselves and must never appear in
/// logs or persisted experiment state.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn store(&self, key: &str, value: &str) -> Result<(), SecretError>;

    /// `Ok(None)` when the key has no stored value.
    async fn retrieve(&self, key: &str) -> Result<Option<String>, SecretError>;

    /// Returns whether a value was actually removed.
    async fn delete(&self, key: &str) -> Result<bool, SecretError>;

    async fn exists(&self, key: &str) -> Result<bool, SecretError>;
}
