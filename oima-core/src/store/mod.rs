//! Secret storage.
//!
//! This module provides:
//! - [`SealedSecret`] - A secret kept encrypted in memory with scoped, wiped openings
//! - [`SecretStore`] - Trait for secret storage backends
//! - [`MemoryStore`] - Process-local store of sealed secrets
//! - [`KeyringStore`] - OS keyring implementation (with `keyring-store` feature)
//! - [`create_store`] - Helper to select backend based on availability
//!
//! # Well-known Names
//!
//! The registry password lives under [`PASSWORD`], the object storage keys
//! under [`S3_ACCESS_KEY_ID`] and [`S3_SECRET_ACCESS_KEY`].
//!
//! # Example
//!
//! ```rust,ignore
//! use oima_core::store::{MemoryStore, SecretStore};
//!
//! let store = MemoryStore::new();
//!
//! let mut password = b"hunter2".to_vec();
//! store.add("password", &mut password).await?;
//! assert!(password.iter().all(|b| *b == 0));
//!
//! let sealed = store.get("password").await?;
//! sealed.with_opened(|bytes| assert_eq!(bytes, b"hunter2"))?;
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

mod memory;
mod sealed;
#[cfg(feature = "keyring-store")]
mod keyring;

pub use memory::MemoryStore;
pub use sealed::SealedSecret;
#[cfg(feature = "keyring-store")]
pub use keyring::KeyringStore;

/// Name of the registry password.
pub const PASSWORD: &str = "password";

/// Name of the object storage access key id.
pub const S3_ACCESS_KEY_ID: &str = "s3_access_key_id";

/// Name of the object storage secret access key.
pub const S3_SECRET_ACCESS_KEY: &str = "s3_secret_access_key";

/// Error type for secret store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A secret with this name is already stored.
    #[error("a secret named '{name}' already exists")]
    NameExists { name: String },

    /// The requested secret was not found.
    #[error("secret not found: {name}")]
    NotFound { name: String },

    /// Encrypting the secret failed.
    #[error("failed to seal secret: {message}")]
    Sealing { message: String },

    /// Decrypting the secret failed.
    #[error("failed to open secret: {message}")]
    Opening { message: String },

    /// The storage backend encountered an error.
    #[error("backend error: {message}")]
    Backend { message: String },

    /// The keyring backend is not available.
    #[error("keyring not available: {message}")]
    KeyringUnavailable { message: String },
}

/// Abstraction over secret storage backends.
///
/// Secrets go in as plaintext buffers, which are wiped as part of the call,
/// and come out only as [`SealedSecret`] handles.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Store `data` under `name` and zero the caller's buffer.
    ///
    /// Fails with [`StoreError::NameExists`] if the name is taken, in which
    /// case neither the store nor `data` is modified.
    async fn add(&self, name: &str, data: &mut [u8]) -> Result<(), StoreError>;

    /// Retrieve the sealed secret stored under `name`.
    async fn get(&self, name: &str) -> Result<Arc<SealedSecret>, StoreError>;

    /// Delete the secret stored under `name`.
    async fn remove(&self, name: &str) -> Result<(), StoreError>;

    /// Names of all stored secrets.
    async fn names(&self) -> Result<Vec<String>, StoreError>;

    /// Check whether a secret exists without retrieving it.
    async fn contains(&self, name: &str) -> Result<bool, StoreError> {
        match self.get(name).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Create a secret store with automatic backend selection.
///
/// - If `prefer_keyring` is `true` and the `keyring-store` feature is enabled,
///   a [`KeyringStore`] is tried first and a [`MemoryStore`] is used when the
///   keyring is unavailable.
/// - Otherwise a [`MemoryStore`] is returned.
pub fn create_store(prefer_keyring: bool) -> Arc<dyn SecretStore> {
    #[cfg(feature = "keyring-store")]
    if prefer_keyring {
        match KeyringStore::try_new("oima") {
            Ok(store) => {
                tracing::info!("Using OS keyring for secret storage");
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!(
                    "Keyring unavailable ({}), falling back to memory store",
                    e
                );
            }
        }
    }

    #[cfg(not(feature = "keyring-store"))]
    if prefer_keyring {
        tracing::warn!(
            "Keyring storage requested but keyring-store feature not enabled, using memory store"
        );
    }

    tracing::debug!("Using in-memory secret storage");
    Arc::new(MemoryStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_store_memory() {
        let store = create_store(false);

        let mut data = b"test".to_vec();
        store.add("test-key", &mut data).await.unwrap();
        assert!(store.contains("test-key").await.unwrap());
        assert!(!store.contains("other-key").await.unwrap());
    }

    #[test]
    fn test_store_error_messages() {
        let err = StoreError::NameExists {
            name: "password".to_string(),
        };
        assert_eq!(err.to_string(), "a secret named 'password' already exists");

        let err = StoreError::NotFound {
            name: "s3_access_key_id".to_string(),
        };
        assert!(err.to_string().contains("s3_access_key_id"));
    }
}
