//! OS keyring-backed secret storage implementation.

use async_trait::async_trait;
use keyring::Entry;
use std::sync::Arc;
use zeroize::Zeroize;

use super::{SealedSecret, SecretStore, StoreError};

/// OS keyring-backed secret store.
///
/// This store uses the platform's native keyring service:
/// - macOS: Keychain
/// - Linux: Secret Service API (via libsecret)
/// - Windows: Credential Manager
///
/// Entries are named `{service_name}/{name}`. Values read back from the
/// keyring are sealed immediately and the intermediate plaintext is wiped.
pub struct KeyringStore {
    service_name: String,
}

impl KeyringStore {
    /// Try to create a new keyring store.
    ///
    /// Returns an error if the keyring backend is not available on this platform.
    pub fn try_new(service_name: &str) -> Result<Self, StoreError> {
        let test_key = format!("{}/__test__", service_name);
        match Entry::new(&test_key, "availability_check") {
            Ok(_) => Ok(Self {
                service_name: service_name.to_string(),
            }),
            Err(e) => Err(StoreError::KeyringUnavailable {
                message: format!("keyring backend not available: {}", e),
            }),
        }
    }

    fn entry(&self, name: &str) -> Result<Entry, StoreError> {
        let service = format!("{}/{}", self.service_name, name);
        Entry::new(&service, "oima").map_err(|e| StoreError::Backend {
            message: format!("failed to create keyring entry: {}", e),
        })
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.entry(name)?.get_secret() {
            Ok(bytes) => Ok(Some(bytes)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(keyring::Error::PlatformFailure(e)) => Err(StoreError::Backend {
                message: format!("platform keyring failure: {}", e),
            }),
            Err(e) => Err(StoreError::Backend {
                message: format!("keyring error: {}", e),
            }),
        }
    }
}

impl std::fmt::Debug for KeyringStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyringStore")
            .field("service_name", &self.service_name)
            .finish()
    }
}

#[async_trait]
impl SecretStore for KeyringStore {
    async fn add(&self, name: &str, data: &mut [u8]) -> Result<(), StoreError> {
        if let Some(mut existing) = self.read(name)? {
            existing.zeroize();
            return Err(StoreError::NameExists {
                name: name.to_string(),
            });
        }

        let result = self
            .entry(name)?
            .set_secret(data)
            .map_err(|e| StoreError::Backend {
                message: format!("failed to write keyring entry: {}", e),
            });
        data.zeroize();
        result
    }

    async fn get(&self, name: &str) -> Result<Arc<SealedSecret>, StoreError> {
        match self.read(name)? {
            Some(bytes) => Ok(Arc::new(SealedSecret::seal_vec(bytes)?)),
            None => Err(StoreError::NotFound {
                name: name.to_string(),
            }),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), StoreError> {
        match self.entry(name)?.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Err(StoreError::NotFound {
                name: name.to_string(),
            }),
            Err(e) => Err(StoreError::Backend {
                message: format!("failed to delete keyring entry: {}", e),
            }),
        }
    }

    async fn names(&self) -> Result<Vec<String>, StoreError> {
        // Platform keyrings offer no enumeration.
        Err(StoreError::Backend {
            message: "listing names is not supported by the keyring backend".to_string(),
        })
    }
}
