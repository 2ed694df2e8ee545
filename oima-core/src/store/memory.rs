//! In-memory secret storage implementation.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::{SealedSecret, SecretStore, StoreError};

/// Process-local store of sealed secrets.
///
/// Secrets are lost when the process exits. Only ciphertext is kept; the
/// plaintext handed to [`add`](SecretStore::add) is wiped before the call
/// returns.
pub struct MemoryStore {
    secrets: RwLock<HashMap<String, Arc<SealedSecret>>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self {
            secrets: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("secrets_count", &self.secrets.read().len())
            .finish()
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn add(&self, name: &str, data: &mut [u8]) -> Result<(), StoreError> {
        let mut secrets = self.secrets.write();
        if secrets.contains_key(name) {
            return Err(StoreError::NameExists {
                name: name.to_string(),
            });
        }

        let sealed = SealedSecret::seal(data)?;
        secrets.insert(name.to_string(), Arc::new(sealed));
        tracing::debug!("Sealed secret '{}' into memory store", name);
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Arc<SealedSecret>, StoreError> {
        self.secrets
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                name: name.to_string(),
            })
    }

    async fn remove(&self, name: &str) -> Result<(), StoreError> {
        match self.secrets.write().remove(name) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound {
                name: name.to_string(),
            }),
        }
    }

    async fn names(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self.secrets.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_add_get() {
        let store = MemoryStore::new();
        let mut data = b"test-value".to_vec();

        store.add("x", &mut data).await.unwrap();
        assert!(data.iter().all(|b| *b == 0), "caller buffer must be zeroed");

        let sealed = store.get("x").await.unwrap();
        let opened = sealed.with_opened(|bytes| bytes.to_vec()).unwrap();
        assert_eq!(opened, b"test-value");
    }

    #[tokio::test]
    async fn test_memory_store_duplicate_name() {
        let store = MemoryStore::new();
        store.add("x", &mut b"first".to_vec()).await.unwrap();

        let mut second = b"second".to_vec();
        let result = store.add("x", &mut second).await;

        assert!(matches!(result, Err(StoreError::NameExists { .. })));
        // existing state and the rejected buffer are untouched
        assert_eq!(second, b"second");
        let opened = store
            .get("x")
            .await
            .unwrap()
            .with_opened_str(|s| s.to_string())
            .unwrap();
        assert_eq!(opened, "first");
    }

    #[tokio::test]
    async fn test_memory_store_get_nonexistent() {
        let store = MemoryStore::new();
        let result = store.get("nonexistent").await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_memory_store_remove() {
        let store = MemoryStore::new();
        store.add("x", &mut b"value".to_vec()).await.unwrap();

        store.remove("x").await.unwrap();
        assert!(matches!(
            store.get("x").await,
            Err(StoreError::NotFound { .. })
        ));

        let again = store.remove("x").await;
        assert!(matches!(again, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_memory_store_names() {
        let store = MemoryStore::new();
        store.add("password", &mut b"p".to_vec()).await.unwrap();
        store.add("s3_access_key_id", &mut b"a".to_vec()).await.unwrap();

        let names = store.names().await.unwrap();
        assert_eq!(names, vec!["password", "s3_access_key_id"]);
    }

    #[tokio::test]
    async fn test_handle_outlives_removal() {
        let store = MemoryStore::new();
        store.add("x", &mut b"value".to_vec()).await.unwrap();

        let handle = store.get("x").await.unwrap();
        store.remove("x").await.unwrap();

        // a handle obtained before removal still opens
        assert_eq!(handle.with_opened(|b| b.len()).unwrap(), 5);
    }
}
