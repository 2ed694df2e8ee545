//! The [`DockerRegistry`] aggregate.
//!
//! Composes the auth manager and the crawler behind a small lifecycle:
//!
//! 1. [`DockerRegistry::init`] resolves credentials, detects the API version
//!    and obtains the first token.
//! 2. [`DockerRegistry::fetch_all`] builds a fresh snapshot and swaps it in.
//! 3. Readers ([`list_repositories`](DockerRegistry::list_repositories),
//!    [`stats`](DockerRegistry::stats), ...) walk the snapshot.
//!
//! # Example
//!
//! ```rust,ignore
//! use oima_core::{DockerRegistry, MemoryStore, RegistryConfig};
//! use std::sync::Arc;
//!
//! let config = RegistryConfig::new("https://registry.example.com");
//! let mut registry = DockerRegistry::new(&config, Arc::new(MemoryStore::new()))?;
//! registry.init().await?;
//! registry.fetch_all().await?;
//! println!("{:?}", registry.stats());
//! ```

use std::sync::Arc;

use crate::auth::{ApiVersion, AuthError, RegistryAuth};
use crate::config::RegistryConfig;
use crate::crawler::CatalogCrawler;
use crate::error::{OimaError, RegistryError};
use crate::http::RegistryHttp;
use crate::model::{Catalog, Image, Repository, Stats, Tag};
use crate::signature::{SignatureChecker, SignatureError};
use crate::store::SecretStore;

/// One registry and its current snapshot.
pub struct DockerRegistry {
    base_uri: String,
    http: RegistryHttp,
    auth: Arc<RegistryAuth>,
    store: Arc<dyn SecretStore>,
    version: Option<ApiVersion>,
    catalog: Catalog,
}

impl DockerRegistry {
    /// Create an uninitialized registry. No network traffic happens here.
    pub fn new(config: &RegistryConfig, store: Arc<dyn SecretStore>) -> Result<Self, RegistryError> {
        Ok(Self {
            base_uri: config.base_uri().to_string(),
            http: RegistryHttp::new(config)?,
            auth: Arc::new(RegistryAuth::new(config)),
            store,
            version: None,
            catalog: Catalog::new(),
        })
    }

    /// Registry URI without trailing slashes.
    pub fn uri(&self) -> &str {
        &self.base_uri
    }

    /// API version detected by `init`, if it has run.
    pub fn version(&self) -> Option<ApiVersion> {
        self.version
    }

    pub fn auth(&self) -> &RegistryAuth {
        &self.auth
    }

    /// Initialize authentication and detect the API version.
    ///
    /// The version is fixed by the first successful call; later calls
    /// return it without probing again.
    pub async fn init(&mut self) -> Result<ApiVersion, RegistryError> {
        if let Some(version) = self.version {
            return Ok(version);
        }

        let version = self.auth.init(&self.http, self.store.as_ref()).await?;
        self.version = Some(version);
        Ok(version)
    }

    /// Re-check the registry API version and confirm a token can be obtained.
    pub async fn check_registry(&self) -> Result<bool, RegistryError> {
        if self.version.is_none() {
            return Err(RegistryError::NotInitialized);
        }

        if self.auth.detect_version(&self.http).await? == ApiVersion::V1 {
            return Err(AuthError::UnsupportedVersion.into());
        }
        if self.auth.is_required() {
            self.auth.get_bearer_token(&self.http).await?;
        }

        tracing::info!("Registry {} is reachable", self.base_uri);
        Ok(true)
    }

    fn crawler(&self) -> Result<CatalogCrawler, RegistryError> {
        let version = self.version.ok_or(RegistryError::NotInitialized)?;
        Ok(CatalogCrawler::new(
            self.http.clone(),
            Arc::clone(&self.auth),
            self.base_uri.clone(),
            version,
        ))
    }

    /// Fetch the complete tree, replacing the current snapshot on success.
    ///
    /// On error the previous snapshot is left untouched.
    pub async fn fetch_all(&mut self) -> Result<(), RegistryError> {
        let catalog = self.crawler()?.crawl().await?;
        self.catalog = catalog;
        Ok(())
    }

    /// The current snapshot.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Repositories in name order, fetching everything first if the
    /// snapshot is empty.
    pub async fn list_repositories(&mut self) -> Result<Vec<&Repository>, RegistryError> {
        if self.catalog.is_empty() {
            self.fetch_all().await?;
        }
        Ok(self.catalog.repositories().collect())
    }

    /// Images of repository `name` in name order.
    pub fn list_images(&self, name: &str) -> Result<Vec<&Image>, RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::internal("cannot list images of a repository without a name"));
        }
        let repository = self
            .catalog
            .find_repository(name)
            .ok_or_else(|| RegistryError::internal(format!("unknown repository '{}'", name)))?;
        Ok(self.catalog.images_of(repository).collect())
    }

    /// Image at full catalog path `path`.
    pub fn find_image(&self, path: &str) -> Option<&Image> {
        self.catalog.find_image(path)
    }

    pub fn stats(&self) -> Stats {
        self.catalog.stats()
    }

    /// Tags of one image, fetched on first access.
    pub async fn list_image_tags(&mut self, path: &str) -> Result<&[Tag], RegistryError> {
        let fetched = self.image(path)?.tags_fetched();
        if !fetched {
            return self.fetch_all_tags(path).await;
        }
        Ok(self.image(path)?.tags())
    }

    /// Fetch the tags of one image again, replacing what was known.
    pub async fn fetch_all_tags(&mut self, path: &str) -> Result<&[Tag], RegistryError> {
        let id = self.image_id(path)?;
        let tags = self.crawler()?.fetch_tags(path).await?;

        let image = self.catalog.image_mut(id);
        image.set_tags(tags);
        Ok(image.tags())
    }

    /// Replace the tags of one image.
    pub fn set_tags(&mut self, path: &str, tags: Vec<Tag>) -> Result<(), RegistryError> {
        let id = self.image_id(path)?;
        self.catalog.image_mut(id).set_tags(tags);
        Ok(())
    }

    fn image_id(&self, path: &str) -> Result<crate::model::ImageId, RegistryError> {
        if path.is_empty() {
            return Err(RegistryError::internal("image has no name"));
        }
        self.catalog
            .find_image_id(path)
            .ok_or_else(|| RegistryError::internal(format!("unknown image '{}'", path)))
    }

    fn image(&self, path: &str) -> Result<&Image, RegistryError> {
        let id = self.image_id(path)?;
        Ok(self.catalog.image(id))
    }

    /// Ask `checker` about every tag of every image and record the result.
    ///
    /// Images without tags are skipped.
    pub async fn annotate_signatures(
        &mut self,
        checker: &dyn SignatureChecker,
    ) -> Result<(), SignatureError> {
        let ids: Vec<_> = self.catalog.image_ids().collect();
        for id in ids {
            let image = self.catalog.image(id);
            if image.tags().is_empty() {
                continue;
            }

            let flags = checker
                .check(&self.base_uri, image.path(), image.tags())
                .await?;
            if flags.len() != image.tags().len() {
                return Err(SignatureError::Backend {
                    message: format!(
                        "checker returned {} results for {} tags of {}",
                        flags.len(),
                        image.tags().len(),
                        image.path()
                    ),
                });
            }

            for (tag, found) in self.catalog.image_mut(id).tags_mut().iter_mut().zip(flags) {
                tag.signature_found = found;
            }
        }

        let stats = self.stats();
        tracing::info!("{} of {} tags are signed", stats.signatures, stats.tags);
        Ok(())
    }

    /// Delete the signature of `path:tag` and clear its flag.
    pub async fn delete_signature(
        &mut self,
        path: &str,
        tag: &str,
        checker: &dyn SignatureChecker,
    ) -> Result<(), OimaError> {
        let id = self.image_id(path)?;
        let target = self
            .catalog
            .image(id)
            .tag(tag)
            .cloned()
            .ok_or_else(|| RegistryError::internal(format!("unknown tag '{}:{}'", path, tag)))?;

        checker.delete(&self.base_uri, path, &target).await?;

        if let Some(t) = self
            .catalog
            .image_mut(id)
            .tags_mut()
            .iter_mut()
            .find(|t| t.name == tag)
        {
            t.signature_found = false;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DockerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRegistry")
            .field("uri", &self.base_uri)
            .field("version", &self.version)
            .field("auth", &self.auth)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry() -> DockerRegistry {
        let config = RegistryConfig::new("http://127.0.0.1:9/");
        DockerRegistry::new(&config, Arc::new(MemoryStore::new())).unwrap()
    }

    #[test]
    fn test_new_registry_is_empty() {
        let registry = registry();
        assert_eq!(registry.uri(), "http://127.0.0.1:9");
        assert_eq!(registry.version(), None);
        assert_eq!(registry.stats(), Stats::default());
    }

    #[tokio::test]
    async fn test_fetch_before_init() {
        let mut registry = registry();
        assert!(matches!(
            registry.fetch_all().await,
            Err(RegistryError::NotInitialized)
        ));
        assert!(matches!(
            registry.check_registry().await,
            Err(RegistryError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_empty_image_name_is_internal_error() {
        let mut registry = registry();
        assert!(matches!(
            registry.fetch_all_tags("").await,
            Err(RegistryError::Internal { .. })
        ));
        assert!(matches!(
            registry.set_tags("", Vec::new()),
            Err(RegistryError::Internal { .. })
        ));
        assert!(matches!(
            registry.list_images(""),
            Err(RegistryError::Internal { .. })
        ));
    }
}
