//! # oima Core
//!
//! Core library for oima, the OCI image inventory tool.
//!
//! This crate provides:
//! - A sealed, in-memory secret store (plus an optional OS keyring backend)
//! - Registry authentication with bearer token renewal
//! - A concurrent catalog crawler building a repository/image/tag tree
//! - The [`DockerRegistry`] facade tying them together
//! - A [`SignatureChecker`] seam with an S3 backend (with `s3` feature)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use oima_core::{Config, DockerRegistry, create_store};
//!
//! async fn inventory(mut config: Config) -> Result<(), oima_core::OimaError> {
//!     let store = create_store(false);
//!     config.take_secrets(store.as_ref()).await?;
//!
//!     let mut registry = DockerRegistry::new(&config.registry, store)?;
//!     registry.init().await?;
//!     registry.fetch_all().await?;
//!     for repository in registry.list_repositories().await? {
//!         println!("{}", repository.name());
//!     }
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod crawler;
pub mod error;
pub mod http;
pub mod model;
pub mod registry;
pub mod signature;
pub mod store;
pub mod token;

// Re-export commonly used types at crate root
pub use auth::{ApiVersion, AuthError, AuthState, RegistryAuth};

pub use config::{Config, ConfigError, RegistryConfig, RetryPolicy, S3Config, SecretBackend};

pub use crawler::CatalogCrawler;

pub use error::{OimaError, RegistryError};

pub use http::{HttpError, RegistryHttp};

pub use model::{Catalog, Image, ImageId, Repository, RepositoryId, Stats, Tag};

pub use registry::DockerRegistry;

pub use signature::{SignatureChecker, SignatureError};

#[cfg(feature = "s3")]
pub use signature::S3SignatureChecker;

pub use store::{MemoryStore, SealedSecret, SecretStore, StoreError, create_store};

#[cfg(feature = "keyring-store")]
pub use store::KeyringStore;

pub use token::{BearerToken, TokenStatus};
