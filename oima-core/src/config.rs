//! Configuration handling.
//!
//! A single [`Config`] is loaded once at startup and passed by reference into
//! every component constructor. Secrets found in the file are moved into a
//! [`SecretStore`] with [`Config::take_secrets`] and wiped from the struct.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

use crate::store::{self, SecretStore, StoreError};

/// Default token endpoint, relative to the registry URI.
pub const DEFAULT_TOKEN_PATH: &str = "/api/docker/docker/v2/token";

/// Error type for configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`Config`].
    #[error("failed to parse config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A value is missing or out of range.
    #[error("invalid configuration: {message}")]
    Invalid { message: String },

    /// Configuration directory not available.
    #[error("configuration directory not available")]
    ConfigDirUnavailable,

    /// Moving a secret into the secret store failed.
    #[error("failed to store secret from configuration: {0}")]
    Store(#[from] StoreError),
}

/// Where secrets from the configuration file are kept at runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretBackend {
    #[default]
    Memory,
    Keyring,
}

/// Bounded retry for transient registry failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per request, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubled for every further retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

/// Container registry settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Base URI of the registry, e.g. `https://registry.example.com`.
    pub uri: String,

    /// Whether the registry requires a bearer token.
    #[serde(default)]
    pub require_auth: bool,

    #[serde(default)]
    pub username: String,

    /// Plaintext password from the file; moved into the secret store at startup.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Token endpoint path appended to `uri`.
    #[serde(default = "default_token_path")]
    pub token_path: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Upper bound on registry requests in flight.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_token_path() -> String {
    DEFAULT_TOKEN_PATH.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_concurrency() -> usize {
    16
}

impl RegistryConfig {
    /// Settings for `uri` with every other value at its default.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            require_auth: false,
            username: String::new(),
            password: None,
            token_path: default_token_path(),
            timeout_secs: default_timeout_secs(),
            max_concurrency: default_max_concurrency(),
            retry: RetryPolicy::default(),
        }
    }

    /// Require authentication as `username`.
    pub fn with_auth(mut self, username: impl Into<String>) -> Self {
        self.require_auth = true;
        self.username = username.into();
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The registry URI without trailing slashes.
    pub fn base_uri(&self) -> &str {
        self.uri.trim_end_matches('/')
    }

    /// Absolute URL of the token endpoint.
    pub fn token_url(&self) -> String {
        format!("{}/{}", self.base_uri(), self.token_path.trim_start_matches('/'))
    }
}

impl std::fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("uri", &self.uri)
            .field("require_auth", &self.require_auth)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("token_path", &self.token_path)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_concurrency", &self.max_concurrency)
            .field("retry", &self.retry)
            .finish()
    }
}

/// S3-compatible object storage holding image signatures.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct S3Config {
    #[serde(default)]
    pub enabled: bool,

    /// Endpoint host, e.g. `play.min.io`.
    #[serde(default)]
    pub endpoint: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Bucket the signatures are stored in.
    #[serde(default)]
    pub bucket_name: String,

    #[serde(default)]
    pub use_ssl: bool,

    #[serde(default, skip_serializing)]
    pub access_key_id: Option<String>,

    #[serde(default, skip_serializing)]
    pub secret_access_key: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl S3Config {
    /// Endpoint URL including the scheme selected by `use_ssl`.
    pub fn endpoint_url(&self) -> String {
        if self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://") {
            return self.endpoint.clone();
        }
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{}://{}", scheme, self.endpoint)
    }
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("enabled", &self.enabled)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("bucket_name", &self.bucket_name)
            .field("use_ssl", &self.use_ssl)
            .finish_non_exhaustive()
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub registry: RegistryConfig,

    #[serde(default)]
    pub s3: S3Config,

    #[serde(default)]
    pub secret_backend: SecretBackend,

    /// Logging level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Path to the configuration file that was loaded.
    #[serde(skip)]
    pub config_path: PathBuf,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Configuration for a registry with every other value at its default.
    pub fn new(registry: RegistryConfig) -> Self {
        Self {
            registry,
            s3: S3Config::default(),
            secret_backend: SecretBackend::default(),
            log_level: default_log_level(),
            config_path: PathBuf::new(),
        }
    }

    /// Default location of the configuration file.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dirs = project_dirs().ok_or(ConfigError::ConfigDirUnavailable)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Load and validate the configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(Self::default_path()?)
    }

    /// Load and validate the configuration from a specific path.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents =
            Zeroizing::new(std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?);

        let mut config = Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.config_path = path.to_path_buf();
        config.validate()?;

        Ok(config)
    }

    /// Parse without validating.
    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Reject configurations no component can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let uri = self.registry.uri.trim();
        if uri.is_empty() {
            return Err(invalid("registry.uri must be set"));
        }

        match url::Url::parse(uri) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            Ok(url) => {
                return Err(invalid(format!(
                    "registry.uri must use http or https, got '{}'",
                    url.scheme()
                )));
            }
            Err(e) => return Err(invalid(format!("registry.uri is not a valid URL: {}", e))),
        }

        if self.registry.max_concurrency == 0 {
            return Err(invalid("registry.max_concurrency must be at least 1"));
        }

        if self.registry.retry.max_attempts == 0 {
            return Err(invalid("registry.retry.max_attempts must be at least 1"));
        }

        if self.s3.enabled {
            if self.s3.endpoint.trim().is_empty() {
                return Err(invalid("s3.endpoint must be set when s3 is enabled"));
            }
            if self.s3.bucket_name.trim().is_empty() {
                return Err(invalid("s3.bucket_name must be set when s3 is enabled"));
            }
        }

        Ok(())
    }

    /// Move every secret held in the configuration into `store`.
    ///
    /// The configuration copies are wiped and cleared whether or not the
    /// store accepted them.
    pub async fn take_secrets(&mut self, store: &dyn SecretStore) -> Result<(), ConfigError> {
        let moves = [
            (store::PASSWORD, self.registry.password.take()),
            (store::S3_ACCESS_KEY_ID, self.s3.access_key_id.take()),
            (store::S3_SECRET_ACCESS_KEY, self.s3.secret_access_key.take()),
        ];

        let mut result = Ok(());
        for (name, value) in moves {
            let Some(value) = value else { continue };
            let mut bytes = value.into_bytes();
            if !bytes.is_empty() && result.is_ok() {
                result = store_secret(store, name, &mut bytes).await;
            }
            bytes.zeroize();
        }

        Ok(result?)
    }
}

/// Add `bytes` under `name`. A persistent backend may still hold the value
/// of an earlier run; it is replaced when the configuration changed it.
async fn store_secret(
    store: &dyn SecretStore,
    name: &str,
    bytes: &mut [u8],
) -> Result<(), StoreError> {
    match store.add(name, bytes).await {
        Err(StoreError::NameExists { .. }) => {}
        other => return other,
    }

    let stored = store.get(name).await?;
    if stored.with_opened(|old| old == &bytes[..])? {
        tracing::debug!("Secret '{}' is already stored", name);
        return Ok(());
    }

    tracing::info!("Replacing stored secret '{}' with the configured value", name);
    store.remove(name).await?;
    store.add(name, bytes).await
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        message: message.into(),
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("de", "fabmation", "oima")
}
