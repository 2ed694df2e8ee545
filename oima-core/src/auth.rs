//! Registry credentials and the bearer token lifecycle.
//!
//! [`RegistryAuth`] owns the username, the sealed password and the current
//! [`BearerToken`]. It moves through these states:
//!
//! ```text
//! Uninitialized --init--> VersionDetected --(auth required)--> AwaitingToken --> Authenticated
//!                                 |         \--(no auth)---------------------------^
//!                                 \--(v1)--> Unsupported (terminal)
//! Authenticated --(token expired, request attempted)--> AwaitingToken --> Authenticated
//! ```
//!
//! Renewal is request-driven: nothing is scheduled in the background. The
//! token is checked when a caller asks for an `Authorization` header, and
//! concurrent callers that find it expired share a single renewal request.

use chrono::Utc;
use parking_lot::RwLock;
use reqwest::StatusCode;
use reqwest::header::HeaderValue;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use crate::config::RegistryConfig;
use crate::http::{self, HttpError, RegistryHttp};
use crate::store::{self, SealedSecret, SecretStore, StoreError};
use crate::token::{BearerToken, TokenResponse, TokenStatus, token_status};

/// Error type for authentication operations.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The registry only speaks API v1, which is not supported.
    #[error("registry API v1 is not supported")]
    UnsupportedVersion,

    /// Authentication is required but a credential is missing or empty.
    #[error("authentication is required but the {what} is missing")]
    MissingCredential { what: String },

    /// A credential is present but cannot be sent to the registry.
    #[error("the {what} cannot be used: {reason}")]
    InvalidCredential { what: String, reason: String },

    /// A token was requested before `init` completed.
    #[error("authentication has not been initialized")]
    NotInitialized,

    /// The registry or token endpoint could not be reached.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// The token endpoint returned a body that is not a token response.
    #[error("malformed token response from {url}: {message}")]
    MalformedResponse { url: String, message: String },

    /// The secret store refused an operation.
    #[error("secret store error: {0}")]
    Store(#[from] StoreError),
}

impl AuthError {
    /// Configuration faults cannot be fixed by retrying; the operator has
    /// to change the configuration.
    pub fn is_configuration_fault(&self) -> bool {
        matches!(
            self,
            AuthError::UnsupportedVersion
                | AuthError::MissingCredential { .. }
                | AuthError::InvalidCredential { .. }
        )
    }
}

/// Registry API version detected by probing `/v2/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiVersion {
    V1,
    V2,
}

impl ApiVersion {
    /// Path segment used in API URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiVersion::V1 => "v1",
            ApiVersion::V2 => "v2",
        }
    }
}

impl std::fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a [`RegistryAuth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Uninitialized,
    VersionDetected(ApiVersion),
    AwaitingToken,
    Authenticated,
    Unsupported,
}

/// Credentials and token for one registry.
pub struct RegistryAuth {
    required: bool,
    username: String,
    base_uri: String,
    token_url: String,
    password: RwLock<Option<Arc<SealedSecret>>>,
    token: Mutex<Option<BearerToken>>,
    state: RwLock<AuthState>,
}

impl RegistryAuth {
    /// Create an uninitialized auth manager for the configured registry.
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            required: config.require_auth,
            username: config.username.clone(),
            base_uri: config.base_uri().to_string(),
            token_url: config.token_url(),
            password: RwLock::new(None),
            token: Mutex::new(None),
            state: RwLock::new(AuthState::Uninitialized),
        }
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn state(&self) -> AuthState {
        *self.state.read()
    }

    fn set_state(&self, state: AuthState) {
        tracing::debug!("Auth state for {}: {:?}", self.base_uri, state);
        *self.state.write() = state;
    }

    /// Absolute expiry of the current token as Unix seconds.
    pub async fn token_expiry(&self) -> Option<i64> {
        self.token.lock().await.as_ref().map(BearerToken::expires_at)
    }

    /// Resolve credentials, detect the API version and obtain a first token.
    ///
    /// Credentials are checked before any network traffic so a broken
    /// configuration is reported without touching the registry.
    pub async fn init(
        &self,
        http: &RegistryHttp,
        store: &dyn SecretStore,
    ) -> Result<ApiVersion, AuthError> {
        if self.state() == AuthState::Unsupported {
            return Err(AuthError::UnsupportedVersion);
        }

        if self.required {
            self.load_password(store).await?;
        }

        let version = self.detect_version(http).await?;
        self.set_state(AuthState::VersionDetected(version));

        if version == ApiVersion::V1 {
            self.set_state(AuthState::Unsupported);
            return Err(AuthError::UnsupportedVersion);
        }

        if self.required {
            self.get_bearer_token(http).await?;
        } else {
            self.set_state(AuthState::Authenticated);
        }

        tracing::info!("Registry {} speaks API {}", self.base_uri, version);
        Ok(version)
    }

    async fn load_password(&self, store: &dyn SecretStore) -> Result<(), AuthError> {
        if self.username.trim().is_empty() {
            return Err(AuthError::MissingCredential {
                what: "username".to_string(),
            });
        }

        let password = match store.get(store::PASSWORD).await {
            Ok(password) => password,
            Err(StoreError::NotFound { .. }) => {
                return Err(AuthError::MissingCredential {
                    what: "password".to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if password.is_empty() {
            return Err(AuthError::MissingCredential {
                what: "password".to_string(),
            });
        }
        open_password(&password)?;

        *self.password.write() = Some(password);
        Ok(())
    }

    /// `GET {base}/v2/`: a 404 means the registry predates API v2.
    pub async fn detect_version(&self, http: &RegistryHttp) -> Result<ApiVersion, AuthError> {
        let url = format!("{}/v2/", self.base_uri);
        let response = http
            .send(&url, |client| {
                client
                    .get(&url)
                    .header("Docker-Distribution-Api-Version", http::DISTRIBUTION_API_VERSION)
            })
            .await?;

        let version = if response.status() == StatusCode::NOT_FOUND {
            ApiVersion::V1
        } else {
            ApiVersion::V2
        };
        tracing::debug!("Version check {} -> HTTP {} ({})", url, response.status(), version);
        Ok(version)
    }

    /// Request a new token with HTTP Basic auth and replace the current one.
    ///
    /// Safe to call repeatedly; the previous token is dropped, which wipes
    /// its sealed buffer.
    pub async fn get_bearer_token(&self, http: &RegistryHttp) -> Result<(), AuthError> {
        let mut token = self.token.lock().await;
        self.renew_locked(http, &mut token).await
    }

    async fn renew_locked(
        &self,
        http: &RegistryHttp,
        slot: &mut Option<BearerToken>,
    ) -> Result<(), AuthError> {
        self.set_state(AuthState::AwaitingToken);
        let password = self
            .password
            .read()
            .clone()
            .ok_or(AuthError::NotInitialized)?;

        let url = self.token_url.as_str();
        tracing::debug!("Requesting bearer token from {}", url);

        // Wiped once the token request has completed.
        let secret = open_password(&password)?;
        let response = http
            .send(url, |client| {
                client
                    .get(url)
                    .basic_auth(&self.username, Some(secret.as_str()))
            })
            .await?;
        let response = http::expect_success(url, response)?;

        let body: TokenResponse =
            response
                .json()
                .await
                .map_err(|e| AuthError::MalformedResponse {
                    url: url.to_string(),
                    message: e.to_string(),
                })?;

        let token = BearerToken::from_response(body, Utc::now())?;
        tracing::debug!(
            "Bearer token expires at {} ({:?})",
            token.expires_at(),
            token.expires_at_utc()
        );
        *slot = Some(token);
        self.set_state(AuthState::Authenticated);
        Ok(())
    }

    /// Renew the token if it is absent or expired.
    ///
    /// Returns `true` if a renewal request was made.
    pub async fn ensure_token(&self, http: &RegistryHttp) -> Result<bool, AuthError> {
        let mut token = self.token.lock().await;
        self.ensure_locked(http, &mut token).await
    }

    async fn ensure_locked(
        &self,
        http: &RegistryHttp,
        slot: &mut Option<BearerToken>,
    ) -> Result<bool, AuthError> {
        match self.state() {
            AuthState::Uninitialized | AuthState::VersionDetected(_) => {
                return Err(AuthError::NotInitialized);
            }
            AuthState::Unsupported => return Err(AuthError::UnsupportedVersion),
            AuthState::AwaitingToken | AuthState::Authenticated => {}
        }

        if !self.required {
            return Ok(false);
        }

        match token_status(slot.as_ref(), Utc::now()) {
            TokenStatus::Valid => Ok(false),
            status => {
                tracing::info!("Bearer token {:?}, renewing", status);
                self.renew_locked(http, slot).await?;
                Ok(true)
            }
        }
    }

    /// The `Authorization` header for the next registry request, renewing
    /// the token first if needed. `None` when the registry needs no auth.
    pub async fn authorization(
        &self,
        http: &RegistryHttp,
    ) -> Result<Option<HeaderValue>, AuthError> {
        let mut slot = self.token.lock().await;
        self.ensure_locked(http, &mut slot).await?;

        let Some(token) = slot.as_ref() else {
            return Ok(None);
        };

        let value = Zeroizing::new(token.authorization_header()?);
        let mut header = HeaderValue::from_str(&value).map_err(|e| AuthError::MalformedResponse {
            url: self.token_url.clone(),
            message: format!("token is not a valid header value: {}", e),
        })?;
        header.set_sensitive(true);
        Ok(Some(header))
    }
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("required", &self.required)
            .field("username", &self.username)
            .field("token_url", &self.token_url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Open the sealed password for HTTP Basic auth, which needs UTF-8 text.
fn open_password(password: &SealedSecret) -> Result<Zeroizing<String>, AuthError> {
    password
        .with_opened(|bytes| std::str::from_utf8(bytes).map(|p| Zeroizing::new(p.to_string())))?
        .map_err(|_| AuthError::InvalidCredential {
            what: "password".to_string(),
            reason: "it is not valid UTF-8".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn config() -> RegistryConfig {
        RegistryConfig::new("http://127.0.0.1:9").with_auth("robot")
    }

    #[test]
    fn test_api_version_display() {
        assert_eq!(ApiVersion::V2.to_string(), "v2");
        assert_eq!(ApiVersion::V1.as_str(), "v1");
    }

    #[test]
    fn test_new_is_uninitialized() {
        let auth = RegistryAuth::new(&config());
        assert_eq!(auth.state(), AuthState::Uninitialized);
        assert!(auth.is_required());
        assert_eq!(auth.username(), "robot");
    }

    #[tokio::test]
    async fn test_init_without_password_is_configuration_fault() {
        let auth = RegistryAuth::new(&config());
        let http = RegistryHttp::new(&config()).unwrap();
        let store = MemoryStore::new();

        let err = auth.init(&http, &store).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingCredential { ref what } if what == "password"));
        assert!(err.is_configuration_fault());
        assert_eq!(auth.state(), AuthState::Uninitialized);
    }

    #[tokio::test]
    async fn test_init_without_username_is_configuration_fault() {
        let config = RegistryConfig::new("http://127.0.0.1:9").with_auth("");
        let auth = RegistryAuth::new(&config);
        let http = RegistryHttp::new(&config).unwrap();
        let store = MemoryStore::new();
        store.add(store::PASSWORD, &mut b"pw".to_vec()).await.unwrap();

        let err = auth.init(&http, &store).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingCredential { ref what } if what == "username"));
    }

    #[tokio::test]
    async fn test_init_with_non_utf8_password_is_configuration_fault() {
        let auth = RegistryAuth::new(&config());
        let http = RegistryHttp::new(&config()).unwrap();
        let store = MemoryStore::new();
        store
            .add(store::PASSWORD, &mut vec![0xff, 0xfe, 0x41])
            .await
            .unwrap();

        let err = auth.init(&http, &store).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential { ref what, .. } if what == "password"));
        assert!(err.is_configuration_fault());
    }

    #[test]
    fn test_open_password() {
        let password = SealedSecret::seal_vec(b"hunter2".to_vec()).unwrap();
        assert_eq!(open_password(&password).unwrap().as_str(), "hunter2");

        let password = SealedSecret::seal_vec(vec![0xff, 0xfe, 0x41]).unwrap();
        assert!(matches!(
            open_password(&password),
            Err(AuthError::InvalidCredential { .. })
        ));
    }

    #[tokio::test]
    async fn test_authorization_before_init() {
        let auth = RegistryAuth::new(&config());
        let http = RegistryHttp::new(&config()).unwrap();

        let err = auth.authorization(&http).await.unwrap_err();
        assert!(matches!(err, AuthError::NotInitialized));
    }

    #[test]
    fn test_debug_has_no_secrets() {
        let auth = RegistryAuth::new(&config());
        let debug = format!("{:?}", auth);
        assert!(debug.contains("robot"));
        assert!(debug.contains("Uninitialized"));
    }
}
