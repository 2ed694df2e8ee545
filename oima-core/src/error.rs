//! Error types for registry operations, plus the top-level [`OimaError`].

use thiserror::Error;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::http::HttpError;
use crate::signature::SignatureError;
use crate::store::StoreError;

/// Error type for catalog, image and tag operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Authentication failed or the registry is unsupported.
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    /// A request failed or returned an unexpected status.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// A response body could not be decoded.
    #[error("malformed response from {url}: {message}")]
    MalformedBody { url: String, message: String },

    /// A response lacked a header the protocol requires.
    #[error("response from {url} is missing the {header} header")]
    MissingHeader { url: String, header: String },

    /// An operation was invoked on an entity that cannot support it.
    #[error("internal error: {message}")]
    Internal { message: String },

    /// `init` has not completed successfully.
    #[error("registry has not been initialized")]
    NotInitialized,

    /// A concurrent fetch task panicked or was cancelled.
    #[error("fetch task failed: {message}")]
    TaskFailed { message: String },
}

impl RegistryError {
    /// Whether retrying the whole operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RegistryError::Http(e) => e.is_transient(),
            RegistryError::Auth(AuthError::Http(e)) => e.is_transient(),
            _ => false,
        }
    }

    /// Whether the operator has to change the configuration.
    pub fn is_configuration_fault(&self) -> bool {
        match self {
            RegistryError::Auth(e) => e.is_configuration_fault(),
            _ => false,
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        RegistryError::Internal {
            message: message.into(),
        }
    }
}

impl From<tokio::task::JoinError> for RegistryError {
    fn from(e: tokio::task::JoinError) -> Self {
        RegistryError::TaskFailed {
            message: e.to_string(),
        }
    }
}

/// Top-level error type encompassing all oima errors.
#[derive(Debug, Error)]
pub enum OimaError {
    /// Error from secret storage operations.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Error from authentication.
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    /// Error from registry operations.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Error from the signature checker.
    #[error("signature error: {0}")]
    Signature(#[from] SignatureError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl OimaError {
    /// Whether the operator has to change the configuration.
    pub fn is_configuration_fault(&self) -> bool {
        match self {
            OimaError::Config(_) => true,
            OimaError::Auth(e) => e.is_configuration_fault(),
            OimaError::Registry(e) => e.is_configuration_fault(),
            OimaError::Signature(e) => e.is_configuration_fault(),
            OimaError::Store(_) => false,
        }
    }
}
