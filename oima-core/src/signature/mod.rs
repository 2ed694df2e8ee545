//! Detached signature lookup.
//!
//! Signatures live in object storage next to the registry, one object per
//! manifest digest, using the sigstore layout:
//!
//! ```text
//! {registry_host}/{image_path}@{algorithm}={hex}/signature-1
//! ```
//!
//! Only presence is checked; the signature content is never verified.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::Tag;
use crate::store::StoreError;

#[cfg(feature = "s3")]
mod s3;

#[cfg(feature = "s3")]
pub use s3::S3SignatureChecker;

/// Name of the signature object below each digest prefix.
pub const SIGNATURE_OBJECT: &str = "signature-1";

/// Error type for signature lookups.
#[derive(Debug, Error)]
pub enum SignatureError {
    /// Signature lookup is not configured.
    #[error("signature storage is disabled")]
    Disabled,

    /// The credentials were rejected.
    #[error("access denied to bucket '{bucket}'")]
    AccessDenied { bucket: String },

    #[error("bucket '{bucket}' does not exist")]
    NoSuchBucket { bucket: String },

    #[error("'{bucket}' is not a valid bucket name")]
    InvalidBucketName { bucket: String },

    /// Any other storage failure.
    #[error("signature storage error: {message}")]
    Backend { message: String },

    /// A storage credential could not be read.
    #[error("secret store error: {0}")]
    Store(#[from] StoreError),
}

impl SignatureError {
    /// Whether the operator has to change the storage configuration.
    pub fn is_configuration_fault(&self) -> bool {
        matches!(
            self,
            SignatureError::Disabled
                | SignatureError::AccessDenied { .. }
                | SignatureError::NoSuchBucket { .. }
                | SignatureError::InvalidBucketName { .. }
        )
    }
}

/// Checks and removes detached signatures for image tags.
#[async_trait]
pub trait SignatureChecker: Send + Sync {
    /// One flag per tag, in the order of `tags`.
    async fn check(
        &self,
        registry_uri: &str,
        image_path: &str,
        tags: &[Tag],
    ) -> Result<Vec<bool>, SignatureError>;

    /// Delete the signature of one tag. Deleting an absent signature is not
    /// an error.
    async fn delete(
        &self,
        registry_uri: &str,
        image_path: &str,
        tag: &Tag,
    ) -> Result<(), SignatureError>;
}

/// Registry URI reduced to the form used as the first key segment:
/// scheme stripped and every `/` removed.
pub fn prepare_registry_path(registry_uri: &str) -> String {
    let without_scheme = registry_uri
        .strip_prefix("https://")
        .or_else(|| registry_uri.strip_prefix("http://"))
        .unwrap_or(registry_uri);
    without_scheme.replace('/', "")
}

/// Object key of the signature for `digest` of `image_path`.
pub fn signature_object_key(registry_uri: &str, image_path: &str, digest: &str) -> String {
    format!(
        "{}/{}@{}/{}",
        prepare_registry_path(registry_uri),
        image_path,
        digest.replace(':', "="),
        SIGNATURE_OBJECT
    )
}
