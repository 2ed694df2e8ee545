//! Registry bearer tokens.
//!
//! This module provides:
//! - [`BearerToken`] - A sealed token with an absolute expiry
//! - [`TokenResponse`] - The JSON body returned by the registry token endpoint
//! - [`TokenStatus`] - Absent / valid / expired classification

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

use crate::store::{SealedSecret, StoreError};

/// Body of a successful token endpoint response.
///
/// `expires_in` is relative, in seconds from the moment the response was
/// received.
#[derive(Deserialize)]
pub struct TokenResponse {
    pub token: String,
    pub expires_in: i64,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Where a token stands relative to the current time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    /// No token has been obtained yet.
    Absent,
    /// The token may be used.
    Valid,
    /// The token must be renewed before it is used again.
    Expired,
}

/// A registry bearer token, sealed in memory.
#[derive(Clone)]
pub struct BearerToken {
    token: Arc<SealedSecret>,
    expires_at: i64,
}

impl BearerToken {
    /// Seal `token` with an absolute expiry given as Unix seconds.
    pub fn new(token: Vec<u8>, expires_at: i64) -> Result<Self, StoreError> {
        Ok(Self {
            token: Arc::new(SealedSecret::seal_vec(token)?),
            expires_at,
        })
    }

    /// Build a token from an endpoint response received at `now`.
    ///
    /// Lifetimes past the end of the `i64` range saturate.
    pub fn from_response(response: TokenResponse, now: DateTime<Utc>) -> Result<Self, StoreError> {
        let TokenResponse { token, expires_in } = response;
        Self::new(token.into_bytes(), now.timestamp().saturating_add(expires_in))
    }

    /// Absolute expiry as Unix seconds.
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    /// Absolute expiry as a timestamp, if representable.
    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.expires_at, 0)
    }

    /// A token is expired once `now >= expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Render the `Authorization` header value, opening the token only for
    /// the duration of the formatting.
    pub fn authorization_header(&self) -> Result<String, StoreError> {
        self.token.with_opened_str(|token| format!("Bearer {}", token))
    }

    /// Run `f` with the opened token.
    pub fn with_opened<R>(&self, f: impl FnOnce(&str) -> R) -> Result<R, StoreError> {
        self.token.with_opened_str(f)
    }
}

impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerToken")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Classify an optional token at `now`.
pub fn token_status(token: Option<&BearerToken>, now: DateTime<Utc>) -> TokenStatus {
    match token {
        None => TokenStatus::Absent,
        Some(token) if token.is_expired_at(now) => TokenStatus::Expired,
        Some(_) => TokenStatus::Valid,
    }
}
