//! HTTP plumbing shared by the auth manager and the catalog crawler.
//!
//! Every request goes through [`RegistryHttp::send`], which bounds the number
//! of requests in flight, applies the per-request timeout configured on the
//! client and retries transient failures with exponential backoff.

use reqwest::header::{HeaderMap, LINK};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::config::{RegistryConfig, RetryPolicy};

/// Fixed client identifier sent with every request.
pub const USER_AGENT: &str = "oima-client";

/// Value of the `Docker-Distribution-Api-Version` request header.
pub const DISTRIBUTION_API_VERSION: &str = "registry/2.0";

/// Media type requested when resolving a tag to its manifest digest.
pub const MANIFEST_V2_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Response header carrying a manifest's content digest.
pub const CONTENT_DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Transport-level failure of a single request.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The request never produced a response.
    #[error("request to {url} failed: {message}")]
    Network {
        url: String,
        message: String,
        transient: bool,
    },

    /// The server answered with an unexpected status.
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {message}")]
    Client { message: String },
}

impl HttpError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            HttpError::Network { transient, .. } => *transient,
            HttpError::Status { status, .. } => is_transient_status(*status),
            HttpError::Client { .. } => false,
        }
    }

    fn from_reqwest(url: &str, error: reqwest::Error) -> Self {
        let transient = error.is_timeout() || error.is_connect() || error.is_request();
        HttpError::Network {
            url: url.to_string(),
            message: error.to_string(),
            transient,
        }
    }
}

fn is_transient_status(status: u16) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS.as_u16() || (500..600).contains(&status)
}

/// Shared, cheaply cloneable HTTP client for registry traffic.
#[derive(Clone)]
pub struct RegistryHttp {
    client: Client,
    retry: RetryPolicy,
    limiter: Arc<Semaphore>,
}

impl RegistryHttp {
    /// Build a client from registry settings.
    pub fn new(config: &RegistryConfig) -> Result<Self, HttpError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout())
            .build()
            .map_err(|e| HttpError::Client {
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            retry: config.retry,
            limiter: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Send the request produced by `build`, retrying transient failures.
    ///
    /// Any response whose status is not a transient failure is returned as
    /// is, so callers decide what a 404 means. `build` is invoked once per
    /// attempt.
    pub async fn send<F>(&self, url: &str, build: F) -> Result<Response, HttpError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = {
                let _permit = self.limiter.acquire().await.map_err(|e| HttpError::Client {
                    message: format!("request limiter closed: {}", e),
                })?;
                build(&self.client).send().await
            };

            let error = match result {
                Ok(response) if is_transient_status(response.status().as_u16()) => {
                    HttpError::Status {
                        url: url.to_string(),
                        status: response.status().as_u16(),
                    }
                }
                Ok(response) => return Ok(response),
                Err(e) => HttpError::from_reqwest(url, e),
            };

            if !error.is_transient() || attempt >= attempts {
                return Err(error);
            }

            let delay = self.retry.delay_for(attempt);
            tracing::warn!(
                "Attempt {}/{} for {} failed ({}), retrying in {:?}",
                attempt,
                attempts,
                url,
                error,
                delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

impl std::fmt::Debug for RegistryHttp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryHttp")
            .field("retry", &self.retry)
            .field("available_permits", &self.limiter.available_permits())
            .finish()
    }
}

/// Turn any non-2xx response into [`HttpError::Status`].
pub fn expect_success(url: &str, response: Response) -> Result<Response, HttpError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(HttpError::Status {
            url: url.to_string(),
            status: response.status().as_u16(),
        })
    }
}

/// Resolve the `rel="next"` target of a paginated registry listing.
///
/// Registries return a relative reference such as
/// `</v2/_catalog?last=nginx&n=100>; rel="next"`, which is resolved
/// against `base_uri`.
pub fn next_page(headers: &HeaderMap, base_uri: &str) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;

    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.contains("rel=\"next\"") && !params.contains("rel=next") {
            return None;
        }
        let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
        if target.starts_with("http://") || target.starts_with("https://") {
            Some(target.to_string())
        } else {
            Some(format!(
                "{}/{}",
                base_uri.trim_end_matches('/'),
                target.trim_start_matches('/')
            ))
        }
    })
}

/// Whether `url` has the same scheme, host and port as `base_uri`.
pub fn same_origin(url: &str, base_uri: &str) -> bool {
    match (url::Url::parse(url), url::Url::parse(base_uri)) {
        (Ok(url), Ok(base)) => url.origin() == base.origin(),
        _ => false,
    }
}
