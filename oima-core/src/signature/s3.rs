//! Signature lookup in S3-compatible object storage.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::ProvideErrorMetadata;
use tokio::task::JoinSet;

use super::{SignatureChecker, SignatureError, signature_object_key};
use crate::config::S3Config;
use crate::model::Tag;
use crate::store::{self, SecretStore};

/// [`SignatureChecker`] backed by an S3 bucket (AWS, MinIO, ...).
#[derive(Clone)]
pub struct S3SignatureChecker {
    client: Client,
    bucket: String,
}

impl S3SignatureChecker {
    /// Build a client for the configured endpoint.
    ///
    /// The access keys are read from `store` and opened only while the
    /// credentials provider is constructed.
    pub async fn new(config: &S3Config, store: &dyn SecretStore) -> Result<Self, SignatureError> {
        if !config.enabled {
            return Err(SignatureError::Disabled);
        }

        let access_key_id = store.get(store::S3_ACCESS_KEY_ID).await?;
        let secret_access_key = store.get(store::S3_SECRET_ACCESS_KEY).await?;
        let credentials = access_key_id.with_opened_str(|id| {
            secret_access_key
                .with_opened_str(|secret| Credentials::new(id, secret, None, None, "oima-config"))
        })??;

        let endpoint = config.endpoint_url();
        tracing::debug!("Using S3 endpoint {} (bucket {})", endpoint, config.bucket_name);

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .endpoint_url(endpoint)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket_name.clone(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn exists(client: &Client, bucket: &str, key: &str) -> Result<bool, SignatureError> {
        tracing::debug!("HEAD s3://{}/{}", bucket, key);

        match client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let status = e.raw_response().map(|r| r.status().as_u16());
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    return Ok(false);
                }
                Err(classify_error(
                    bucket,
                    service_error.code(),
                    status,
                    service_error.to_string(),
                ))
            }
        }
    }
}

impl std::fmt::Debug for S3SignatureChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3SignatureChecker")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

/// Map an S3 error code or HTTP status to a [`SignatureError`].
fn classify_error(
    bucket: &str,
    code: Option<&str>,
    status: Option<u16>,
    message: String,
) -> SignatureError {
    let bucket = bucket.to_string();
    match (code, status) {
        (Some("AccessDenied" | "Forbidden"), _) | (None, Some(403)) => {
            SignatureError::AccessDenied { bucket }
        }
        (Some("NoSuchBucket"), _) => SignatureError::NoSuchBucket { bucket },
        (Some("InvalidBucketName"), _) => SignatureError::InvalidBucketName { bucket },
        _ => SignatureError::Backend { message },
    }
}

#[async_trait]
impl SignatureChecker for S3SignatureChecker {
    async fn check(
        &self,
        registry_uri: &str,
        image_path: &str,
        tags: &[Tag],
    ) -> Result<Vec<bool>, SignatureError> {
        let mut tasks = JoinSet::new();
        for (index, tag) in tags.iter().enumerate() {
            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let key = signature_object_key(registry_uri, image_path, &tag.content_digest);
            tasks.spawn(async move {
                let found = Self::exists(&client, &bucket, &key).await?;
                Ok::<_, SignatureError>((index, found))
            });
        }

        let mut flags = vec![false; tags.len()];
        while let Some(result) = tasks.join_next().await {
            let (index, found) = result.map_err(|e| SignatureError::Backend {
                message: format!("signature check task failed: {}", e),
            })??;
            flags[index] = found;
        }

        Ok(flags)
    }

    async fn delete(
        &self,
        registry_uri: &str,
        image_path: &str,
        tag: &Tag,
    ) -> Result<(), SignatureError> {
        let key = signature_object_key(registry_uri, image_path, &tag.content_digest);
        tracing::info!("Deleting s3://{}/{}", self.bucket, key);

        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let status = e.raw_response().map(|r| r.status().as_u16());
                let service_error = e.into_service_error();
                if service_error.code() == Some("NoSuchKey") {
                    return Ok(());
                }
                Err(classify_error(
                    &self.bucket,
                    service_error.code(),
                    status,
                    service_error.to_string(),
                ))
            }
        }
    }
}
