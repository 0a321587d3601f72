//! S3-compatible storage backend using AWS SDK.

use crate::bucket::bucket_name;
use crate::error::{StorageError, StorageResult};
use crate::template::expand_download_template;
use crate::traits::{BUCKET_PREFIX, ObjectStream, Storage, StorageObject};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use ferry_core::StorageProvider;
use ferry_core::config::StorageSettings;
use std::time::Duration;
use tracing::instrument;

pub(crate) fn map_s3_operation_error<E>(err: aws_sdk_s3::error::SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StorageError::S3(Box::new(err))
}

/// Prepend `http://` to bare `host:port` endpoints.
fn normalize_endpoint(endpoint: &str) -> String {
    let lower = endpoint.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        endpoint.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", endpoint.trim_end_matches('/'))
    }
}

/// S3-compatible storage using presigned URLs for all object transfers.
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    endpoint: String,
    access_key_id: String,
    location_constraint: Option<String>,
    download_url_template: Option<String>,
    upload_url_ttl: Duration,
    download_url_ttl: Duration,
    identity: String,
}

impl std::fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Storage")
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("location_constraint", &self.location_constraint)
            .finish_non_exhaustive()
    }
}

impl S3Storage {
    /// Build a client for a provider. Static credentials and path-style
    /// addressing are always used; no request is made here.
    pub fn new(provider: &StorageProvider, settings: &StorageSettings) -> StorageResult<Self> {
        let credentials = &provider.credentials;
        if credentials.access_key_id.is_empty() || credentials.secret_access_key.is_empty() {
            return Err(StorageError::Config(format!(
                "storage provider '{}' requires both access_key_id and secret_access_key",
                provider.id
            )));
        }
        if provider.endpoint.is_empty() {
            return Err(StorageError::Config(format!(
                "storage provider '{}' has no endpoint",
                provider.id
            )));
        }

        let endpoint = normalize_endpoint(&provider.endpoint);
        let region = if provider.region.is_empty() {
            "us-east-1".to_string()
        } else {
            provider.region.clone()
        };

        let s3_credentials = aws_sdk_s3::config::Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.clone(),
            None, // session token
            None, // expiration
            "ferry-provider",
        );
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(region))
            .credentials_provider(s3_credentials)
            .endpoint_url(&endpoint)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(config),
            endpoint,
            access_key_id: credentials.access_key_id.clone(),
            location_constraint: provider.bucket_location_constraint.clone(),
            download_url_template: provider.download_url_template.clone(),
            upload_url_ttl: settings.upload_url_ttl(),
            download_url_ttl: settings.download_url_ttl(),
            identity: provider.identity(),
        })
    }

    fn presigning(ttl: Duration) -> StorageResult<PresigningConfig> {
        PresigningConfig::expires_in(ttl)
            .map_err(|e| StorageError::Config(format!("invalid presigned URL lifetime: {e}")))
    }

    async fn create_bucket(&self, bucket: &str) -> StorageResult<()> {
        let mut request = self.client.create_bucket().bucket(bucket);
        if let Some(constraint) = &self.location_constraint {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(constraint.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                tracing::info!(bucket, "created bucket");
                Ok(())
            }
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_bucket_already_owned_by_you()) =>
            {
                Ok(())
            }
            Err(err) => Err(map_s3_operation_error(err)),
        }
    }
}

#[async_trait]
impl Storage for S3Storage {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn require_bucket_name(&self, scope: &str) -> StorageResult<String> {
        let bucket = bucket_name(scope, &self.access_key_id);
        self.create_bucket(&bucket).await?;
        Ok(bucket)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get_upload_url(&self, bucket: &str, key: &str) -> StorageResult<String> {
        let presigned = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .presigned(Self::presigning(self.upload_url_ttl)?)
            .await
            .map_err(map_s3_operation_error)?;
        Ok(presigned.uri().to_string())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get_download_url(&self, bucket: &str, key: &str) -> StorageResult<String> {
        if let Some(template) = &self.download_url_template {
            return Ok(expand_download_template(template, bucket, key));
        }
        let presigned = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(Self::presigning(self.download_url_ttl)?)
            .await
            .map_err(map_s3_operation_error)?;
        Ok(presigned.uri().to_string())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete_file(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }

    fn list_objects(&self) -> ObjectStream {
        let client = self.client.clone();

        let stream = async_stream::try_stream! {
            let buckets = client
                .list_buckets()
                .send()
                .await
                .map_err(map_s3_operation_error)?;
            let names: Vec<String> = buckets
                .buckets()
                .iter()
                .filter_map(|b| b.name())
                .filter(|name| name.starts_with(BUCKET_PREFIX))
                .map(str::to_string)
                .collect();

            for bucket in names {
                let mut continuation_token: Option<String> = None;

                loop {
                    let mut request = client.list_objects_v2().bucket(&bucket);
                    if let Some(token) = continuation_token.take() {
                        request = request.continuation_token(token);
                    }

                    let output = request.send().await.map_err(map_s3_operation_error)?;

                    for obj in output.contents() {
                        if let Some(object) = listed_object(&bucket, obj) {
                            yield object;
                        }
                    }

                    if output.is_truncated() == Some(true) {
                        continuation_token = output.next_continuation_token().map(|s| s.to_string());
                    } else {
                        break;
                    }
                }
            }
        };

        Box::pin(stream)
    }

    fn identity(&self) -> String {
        self.identity.clone()
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}

/// Convert a listing entry. Entries without a key or a usable size are
/// skipped: a missing size must not make a stored part look empty.
fn listed_object(bucket: &str, obj: &aws_sdk_s3::types::Object) -> Option<StorageObject> {
    let key = obj.key()?;
    let Some(size) = obj.size().and_then(|s| u64::try_from(s).ok()) else {
        tracing::warn!(%bucket, %key, size = ?obj.size(), "skipping listed object without a size");
        return None;
    };
    Some(StorageObject {
        bucket: bucket.to_string(),
        key: key.to_string(),
        size,
        etag: obj.e_tag().unwrap_or_default().to_string(),
    })
}
