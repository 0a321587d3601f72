//! Upload coordinator: admits parts, hands out signed PUT URLs and records
//! completion.

use crate::download::DownloadCoordinator;
use crate::error::{ApiError, ApiResult};
use crate::factory::StorageFactory;
use crate::metrics::{FILES_COMPLETED, PARTS_ADMITTED, PARTS_COMPLETED, PARTS_SKIPPED};
use ferry_core::hash::validate_hex_digest;
use ferry_core::{UploadChecksum, UploadCreateResult, UploadError, UploadJob, UploadRequest};
use ferry_metadata::{
    FileRepo, MetadataError, MetadataStore, NewPart, PartRepo, StorageProviderRepo,
};
use ferry_storage::Storage;
use futures::StreamExt;
use futures::stream;
use std::sync::Arc;
use tracing::instrument;

/// Announcements from one batch processed concurrently.
const CREATE_CONCURRENCY: usize = 16;

/// Handlers for one upload session, bound to a scope name and a provider.
pub struct UploadCoordinator {
    name: String,
    storage_provider_id: String,
    bucket: String,
    storage: Arc<dyn Storage>,
    metadata: Arc<dyn MetadataStore>,
    downloads: Arc<DownloadCoordinator>,
}

impl UploadCoordinator {
    /// Resolve the session's provider and make sure its bucket exists.
    ///
    /// An unknown provider refuses the upgrade with 403.
    #[instrument(skip(metadata, factory, downloads))]
    pub async fn connect(
        name: &str,
        storage_provider_id: &str,
        metadata: Arc<dyn MetadataStore>,
        factory: &dyn StorageFactory,
        downloads: Arc<DownloadCoordinator>,
    ) -> ApiResult<Self> {
        let provider = metadata
            .get_storage_provider(storage_provider_id)
            .await?
            .ok_or_else(|| ApiError::UnknownProvider(storage_provider_id.to_string()))?;
        let storage = factory.storage(&provider)?;
        let bucket = storage.require_bucket_name(name).await?;
        tracing::debug!(%bucket, backend = storage.backend_name(), "upload session bound");

        Ok(Self {
            name: name.to_string(),
            storage_provider_id: storage_provider_id.to_string(),
            bucket,
            storage,
            metadata,
            downloads,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage_provider_id(&self) -> &str {
        &self.storage_provider_id
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Handle `upload:create`. Results are index-aligned with `requests`.
    #[instrument(skip_all, fields(n = %self.name, parts = requests.len()))]
    pub async fn create(&self, requests: Vec<UploadRequest>) -> Vec<UploadCreateResult> {
        stream::iter(requests)
            .map(|request| self.create_one(request))
            .buffered(CREATE_CONCURRENCY)
            .collect()
            .await
    }

    async fn create_one(&self, request: UploadRequest) -> UploadCreateResult {
        match self.admit(&request).await {
            Ok(Some(job)) => {
                PARTS_ADMITTED.inc();
                UploadCreateResult::Job(job)
            }
            Ok(None) => {
                PARTS_SKIPPED.inc();
                UploadCreateResult::Error(UploadError::UploadExists)
            }
            Err(e) => {
                log_rejection("upload:create", &request.path, &e);
                UploadCreateResult::Error(UploadError::Unknown)
            }
        }
    }

    async fn admit(&self, request: &UploadRequest) -> ApiResult<Option<UploadJob>> {
        if request.path.is_empty() {
            return Err(MetadataError::Constraint("empty path".to_string()).into());
        }
        let checksum_md5 = validate_hex_digest(&request.checksum_md5, 16)
            .map_err(|e| MetadataError::Constraint(e.to_string()))?;

        let part = NewPart {
            range: request.range,
            checksum_md5: checksum_md5.clone(),
            size: request.size,
        };
        if !self.metadata.add_part(&self.name, &request.path, &part).await? {
            return Ok(None);
        }

        let key = ferry_core::part_key(&request.path, &request.range);
        let url = self.storage.get_upload_url(&self.bucket, &key).await?;
        Ok(Some(UploadJob {
            path: request.path.clone(),
            range: request.range,
            checksum_md5,
            size: request.size,
            url,
        }))
    }

    /// Handle `upload:complete`.
    #[instrument(skip_all, fields(n = %self.name, path = %job.path, range = %job.range))]
    pub async fn complete(&self, job: UploadJob) -> Option<UploadError> {
        match self.complete_inner(&job).await {
            Ok(()) => None,
            Err(e) => {
                log_rejection("upload:complete", &job.path, &e);
                Some(UploadError::Unknown)
            }
        }
    }

    async fn complete_inner(&self, job: &UploadJob) -> ApiResult<()> {
        let checksum_md5 = job.checksum_md5.to_ascii_lowercase();
        self.metadata
            .complete_part(&self.name, &job.path, job.range, &checksum_md5)
            .await?;
        PARTS_COMPLETED.inc();

        if let Some(file) = self.metadata.get_file(&self.name, &job.path).await?
            && self.metadata.is_file_complete(&file).await?
        {
            tracing::info!(n = %self.name, path = %job.path, "file upload complete");
            FILES_COMPLETED.inc();
            self.downloads.wake();
        }
        Ok(())
    }

    /// Handle `upload:checksum`.
    #[instrument(skip_all, fields(n = %self.name, path = %checksum.path))]
    pub async fn checksum(&self, checksum: UploadChecksum) -> Option<UploadError> {
        let result = async {
            let digest = validate_hex_digest(&checksum.checksum_sha256, 32)
                .map_err(|e| MetadataError::Constraint(e.to_string()))?;
            self.metadata
                .set_checksum_sha256(&self.name, &checksum.path, &digest)
                .await?;
            if let Some(file) = self.metadata.get_file(&self.name, &checksum.path).await?
                && self.metadata.is_file_complete(&file).await?
            {
                self.downloads.wake();
            }
            Ok::<_, ApiError>(())
        }
        .await;

        match result {
            Ok(()) => None,
            Err(e) => {
                log_rejection("upload:checksum", &checksum.path, &e);
                Some(UploadError::Unknown)
            }
        }
    }
}

fn log_rejection(event: &str, path: &str, error: &ApiError) {
    match error {
        ApiError::Metadata(e) if e.is_business() => {
            tracing::debug!(event, path, error = %e, "rejected");
        }
        other => {
            tracing::warn!(event, path, error = %other, "failed");
        }
    }
}
