//! HTTP transfer of single parts against presigned URLs.

use crate::error::{ClientError, ClientResult};
use backon::{ExponentialBuilder, Retryable};
use ferry_core::hash::{PartHasher, normalize_etag};
use ferry_core::{DownloadJob, UploadJob};
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, ETAG};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;

const STREAM_CHUNK: usize = 256 * 1024;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Moves part bytes between local files and object storage.
#[derive(Clone)]
pub struct Transfer {
    http: reqwest::Client,
    max_retries: usize,
    min_delay: Duration,
}

impl Transfer {
    pub fn new(http: reqwest::Client, max_retries: usize) -> Self {
        Self {
            http,
            max_retries,
            min_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(MAX_RETRY_DELAY)
            .with_max_times(self.max_retries)
    }

    /// PUT the bytes of `job.range` from `path` to the job URL.
    ///
    /// The body is hashed as it streams. The result must match the ETag, when
    /// storage returns one, and the part checksum.
    pub async fn upload_part(&self, job: &UploadJob, path: &Path) -> ClientResult<u64> {
        (|| self.put_once(job, path))
            .retry(self.backoff())
            .when(ClientError::is_transient)
            .notify(|e, delay| {
                tracing::warn!(part = %job.part_key(), error = %e, ?delay, "upload failed, retrying");
            })
            .await
    }

    async fn put_once(&self, job: &UploadJob, path: &Path) -> ClientResult<u64> {
        let size = job.range.size();
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(SeekFrom::Start(job.range.start())).await?;

        let hasher = Arc::new(Mutex::new(PartHasher::new()));
        let sink = hasher.clone();
        let body = ReaderStream::with_capacity(file.take(size), STREAM_CHUNK).inspect_ok(
            move |chunk| {
                if let Ok(mut hasher) = sink.lock() {
                    hasher.update(chunk);
                }
            },
        );

        let response = self
            .http
            .put(&job.url)
            .header(CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::InvalidResponse {
                status: status.as_u16(),
            });
        }

        let computed = hasher
            .lock()
            .map(|hasher| hasher.clone().finalize_hex())
            .map_err(|_| ClientError::Session("part hasher poisoned".to_string()))?;
        if let Some(etag) = response.headers().get(ETAG).and_then(|v| v.to_str().ok()) {
            let etag = normalize_etag(etag);
            if etag != computed {
                return Err(ClientError::EtagMismatch { computed, etag });
            }
        }
        if computed != job.checksum_md5 {
            return Err(ClientError::ChecksumMismatch {
                subject: job.part_key(),
                expected: job.checksum_md5.clone(),
                actual: computed,
            });
        }
        Ok(size)
    }

    /// GET the part object and write it into `path` at the range offset.
    ///
    /// Verified the same way as uploads: against the response ETag when
    /// present, then against the part checksum.
    pub async fn download_part(&self, job: &DownloadJob, path: &Path) -> ClientResult<u64> {
        (|| self.get_once(job, path))
            .retry(self.backoff())
            .when(ClientError::is_transient)
            .notify(|e, delay| {
                tracing::warn!(part = %job.part_key(), error = %e, ?delay, "download failed, retrying");
            })
            .await
    }

    async fn get_once(&self, job: &DownloadJob, path: &Path) -> ClientResult<u64> {
        let response = self.http.get(&job.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::InvalidResponse {
                status: status.as_u16(),
            });
        }
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(normalize_etag);

        let expected = job.range.size();
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;
        file.seek(SeekFrom::Start(job.range.start())).await?;

        let mut hasher = PartHasher::new();
        let mut received = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            received += chunk.len() as u64;
            if received > expected {
                return Err(ClientError::SizeMismatch {
                    expected,
                    actual: received,
                });
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        if received != expected {
            return Err(ClientError::SizeMismatch {
                expected,
                actual: received,
            });
        }
        let computed = hasher.finalize_hex();
        if let Some(etag) = etag {
            if etag != computed {
                return Err(ClientError::EtagMismatch { computed, etag });
            }
        }
        if computed != job.checksum_md5 {
            return Err(ClientError::ChecksumMismatch {
                subject: job.part_key(),
                expected: job.checksum_md5.clone(),
                actual: computed,
            });
        }
        Ok(received)
    }
}
