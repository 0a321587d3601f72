//! Upload client: hash local files, announce their parts and push the
//! admitted ones to storage.

use crate::checksum::ChecksumPool;
use crate::error::{ClientError, ClientResult};
use crate::parts::split_ranges;
use crate::queue::JobQueue;
use crate::session::ClientSession;
use crate::transfer::Transfer;
use ferry_core::config::ClientConfig;
use ferry_core::{
    Event, Range, Reply, UploadChecksum, UploadCreateResult, UploadError, UploadJob, UploadRequest,
};
use futures::{StreamExt, TryStreamExt, stream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::instrument;

/// Totals for one upload run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub files: u64,
    pub uploaded: u64,
    pub skipped: u64,
    pub failed: u64,
    pub bytes: u64,
}

#[derive(Default)]
struct Counters {
    uploaded: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
}

/// A local file and the path it is stored under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    pub remote_path: String,
    pub size: u64,
}

/// List the files under `root`, or `root` itself when it is a file.
///
/// Remote paths are relative to `root` and use `/` as separator. A single
/// file is stored under its file name.
pub fn scan_files(root: &Path) -> ClientResult<Vec<LocalFile>> {
    let metadata = std::fs::metadata(root)?;
    let mut files = Vec::new();
    if metadata.is_file() {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ClientError::Session(format!("no file name in {}", root.display())))?;
        files.push(LocalFile {
            path: root.to_path_buf(),
            remote_path: name,
            size: metadata.len(),
        });
    } else {
        walk_dir(root, root, &mut files)?;
        files.sort_by(|a, b| a.remote_path.cmp(&b.remote_path));
    }
    Ok(files)
}

fn walk_dir(root: &Path, current: &Path, files: &mut Vec<LocalFile>) -> ClientResult<()> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            walk_dir(root, &path, files)?;
        } else if metadata.is_file() {
            let relative = path.strip_prefix(root).map_err(std::io::Error::other)?;
            files.push(LocalFile {
                remote_path: relative.to_string_lossy().replace('\\', "/"),
                path,
                size: metadata.len(),
            });
        }
    }
    Ok(())
}

pub struct UploadClient {
    config: ClientConfig,
    session: ClientSession,
    transfer: Transfer,
    checksums: Arc<ChecksumPool>,
}

impl UploadClient {
    pub fn new(config: ClientConfig, session: ClientSession, transfer: Transfer) -> ClientResult<Self> {
        let checksums = Arc::new(ChecksumPool::new(config.checksum_threads())?);
        Ok(Self {
            config,
            session,
            transfer,
            checksums,
        })
    }

    /// Upload every file under `root` and wait for the queued parts.
    ///
    /// Parts that fail are counted rather than aborting the run; session
    /// errors abort it.
    #[instrument(skip(self), fields(root = %root.display()))]
    pub async fn upload_path(&self, root: &Path) -> ClientResult<UploadSummary> {
        let scan_root = root.to_path_buf();
        let files = tokio::task::spawn_blocking(move || scan_files(&scan_root))
            .await
            .map_err(|e| ClientError::Session(format!("file scan failed: {e}")))??;

        let queue = JobQueue::new(self.config.num_threads);
        let counters = Arc::new(Counters::default());
        let mut announced = 0;
        let mut result = Ok(());
        for file in &files {
            if file.size == 0 {
                tracing::warn!(path = %file.remote_path, "skipping empty file");
                continue;
            }
            announced += 1;
            if let Err(e) = self.upload_file(file, &queue, &counters).await {
                result = Err(e);
                break;
            }
        }
        queue.drain().await;
        result?;

        let summary = UploadSummary {
            files: announced,
            uploaded: counters.uploaded.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            bytes: counters.bytes.load(Ordering::Relaxed),
        };
        tracing::info!(
            files = summary.files,
            uploaded = summary.uploaded,
            skipped = summary.skipped,
            failed = summary.failed,
            bytes = summary.bytes,
            "upload finished"
        );
        Ok(summary)
    }

    async fn upload_file(
        &self,
        file: &LocalFile,
        queue: &JobQueue,
        counters: &Arc<Counters>,
    ) -> ClientResult<()> {
        let timeout = self.config.request_timeout();

        let checksum_sha256 = self.checksums.sha256_file(&file.path).await?;
        let reply = self
            .session
            .request(
                Event::UploadChecksum(UploadChecksum {
                    path: file.remote_path.clone(),
                    checksum_sha256,
                }),
                timeout,
            )
            .await?;
        match reply {
            Reply::UploadChecksum(None) => {}
            Reply::UploadChecksum(Some(error)) => {
                tracing::warn!(path = %file.remote_path, ?error, "checksum not recorded");
            }
            other => return Err(unexpected("upload:checksum", &other)),
        }

        let ranges = split_ranges(file.size, self.config.min_part_size, self.config.max_part_count);
        let requests: Vec<UploadRequest> = stream::iter(ranges)
            .map(|range| self.part_request(file, range))
            .buffered(self.config.checksum_threads())
            .try_collect()
            .await?;
        tracing::debug!(path = %file.remote_path, parts = requests.len(), "announcing parts");

        for batch in requests.chunks(self.config.create_batch_size) {
            let reply = self
                .session
                .request(Event::UploadCreate(batch.to_vec()), timeout)
                .await?;
            let results = match reply {
                Reply::UploadCreate(results) => results,
                other => return Err(unexpected("upload:create", &other)),
            };
            if results.len() != batch.len() {
                return Err(ClientError::Session(format!(
                    "upload:create answered {} of {} parts",
                    results.len(),
                    batch.len()
                )));
            }
            for (request, result) in batch.iter().zip(results) {
                match result {
                    UploadCreateResult::Job(job) => {
                        self.queue_part(job, file.path.clone(), queue, counters)?
                    }
                    UploadCreateResult::Error(UploadError::UploadExists) => {
                        tracing::debug!(path = %request.path, range = %request.range, "part already stored");
                        counters.skipped.fetch_add(1, Ordering::Relaxed);
                    }
                    UploadCreateResult::Error(UploadError::Unknown) => {
                        tracing::warn!(path = %request.path, range = %request.range, "part refused by server");
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        Ok(())
    }

    async fn part_request(&self, file: &LocalFile, range: Range) -> ClientResult<UploadRequest> {
        let checksum_md5 = self.checksums.md5_range(&file.path, range).await?;
        Ok(UploadRequest {
            path: file.remote_path.clone(),
            range,
            checksum_md5,
            size: file.size,
        })
    }

    fn queue_part(
        &self,
        job: UploadJob,
        path: PathBuf,
        queue: &JobQueue,
        counters: &Arc<Counters>,
    ) -> ClientResult<()> {
        let transfer = self.transfer.clone();
        let session = self.session.clone();
        let timeout = self.config.request_timeout();
        let counters = counters.clone();
        queue.push(async move {
            let bytes = match transfer.upload_part(&job, &path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(part = %job.part_key(), error = %e, "part upload failed");
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };
            let part = job.part_key();
            match session.request(Event::UploadComplete(job), timeout).await {
                Ok(Reply::UploadComplete(None)) => {
                    tracing::debug!(%part, bytes, "part uploaded");
                    counters.uploaded.fetch_add(1, Ordering::Relaxed);
                    counters.bytes.fetch_add(bytes, Ordering::Relaxed);
                }
                Ok(reply) => {
                    tracing::warn!(%part, ?reply, "part completion refused");
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::error!(%part, error = %e, "part completion failed");
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        })
    }
}

pub(crate) fn unexpected(event: &str, reply: &Reply) -> ClientError {
    ClientError::Session(format!("unexpected reply to {event}: {reply:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_scan_directory() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.txt"), b"bb").unwrap();
        fs::create_dir_all(dir.path().join("nested").join("deeper")).unwrap();
        fs::write(dir.path().join("nested").join("deeper").join("a.bin"), b"aaaa").unwrap();
        fs::write(dir.path().join("empty"), b"").unwrap();

        let files = scan_files(dir.path()).unwrap();
        let paths: Vec<(&str, u64)> = files
            .iter()
            .map(|f| (f.remote_path.as_str(), f.size))
            .collect();
        assert_eq!(
            paths,
            vec![("b.txt", 2), ("empty", 0), ("nested/deeper/a.bin", 4)]
        );
    }

    #[test]
    fn test_scan_single_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("movie.mkv");
        fs::write(&path, b"frames").unwrap();

        let files = scan_files(&path).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].remote_path, "movie.mkv");
        assert_eq!(files[0].size, 6);
    }

    #[test]
    fn test_scan_missing_root() {
        assert!(scan_files(Path::new("/nonexistent/ferry/root")).is_err());
    }
}
