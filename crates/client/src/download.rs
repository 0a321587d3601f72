//! Download client: fetch broadcast parts, reassemble files and verify them.

use crate::checksum::ChecksumPool;
use crate::error::{ClientError, ClientResult};
use crate::queue::JobQueue;
use crate::session::{ClientSession, Incoming};
use crate::transfer::Transfer;
use ferry_core::config::ClientConfig;
use ferry_core::{DownloadChecksum, DownloadJob, Event, FileRef, Range, Reply, is_fully_covered};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Totals for one download run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub downloaded: u64,
    pub failed: u64,
    pub bytes: u64,
    pub verified: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct PartId {
    n: String,
    storage_provider_id: String,
    key: String,
    checksum_md5: String,
}

impl From<&DownloadJob> for PartId {
    fn from(job: &DownloadJob) -> Self {
        Self {
            n: job.n.clone(),
            storage_provider_id: job.storage_provider_id.clone(),
            key: job.part_key(),
            checksum_md5: job.checksum_md5.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Verification {
    #[default]
    Pending,
    Running,
    Done,
}

#[derive(Debug, Default)]
struct FileProgress {
    size: Option<u64>,
    ranges: Vec<Range>,
    checksum: Option<String>,
    verification: Verification,
    /// Parts accepted for this file whose transfer has not finished.
    in_flight: usize,
}

#[derive(Default)]
struct Counters {
    downloaded: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
    verified: AtomicU64,
}

/// Resolve `{root}/{n}/{path}`, refusing anything but plain components.
pub fn local_path(root: &Path, n: &str, path: &str) -> ClientResult<PathBuf> {
    let unsafe_path = || ClientError::UnsafePath(format!("{n}/{path}"));
    let mut local = root.to_path_buf();
    for part in [n, path] {
        if part.is_empty() {
            return Err(unsafe_path());
        }
        for component in Path::new(part).components() {
            match component {
                Component::Normal(name) => local.push(name),
                _ => return Err(unsafe_path()),
            }
        }
    }
    Ok(local)
}

struct Inner {
    config: ClientConfig,
    root: PathBuf,
    session: ClientSession,
    transfer: Transfer,
    checksums: ChecksumPool,
    seen: Mutex<HashSet<PartId>>,
    files: Mutex<HashMap<FileRef, FileProgress>>,
    counters: Counters,
    tasks: TaskTracker,
    fatal: mpsc::UnboundedSender<ClientError>,
}

pub struct DownloadClient {
    inner: Arc<Inner>,
    incoming: mpsc::UnboundedReceiver<Incoming>,
    fatal: mpsc::UnboundedReceiver<ClientError>,
    queue: JobQueue,
}

impl DownloadClient {
    pub fn new(
        config: ClientConfig,
        root: impl Into<PathBuf>,
        session: ClientSession,
        incoming: mpsc::UnboundedReceiver<Incoming>,
        transfer: Transfer,
    ) -> ClientResult<Self> {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let queue = JobQueue::new(config.num_threads);
        let checksums = ChecksumPool::new(config.checksum_threads())?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                root: root.into(),
                session,
                transfer,
                checksums,
                seen: Mutex::new(HashSet::new()),
                files: Mutex::new(HashMap::new()),
                counters: Counters::default(),
                tasks: TaskTracker::new(),
                fatal: fatal_tx,
            }),
            incoming,
            fatal: fatal_rx,
            queue,
        })
    }

    /// Serve download broadcasts until cancelled.
    ///
    /// Returns an error when the session ends on its own or a fully
    /// downloaded file fails verification.
    pub async fn run(self, cancel: CancellationToken) -> ClientResult<DownloadSummary> {
        let DownloadClient {
            inner,
            mut incoming,
            mut fatal,
            queue,
        } = self;
        tracing::info!(root = %inner.root.display(), "download client started");
        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                Some(error) = fatal.recv() => break Err(error),
                next = incoming.recv() => match next {
                    Some(next) => handle(&inner, &queue, next).await,
                    None => {
                        let reason = inner
                            .session
                            .fatal_error()
                            .unwrap_or_else(|| "session closed".to_string());
                        break Err(ClientError::Session(reason));
                    }
                },
            }
        };

        queue.drain().await;
        inner.tasks.close();
        inner.tasks.wait().await;
        inner.session.close().await;

        let counters = &inner.counters;
        let summary = DownloadSummary {
            downloaded: counters.downloaded.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            bytes: counters.bytes.load(Ordering::Relaxed),
            verified: counters.verified.load(Ordering::Relaxed),
        };
        tracing::info!(
            downloaded = summary.downloaded,
            failed = summary.failed,
            verified = summary.verified,
            "download client stopped"
        );
        result.map(|()| summary)
    }
}

async fn handle(inner: &Arc<Inner>, queue: &JobQueue, incoming: Incoming) {
    let Incoming { event, responder } = incoming;
    match event {
        Event::DownloadCreate(jobs) => {
            // Acknowledge first so the broadcast does not wait on transfers.
            if let Some(responder) = responder {
                if let Err(e) = responder.reply(Reply::Received).await {
                    tracing::warn!(error = %e, "failed to acknowledge download batch");
                }
            }
            accept_jobs(inner, queue, jobs);
        }
        Event::DownloadChecksum(checksum) => inner.clone().record_checksum(checksum),
        other => {
            tracing::debug!(event = other.name(), "ignoring unexpected event");
            if let Some(responder) = responder {
                let reason = format!("{} is not handled by download clients", other.name());
                let _ = responder.reply(Reply::Rejected { reason }).await;
            }
        }
    }
}

fn accept_jobs(inner: &Arc<Inner>, queue: &JobQueue, jobs: Vec<DownloadJob>) {
    let total = jobs.len();
    let mut accepted = 0usize;
    for job in jobs {
        let fresh = inner
            .seen
            .lock()
            .map(|mut seen| seen.insert(PartId::from(&job)))
            .unwrap_or(false);
        if !fresh {
            continue;
        }
        if let Ok(mut files) = inner.files.lock() {
            files.entry(FileRef::from(&job)).or_default().in_flight += 1;
        }
        let file = FileRef::from(&job);
        if let Err(e) = queue.push(inner.clone().fetch(job)) {
            tracing::warn!(error = %e, "download queue closed");
            inner.part_finished(&file);
            return;
        }
        accepted += 1;
    }
    tracing::debug!(total, accepted, "download batch received");
}

impl Inner {
    fn forget(&self, id: &PartId) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.remove(id);
        }
    }

    fn fail_part(&self, id: &PartId) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.forget(id);
    }

    async fn fetch(self: Arc<Self>, job: DownloadJob) {
        let file = FileRef::from(&job);
        self.fetch_part(job).await;
        self.part_finished(&file);
        self.check_file(file).await;
    }

    fn part_finished(&self, file: &FileRef) {
        if let Ok(mut files) = self.files.lock() {
            if let Some(progress) = files.get_mut(file) {
                progress.in_flight = progress.in_flight.saturating_sub(1);
            }
        }
    }

    async fn fetch_part(&self, job: DownloadJob) {
        let id = PartId::from(&job);
        let part = job.part_key();
        let dest = match local_path(&self.root, &job.n, &job.path) {
            Ok(dest) => dest,
            Err(e) => {
                tracing::error!(n = %job.n, %part, error = %e, "refusing download");
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if let Some(parent) = dest.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::error!(path = %parent.display(), error = %e, "cannot create directory");
                self.fail_part(&id);
                return;
            }
        }

        let bytes = match self.transfer.download_part(&job, &dest).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(n = %job.n, %part, error = %e, "part download failed");
                self.fail_part(&id);
                return;
            }
        };

        let reply = self
            .session
            .request(
                Event::DownloadComplete(vec![job.clone()]),
                self.config.request_timeout(),
            )
            .await;
        match reply {
            Ok(Reply::DownloadComplete(results)) if matches!(results.as_slice(), [None]) => {
                tracing::debug!(n = %job.n, %part, bytes, "part downloaded");
                self.counters.downloaded.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes.fetch_add(bytes, Ordering::Relaxed);
                if let Ok(mut files) = self.files.lock() {
                    let progress = files.entry(FileRef::from(&job)).or_default();
                    progress.size = Some(job.size);
                    if !progress.ranges.contains(&job.range) {
                        progress.ranges.push(job.range);
                    }
                }
            }
            Ok(reply) => {
                tracing::warn!(n = %job.n, %part, ?reply, "download completion refused");
                self.fail_part(&id);
            }
            Err(e) => {
                tracing::error!(n = %job.n, %part, error = %e, "download completion failed");
                self.fail_part(&id);
            }
        }
    }

    fn record_checksum(self: Arc<Self>, checksum: DownloadChecksum) {
        let file = FileRef {
            n: checksum.n,
            path: checksum.path,
        };
        let has_progress = match self.files.lock() {
            Ok(mut files) => {
                let progress = files.entry(file.clone()).or_default();
                if progress.checksum.as_deref() != Some(checksum.checksum_sha256.as_str()) {
                    progress.checksum = Some(checksum.checksum_sha256);
                    if progress.verification == Verification::Done {
                        progress.verification = Verification::Pending;
                    }
                }
                !progress.ranges.is_empty()
            }
            Err(_) => return,
        };
        let inner = self.clone();
        if has_progress {
            self.tasks.spawn(async move { inner.check_file(file).await });
        } else {
            self.tasks
                .spawn(async move { inner.verify_existing(file).await });
        }
    }

    /// Verify a file once all of its bytes are present and its checksum is
    /// known. A mismatch at that point is fatal.
    ///
    /// Parts written before a restart are not re-sent, so when this run saw
    /// only some of the ranges the whole local file is hashed once no part
    /// is in flight and it has reached its full size. That check is not
    /// fatal.
    async fn check_file(&self, file: FileRef) {
        let (expected, resumed_size) = {
            let Ok(mut files) = self.files.lock() else {
                return;
            };
            let Some(progress) = files.get_mut(&file) else {
                return;
            };
            if progress.verification != Verification::Pending {
                return;
            }
            let (Some(size), Some(checksum)) = (progress.size, progress.checksum.clone()) else {
                return;
            };
            let covered = match is_fully_covered(&progress.ranges, size) {
                Ok(covered) => covered,
                Err(e) => {
                    tracing::warn!(n = %file.n, path = %file.path, error = %e, "inconsistent part ranges");
                    return;
                }
            };
            if !covered && progress.in_flight > 0 {
                return;
            }
            progress.verification = Verification::Running;
            (checksum, (!covered).then_some(size))
        };

        if let Some(size) = resumed_size {
            self.verify_resumed(file, expected, size).await;
            return;
        }

        match self.hash_local(&file).await {
            Ok(actual) if actual == expected => self.mark_verified(file).await,
            Ok(actual) => {
                tracing::error!(n = %file.n, path = %file.path, %expected, %actual, "downloaded file is corrupt");
                self.set_verification(&file, Verification::Pending);
                let _ = self.fatal.send(ClientError::ChecksumMismatch {
                    subject: format!("{}/{}", file.n, file.path),
                    expected,
                    actual,
                });
            }
            Err(e) => {
                tracing::error!(n = %file.n, path = %file.path, error = %e, "cannot hash downloaded file");
                self.set_verification(&file, Verification::Pending);
            }
        }
    }

    /// Verify a file this run has no progress for, e.g. one finished before a
    /// restart.
    async fn verify_existing(&self, file: FileRef) {
        let expected = {
            let Ok(mut files) = self.files.lock() else {
                return;
            };
            let Some(progress) = files.get_mut(&file) else {
                return;
            };
            if progress.verification != Verification::Pending {
                return;
            }
            let Some(checksum) = progress.checksum.clone() else {
                return;
            };
            progress.verification = Verification::Running;
            checksum
        };

        let exists = match local_path(&self.root, &file.n, &file.path) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        };
        if !exists {
            self.set_verification(&file, Verification::Pending);
            self.check_file(file).await;
            return;
        }
        match self.hash_local(&file).await {
            Ok(actual) if actual == expected => self.mark_verified(file).await,
            Ok(_) => {
                tracing::debug!(n = %file.n, path = %file.path, "local copy incomplete, waiting for parts");
                self.set_verification(&file, Verification::Pending);
                self.check_file(file).await;
            }
            Err(e) => {
                tracing::debug!(n = %file.n, path = %file.path, error = %e, "cannot hash local copy");
                self.set_verification(&file, Verification::Pending);
                self.check_file(file).await;
            }
        }
    }

    /// Hash a file whose earlier parts were written by a previous run.
    async fn verify_resumed(&self, file: FileRef, expected: String, size: u64) {
        let on_disk = match local_path(&self.root, &file.n, &file.path) {
            Ok(path) => tokio::fs::metadata(&path).await.map(|m| m.len()).ok(),
            Err(_) => None,
        };
        if on_disk != Some(size) {
            self.set_verification(&file, Verification::Pending);
            return;
        }
        match self.hash_local(&file).await {
            Ok(actual) if actual == expected => self.mark_verified(file).await,
            Ok(actual) => {
                tracing::warn!(n = %file.n, path = %file.path, %expected, %actual, "resumed file does not match, waiting for parts");
                self.set_verification(&file, Verification::Pending);
            }
            Err(e) => {
                tracing::warn!(n = %file.n, path = %file.path, error = %e, "cannot hash resumed file");
                self.set_verification(&file, Verification::Pending);
            }
        }
    }

    async fn hash_local(&self, file: &FileRef) -> ClientResult<String> {
        let path = local_path(&self.root, &file.n, &file.path)?;
        self.checksums.sha256_file(&path).await
    }

    fn set_verification(&self, file: &FileRef, state: Verification) {
        if let Ok(mut files) = self.files.lock() {
            if let Some(progress) = files.get_mut(file) {
                progress.verification = state;
            }
        }
    }

    async fn mark_verified(&self, file: FileRef) {
        self.set_verification(&file, Verification::Done);
        self.counters.verified.fetch_add(1, Ordering::Relaxed);
        tracing::info!(n = %file.n, path = %file.path, "file verified");
        if let Err(e) = self.session.notify(Event::DownloadVerified(file)).await {
            tracing::warn!(error = %e, "failed to report verified file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_path() {
        let root = Path::new("/data");
        assert_eq!(
            local_path(root, "alice", "photos/2024/a.jpg").unwrap(),
            PathBuf::from("/data/alice/photos/2024/a.jpg")
        );
    }

    #[test]
    fn test_local_path_rejects_escapes() {
        let root = Path::new("/data");
        for (n, path) in [
            ("alice", "../etc/passwd"),
            ("alice", "/etc/passwd"),
            ("..", "x"),
            ("alice", "a/../../b"),
            ("", "x"),
            ("alice", ""),
        ] {
            assert!(
                matches!(local_path(root, n, path), Err(ClientError::UnsafePath(_))),
                "{n}/{path}"
            );
        }
    }
}
