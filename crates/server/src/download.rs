//! Download coordinator.
//!
//! Reconciliation walks every transient object in every provider and decides
//! its fate from the ledger alone:
//! - objects that match no announced part are deleted as orphaned,
//! - objects of verified files are deleted as redundant,
//! - everything else is broadcast to download subscribers as a job.
//!
//! Broadcast jobs and sent checksums are remembered so a pass does not repeat
//! work that subscribers already acknowledged. The memory is cleared whenever
//! a download session with an unseen session id connects.

use crate::factory::StorageFactory;
use crate::hub::DownloadHub;
use crate::metrics::{
    DOWNLOAD_JOBS_BROADCAST, FILES_VERIFIED, RECONCILE_DURATION, RECONCILE_ERRORS, RECONCILE_RUNS,
    record_deletion,
};
use crate::session::Connection;
use ferry_core::config::ServerConfig;
use ferry_core::hash::normalize_etag;
use ferry_core::{
    DownloadChecksum, DownloadCompleteError, DownloadJob, Event, FileRef, Range, StorageProvider,
    parse_part_key,
};
use ferry_metadata::{FileRepo, FileRow, MetadataError, MetadataStore, PartRepo, StorageProviderRepo};
use ferry_storage::{Storage, StorageError, StorageObject};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

/// Identity of a broadcast download job.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DownloadKey {
    pub provider_id: String,
    pub bucket: String,
    pub key: String,
    pub range: Range,
    pub checksum_md5: String,
}

impl From<&DownloadJob> for DownloadKey {
    fn from(job: &DownloadJob) -> Self {
        Self {
            provider_id: job.storage_provider_id.clone(),
            bucket: job.bucket.clone(),
            key: job.part_key(),
            range: job.range,
            checksum_md5: job.checksum_md5.clone(),
        }
    }
}

/// What one reconciliation pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub objects_seen: usize,
    pub orphaned_deleted: usize,
    pub redundant_deleted: usize,
    pub jobs_broadcast: usize,
    pub jobs_unacknowledged: usize,
    pub checksums_sent: usize,
    pub errors: usize,
}

#[derive(Debug, thiserror::Error)]
enum ReconcileError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

enum Disposition {
    Orphaned(&'static str),
    Redundant,
    /// Already broadcast and acknowledged.
    Known(Uuid),
    Pending(Uuid, DownloadKey, DownloadJob),
}

pub struct DownloadCoordinator {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn StorageFactory>,
    hub: DownloadHub,
    wake: Notify,
    downloads: Mutex<HashSet<DownloadKey>>,
    checksums: Mutex<HashSet<(Uuid, String)>>,
    reconcile_lock: Mutex<()>,
    batch_size: usize,
    ack_timeout: Duration,
    interval: Duration,
}

impl DownloadCoordinator {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn StorageFactory>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            metadata,
            storage,
            hub: DownloadHub::new(),
            wake: Notify::new(),
            downloads: Mutex::new(HashSet::new()),
            checksums: Mutex::new(HashSet::new()),
            reconcile_lock: Mutex::new(()),
            batch_size: config.download_batch_size.max(1),
            ack_timeout: config.ack_timeout(),
            interval: config.reconcile_interval(),
        }
    }

    /// Ask the loop for a pass as soon as the current one (if any) finishes.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    /// Number of jobs currently remembered as broadcast.
    pub async fn pending_downloads(&self) -> usize {
        self.downloads.lock().await.len()
    }

    /// Register a download session. Returns the subscription id.
    pub async fn subscribe(&self, session_id: &str, connection: Connection) -> u64 {
        let (id, is_new) = self.hub.subscribe(session_id, connection);
        if is_new {
            self.downloads.lock().await.clear();
            self.checksums.lock().await.clear();
            tracing::info!(session_id, "new download session, job memory cleared");
        }
        self.wake();
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.hub.unsubscribe(id);
    }

    /// Run reconciliation until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(interval = ?self.interval, "reconcile loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.reconcile_once() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        tracing::info!("reconcile loop stopped");
    }

    /// One full pass over every provider.
    #[instrument(skip(self))]
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let _guard = self.reconcile_lock.lock().await;
        let timer = RECONCILE_DURATION.start_timer();
        let mut report = ReconcileReport::default();
        let mut touched = HashSet::new();

        match self.metadata.get_storage_providers().await {
            Ok(providers) => {
                let mut identities = HashSet::new();
                for provider in providers {
                    if !identities.insert(provider.identity()) {
                        tracing::debug!(
                            provider = %provider.id,
                            "provider shares credentials with one already scanned"
                        );
                        continue;
                    }
                    match self.storage.storage(&provider) {
                        Ok(storage) => {
                            self.reconcile_provider(
                                &provider,
                                storage.as_ref(),
                                &mut report,
                                &mut touched,
                            )
                            .await
                        }
                        Err(e) => {
                            tracing::warn!(provider = %provider.id, error = %e, "cannot open provider");
                            report.errors += 1;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot load storage providers");
                report.errors += 1;
            }
        }

        self.send_checksums(touched, &mut report).await;

        RECONCILE_RUNS.inc();
        RECONCILE_ERRORS.inc_by(report.errors as u64);
        timer.observe_duration();
        tracing::debug!(?report, "reconcile pass finished");
        report
    }

    async fn reconcile_provider(
        &self,
        provider: &StorageProvider,
        storage: &dyn Storage,
        report: &mut ReconcileReport,
        touched: &mut HashSet<Uuid>,
    ) {
        let mut objects = storage.list_objects();
        let mut batch = Vec::new();

        while let Some(item) = objects.next().await {
            let object = match item {
                Ok(object) => object,
                Err(e) => {
                    tracing::warn!(provider = %provider.id, error = %e, "listing failed");
                    report.errors += 1;
                    continue;
                }
            };
            report.objects_seen += 1;

            match self.classify(provider, storage, &object).await {
                Ok(Disposition::Orphaned(reason)) => {
                    tracing::info!(bucket = %object.bucket, key = %object.key, reason, "deleting orphaned object");
                    if self.delete(storage, &object, "orphaned", report).await {
                        report.orphaned_deleted += 1;
                    }
                }
                Ok(Disposition::Redundant) => {
                    tracing::debug!(bucket = %object.bucket, key = %object.key, "deleting object of verified file");
                    if self.delete(storage, &object, "redundant", report).await {
                        report.redundant_deleted += 1;
                    }
                }
                Ok(Disposition::Known(file_id)) => {
                    touched.insert(file_id);
                }
                Ok(Disposition::Pending(file_id, key, job)) => {
                    touched.insert(file_id);
                    batch.push((key, job));
                    if batch.len() >= self.batch_size {
                        self.flush(&mut batch, report).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(bucket = %object.bucket, key = %object.key, error = %e, "cannot reconcile object");
                    report.errors += 1;
                }
            }
        }
        self.flush(&mut batch, report).await;
    }

    async fn classify(
        &self,
        provider: &StorageProvider,
        storage: &dyn Storage,
        object: &StorageObject,
    ) -> Result<Disposition, ReconcileError> {
        let Some((path, range)) = parse_part_key(&object.key) else {
            return Ok(Disposition::Orphaned("unparseable key"));
        };
        if object.size != range.size() {
            return Ok(Disposition::Orphaned("size mismatch"));
        }
        let etag = normalize_etag(&object.etag);
        let Some(part) = self.metadata.get_part(&etag, range).await? else {
            return Ok(Disposition::Orphaned("no matching part"));
        };
        let Some(file) = self.metadata.get_file_by_id(part.file_id).await? else {
            return Ok(Disposition::Orphaned("no owning file"));
        };
        if file.path != path {
            return Ok(Disposition::Orphaned("path mismatch"));
        }
        if file.verified {
            return Ok(Disposition::Redundant);
        }

        let key = DownloadKey {
            provider_id: provider.id.clone(),
            bucket: object.bucket.clone(),
            key: object.key.clone(),
            range,
            checksum_md5: etag,
        };
        if !self.downloads.lock().await.insert(key.clone()) {
            return Ok(Disposition::Known(file.file_id));
        }

        let job = match self.job_for(provider, storage, &key, &file).await {
            Ok(job) => job,
            Err(e) => {
                self.downloads.lock().await.remove(&key);
                return Err(e);
            }
        };
        Ok(Disposition::Pending(file.file_id, key, job))
    }

    async fn job_for(
        &self,
        provider: &StorageProvider,
        storage: &dyn Storage,
        key: &DownloadKey,
        file: &FileRow,
    ) -> Result<DownloadJob, ReconcileError> {
        let size = file
            .size()
            .ok_or_else(|| MetadataError::Internal(format!("file {} has parts but no size", file.path)))?;
        let url = storage.get_download_url(&key.bucket, &key.key).await?;
        Ok(DownloadJob {
            n: file.n.clone(),
            storage_provider_id: provider.id.clone(),
            bucket: key.bucket.clone(),
            url,
            range: key.range,
            path: file.path.clone(),
            checksum_md5: key.checksum_md5.clone(),
            size,
        })
    }

    async fn delete(
        &self,
        storage: &dyn Storage,
        object: &StorageObject,
        reason: &str,
        report: &mut ReconcileReport,
    ) -> bool {
        match storage.delete_file(&object.bucket, &object.key).await {
            Ok(()) => {
                record_deletion(reason);
                true
            }
            Err(e) => {
                tracing::warn!(bucket = %object.bucket, key = %object.key, error = %e, "delete failed");
                report.errors += 1;
                false
            }
        }
    }

    /// Broadcast a batch. Keys nobody acknowledged are forgotten so the next
    /// pass offers them again.
    async fn flush(&self, batch: &mut Vec<(DownloadKey, DownloadJob)>, report: &mut ReconcileReport) {
        if batch.is_empty() {
            return;
        }
        let (keys, jobs): (Vec<_>, Vec<_>) = std::mem::take(batch).into_iter().unzip();
        let count = jobs.len();

        let acked = self
            .hub
            .broadcast_with_ack(Event::DownloadCreate(jobs), self.ack_timeout)
            .await;
        if acked > 0 {
            tracing::debug!(jobs = count, subscribers = acked, "download jobs acknowledged");
            DOWNLOAD_JOBS_BROADCAST.inc_by(count as u64);
            report.jobs_broadcast += count;
        } else {
            let mut downloads = self.downloads.lock().await;
            for key in &keys {
                downloads.remove(key);
            }
            report.jobs_unacknowledged += count;
        }
    }

    async fn send_checksums(&self, touched: HashSet<Uuid>, report: &mut ReconcileReport) {
        let mut files: HashMap<Uuid, FileRow> = HashMap::new();
        for file_id in touched {
            match self.metadata.get_file_by_id(file_id).await {
                Ok(Some(file)) => {
                    files.insert(file.file_id, file);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(%file_id, error = %e, "cannot load file");
                    report.errors += 1;
                }
            }
        }
        match self.metadata.get_files_to_verify().await {
            Ok(pending) => {
                for file in pending {
                    files.insert(file.file_id, file);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot load files to verify");
                report.errors += 1;
            }
        }

        for file in files.into_values() {
            let Some(checksum) = file.checksum_sha256 else {
                continue;
            };
            let entry = (file.file_id, checksum.clone());
            if self.checksums.lock().await.contains(&entry) {
                continue;
            }
            let event = Event::DownloadChecksum(DownloadChecksum {
                n: file.n,
                path: file.path,
                checksum_sha256: checksum,
            });
            if self.hub.notify_all(event).await > 0 {
                self.checksums.lock().await.insert(entry);
                report.checksums_sent += 1;
            }
        }
    }

    /// Handle `download:complete`: delete each downloaded part from storage.
    #[instrument(skip_all, fields(jobs = jobs.len()))]
    pub async fn complete(&self, jobs: Vec<DownloadJob>) -> Vec<Option<DownloadCompleteError>> {
        let mut storages: HashMap<String, Option<Arc<dyn Storage>>> = HashMap::new();
        let mut results = Vec::with_capacity(jobs.len());
        for job in &jobs {
            let storage = match storages.get(&job.storage_provider_id) {
                Some(storage) => storage.clone(),
                None => {
                    let resolved = match self.resolve_storage(&job.storage_provider_id).await {
                        Ok(resolved) => resolved,
                        Err(e) => {
                            tracing::warn!(provider = %job.storage_provider_id, error = %e, "cannot resolve provider");
                            results.push(Some(DownloadCompleteError::Unknown));
                            continue;
                        }
                    };
                    storages.insert(job.storage_provider_id.clone(), resolved.clone());
                    resolved
                }
            };
            let Some(storage) = storage else {
                tracing::debug!(provider = %job.storage_provider_id, "download complete for unknown provider");
                results.push(Some(DownloadCompleteError::UnknownStorageProvider));
                continue;
            };

            let key = job.part_key();
            match storage.delete_file(&job.bucket, &key).await {
                Ok(()) => {
                    self.downloads.lock().await.remove(&DownloadKey::from(job));
                    record_deletion("downloaded");
                    results.push(None);
                }
                Err(e) => {
                    tracing::warn!(bucket = %job.bucket, key = %key, error = %e, "cannot delete downloaded part");
                    results.push(Some(DownloadCompleteError::Unknown));
                }
            }
        }
        results
    }

    async fn resolve_storage(
        &self,
        provider_id: &str,
    ) -> Result<Option<Arc<dyn Storage>>, ReconcileError> {
        match self.metadata.get_storage_provider(provider_id).await? {
            Some(provider) => Ok(Some(self.storage.storage(&provider)?)),
            None => Ok(None),
        }
    }

    /// Handle `download:verified`.
    #[instrument(skip(self))]
    pub async fn verified(&self, file: FileRef) {
        match self.metadata.set_verified(&file.n, &file.path).await {
            Ok(()) => {
                FILES_VERIFIED.inc();
                tracing::info!(n = %file.n, path = %file.path, "file verified");
            }
            Err(e @ MetadataError::NotFound(_)) => {
                tracing::debug!(error = %e, "verified report for unknown file");
            }
            Err(e) => {
                tracing::warn!(n = %file.n, path = %file.path, error = %e, "cannot mark file verified");
            }
        }
    }
}
