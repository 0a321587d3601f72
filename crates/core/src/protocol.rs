//! Duplex session protocol.
//!
//! Both peers exchange [`Frame`]s encoded as MessagePack with named fields.
//! A `Request` expects exactly one `Reply` carrying the same id; a `Notify`
//! expects nothing back.

use crate::error::{Error, Result};
use crate::key::part_key;
use crate::range::Range;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

// =============================================================================
// Upload payloads
// =============================================================================

/// A part announced by an upload client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub path: String,
    pub range: Range,
    #[serde(rename = "checksumMD5")]
    pub checksum_md5: String,
    /// Size of the whole file.
    pub size: u64,
}

/// An admitted part together with its signed PUT URL.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadJob {
    pub path: String,
    pub range: Range,
    #[serde(rename = "checksumMD5")]
    pub checksum_md5: String,
    pub size: u64,
    pub url: String,
}

impl UploadJob {
    pub fn part_key(&self) -> String {
        part_key(&self.path, &self.range)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadError {
    /// The part is already stored and complete; skip the transfer.
    #[serde(rename = "upload-exists")]
    UploadExists,
    #[serde(rename = "unknown")]
    Unknown,
}

/// One entry of an `upload:create` reply, index-aligned with the request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadCreateResult {
    Job(UploadJob),
    Error(UploadError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadChecksum {
    pub path: String,
    #[serde(rename = "checksumSHA256")]
    pub checksum_sha256: String,
}

// =============================================================================
// Download payloads
// =============================================================================

/// A stored part ready to be fetched by a download client.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DownloadJob {
    pub n: String,
    #[serde(rename = "storageProviderId")]
    pub storage_provider_id: String,
    pub bucket: String,
    pub url: String,
    pub range: Range,
    pub path: String,
    #[serde(rename = "checksumMD5")]
    pub checksum_md5: String,
    /// Size of the whole file.
    pub size: u64,
}

impl DownloadJob {
    pub fn part_key(&self) -> String {
        part_key(&self.path, &self.range)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadChecksum {
    pub n: String,
    pub path: String,
    #[serde(rename = "checksumSHA256")]
    pub checksum_sha256: String,
}

/// Identifies a file across scopes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRef {
    pub n: String,
    pub path: String,
}

impl From<&DownloadJob> for FileRef {
    fn from(job: &DownloadJob) -> Self {
        Self {
            n: job.n.clone(),
            path: job.path.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadCompleteError {
    #[serde(rename = "unknown-storage-provider")]
    UnknownStorageProvider,
    #[serde(rename = "unknown")]
    Unknown,
}

// =============================================================================
// Frames
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    #[serde(rename = "upload:create")]
    UploadCreate(Vec<UploadRequest>),
    #[serde(rename = "upload:complete")]
    UploadComplete(UploadJob),
    #[serde(rename = "upload:checksum")]
    UploadChecksum(UploadChecksum),
    #[serde(rename = "download:create")]
    DownloadCreate(Vec<DownloadJob>),
    #[serde(rename = "download:checksum")]
    DownloadChecksum(DownloadChecksum),
    #[serde(rename = "download:complete")]
    DownloadComplete(Vec<DownloadJob>),
    #[serde(rename = "download:verified")]
    DownloadVerified(FileRef),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UploadCreate(_) => "upload:create",
            Self::UploadComplete(_) => "upload:complete",
            Self::UploadChecksum(_) => "upload:checksum",
            Self::DownloadCreate(_) => "download:create",
            Self::DownloadChecksum(_) => "download:checksum",
            Self::DownloadComplete(_) => "download:complete",
            Self::DownloadVerified(_) => "download:verified",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    UploadCreate(Vec<UploadCreateResult>),
    UploadComplete(Option<UploadError>),
    UploadChecksum(Option<UploadError>),
    DownloadComplete(Vec<Option<DownloadCompleteError>>),
    /// Plain acknowledgement with no payload.
    Received,
    /// The peer refused the request, e.g. an event outside the session's role.
    Rejected { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    Request(Event),
    Notify(Event),
    Reply(Reply),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub id: u64,
    pub kind: FrameKind,
}

impl Frame {
    pub fn request(id: u64, event: Event) -> Self {
        Self {
            id,
            kind: FrameKind::Request(event),
        }
    }

    pub fn notify(event: Event) -> Self {
        Self {
            id: 0,
            kind: FrameKind::Notify(event),
        }
    }

    pub fn reply(id: u64, reply: Reply) -> Self {
        Self {
            id,
            kind: FrameKind::Reply(reply),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|e| Error::Protocol(format!("encode frame: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::Protocol(format!("decode frame: {e}")))
    }
}

// =============================================================================
// Pending replies
// =============================================================================

/// Outstanding requests awaiting a reply from the peer, keyed by frame id.
#[derive(Clone, Default)]
pub struct PendingReplies {
    next_id: Arc<AtomicU64>,
    waiting: Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a frame id and the receiver its reply will arrive on.
    pub fn register(&self) -> (u64, oneshot::Receiver<Reply>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        (id, rx)
    }

    /// Deliver a reply. Returns false if nobody is waiting for `id`.
    pub fn resolve(&self, id: u64, reply: Reply) -> bool {
        match self.lock().remove(&id) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Stop waiting for `id`, e.g. after a timeout.
    pub fn forget(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub fn fail_all(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
        // A poisoned map only means another task panicked mid-insert; the map
        // itself is still consistent.
        self.waiting.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> DownloadJob {
        DownloadJob {
            n: "alice".to_string(),
            storage_provider_id: "p1".to_string(),
            bucket: "ferry-abc".to_string(),
            url: "https://example.com/ferry-abc/f.0-9".to_string(),
            range: Range::new(0, 9).unwrap(),
            path: "f".to_string(),
            checksum_md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            size: 313_203_334_286,
        }
    }

    #[test]
    fn test_frame_codec() {
        let frame = Frame::request(7, Event::DownloadCreate(vec![sample_job()]));
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);

        let reply = Frame::reply(
            7,
            Reply::UploadCreate(vec![
                UploadCreateResult::Error(UploadError::UploadExists),
                UploadCreateResult::Error(UploadError::Unknown),
            ]),
        );
        assert_eq!(Frame::decode(&reply.encode().unwrap()).unwrap(), reply);
    }

    #[test]
    fn test_decode_rejects_inverted_range() {
        #[derive(Serialize)]
        struct BadRange {
            start: u64,
            end: u64,
        }
        #[derive(Serialize)]
        struct BadRequest {
            path: &'static str,
            range: BadRange,
            #[serde(rename = "checksumMD5")]
            checksum_md5: &'static str,
            size: u64,
        }
        #[derive(Serialize)]
        enum BadEvent {
            #[serde(rename = "upload:create")]
            UploadCreate(Vec<BadRequest>),
        }
        #[derive(Serialize)]
        enum BadKind {
            Request(BadEvent),
        }
        #[derive(Serialize)]
        struct BadFrame {
            id: u64,
            kind: BadKind,
        }

        let bytes = rmp_serde::to_vec_named(&BadFrame {
            id: 1,
            kind: BadKind::Request(BadEvent::UploadCreate(vec![BadRequest {
                path: "p",
                range: BadRange { start: 10, end: 2 },
                checksum_md5: "x",
                size: 100,
            }])),
        })
        .unwrap();
        assert!(Frame::decode(&bytes).is_err());
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        assert!(matches!(
            Frame::decode(&[0xc1, 0x00, 0x13]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_event_names() {
        assert_eq!(
            Event::DownloadVerified(FileRef {
                n: "n".to_string(),
                path: "p".to_string()
            })
            .name(),
            "download:verified"
        );
        assert_eq!(Event::UploadCreate(Vec::new()).name(), "upload:create");
    }

    #[tokio::test]
    async fn test_pending_replies() {
        let pending = PendingReplies::new();
        let (id1, rx1) = pending.register();
        let (id2, rx2) = pending.register();
        assert_ne!(id1, id2);
        assert_eq!(pending.len(), 2);

        assert!(pending.resolve(id1, Reply::Received));
        assert_eq!(rx1.await.unwrap(), Reply::Received);
        assert!(!pending.resolve(id1, Reply::Received));

        pending.fail_all();
        assert!(rx2.await.is_err());
        assert!(pending.is_empty());
    }
}
