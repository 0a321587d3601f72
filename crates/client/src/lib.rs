//! Transfer clients for ferry.
//!
//! Both clients hold one reconnecting duplex session to the coordinating
//! server and move part bytes directly to and from object storage using the
//! presigned URLs the server hands out.

pub mod checksum;
pub mod download;
pub mod error;
pub mod parts;
pub mod queue;
pub mod session;
pub mod transfer;
pub mod upload;

pub use checksum::ChecksumPool;
pub use download::{DownloadClient, DownloadSummary, local_path};
pub use error::{ClientError, ClientResult};
pub use parts::split_ranges;
pub use queue::JobQueue;
pub use session::{ClientSession, Incoming, Responder, session_url};
pub use transfer::Transfer;
pub use upload::{LocalFile, UploadClient, UploadSummary, scan_files};
