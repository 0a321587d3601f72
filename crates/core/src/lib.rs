//! Core domain types shared by the ferry server and transfer clients.
//!
//! This crate defines:
//! - Inclusive byte ranges and the merge rules for completed parts
//! - The storage object key convention for transient parts
//! - Duplex session frames and their MessagePack codec
//! - Session token claims and roles
//! - Storage provider descriptors
//! - Configuration shared by every binary

pub mod config;
pub mod error;
pub mod hash;
pub mod key;
pub mod protocol;
pub mod provider;
pub mod range;
pub mod token;

pub use error::{Error, Result};
pub use key::{parse_part_key, part_key};
pub use protocol::{
    DownloadChecksum, DownloadCompleteError, DownloadJob, Event, FileRef, Frame, FrameKind,
    PendingReplies, Reply, UploadChecksum, UploadCreateResult, UploadError, UploadJob,
    UploadRequest,
};
pub use provider::{ProviderCredentials, StorageBackendKind, StorageProvider};
pub use range::{Range, is_fully_covered, reduce_ranges};
pub use token::{RoleTag, SessionRole, TokenClaims};
