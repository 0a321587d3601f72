//! Repository traits for the ledger entities.

pub mod files;
pub mod parts;
pub mod providers;

pub use files::FileRepo;
pub use parts::PartRepo;
pub use providers::StorageProviderRepo;
