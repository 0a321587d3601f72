//! Storage backend implementations.

pub mod b2;
pub mod memory;
pub mod s3;
