//! Session token signing for ferry.
//!
//! This crate provides:
//! - Ed25519 key generation, `name:base64` key files
//! - Signing of session token claims
//! - Token verification on the server

pub mod error;
pub mod key;
pub mod signer;

pub use error::{SignerError, SignerResult};
pub use key::{KeyPair, PublicKey, SecretKey};
pub use signer::{TokenSigner, TokenVerifier};
