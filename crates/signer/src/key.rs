//! Ed25519 key types and their `name:base64` text form.

use crate::error::{SignerError, SignerResult};
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::fmt;
use std::path::{Path, PathBuf};

fn split_named(s: &str) -> SignerResult<(&str, Vec<u8>)> {
    let (name, b64) = s
        .trim()
        .split_once(':')
        .ok_or_else(|| SignerError::KeyParsing("expected 'keyname:base64' format".to_string()))?;
    if name.is_empty() {
        return Err(SignerError::KeyParsing("empty key name".to_string()));
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| SignerError::KeyParsing(format!("invalid base64: {e}")))?;
    Ok((name, bytes))
}

/// A secret (private) key for signing.
pub struct SecretKey {
    inner: SigningKey,
}

impl SecretKey {
    /// Generate a new random secret key.
    pub fn generate() -> Self {
        let mut rng = rand_core::OsRng;
        Self {
            inner: SigningKey::generate(&mut rng),
        }
    }

    /// Parse `keyname:base64(secret || public)`.
    pub fn parse(s: &str) -> SignerResult<(String, Self)> {
        let (name, bytes) = split_named(s)?;
        if bytes.len() != 64 {
            return Err(SignerError::KeyParsing(format!(
                "expected 64 bytes, got {}",
                bytes.len()
            )));
        }

        let secret_bytes: [u8; 32] = bytes[..32]
            .try_into()
            .map_err(|_| SignerError::KeyParsing("invalid secret key bytes".to_string()))?;
        let inner = SigningKey::from_bytes(&secret_bytes);

        if inner.verifying_key().as_bytes() != &bytes[32..] {
            return Err(SignerError::KeyParsing(
                "public half does not match secret key".to_string(),
            ));
        }

        Ok((name.to_string(), Self { inner }))
    }

    pub fn encode(&self, key_name: &str) -> String {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(self.inner.as_bytes());
        bytes.extend_from_slice(self.inner.verifying_key().as_bytes());
        let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
        format!("{key_name}:{b64}")
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.verifying_key(),
        }
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.inner
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// A public key for verification.
#[derive(Clone)]
pub struct PublicKey {
    inner: VerifyingKey,
}

impl PublicKey {
    /// Parse `keyname:base64(public)`.
    pub fn parse(s: &str) -> SignerResult<(String, Self)> {
        let (name, bytes) = split_named(s)?;
        let key_bytes: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            SignerError::KeyParsing(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        let inner = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| SignerError::KeyParsing(format!("invalid public key: {e}")))?;
        Ok((name.to_string(), Self { inner }))
    }

    pub fn encode(&self, key_name: &str) -> String {
        let b64 = base64::engine::general_purpose::STANDARD.encode(self.inner.as_bytes());
        format!("{key_name}:{b64}")
    }

    /// Read a public key file.
    pub fn load(path: &Path) -> SignerResult<(String, Self)> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub(crate) fn verifying_key(&self) -> &VerifyingKey {
        &self.inner
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.inner.as_bytes() == other.inner.as_bytes()
    }
}

impl Eq for PublicKey {}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b64 = base64::engine::general_purpose::STANDARD.encode(self.inner.as_bytes());
        write!(f, "PublicKey({}...)", &b64[..8])
    }
}

/// A named key pair.
pub struct KeyPair {
    pub name: String,
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl KeyPair {
    pub fn generate(name: impl Into<String>) -> Self {
        let secret = SecretKey::generate();
        let public = secret.public_key();
        Self {
            name: name.into(),
            secret,
            public,
        }
    }

    pub fn parse_secret(s: &str) -> SignerResult<Self> {
        let (name, secret) = SecretKey::parse(s)?;
        let public = secret.public_key();
        Ok(Self {
            name,
            secret,
            public,
        })
    }

    pub fn secret_key_string(&self) -> String {
        self.secret.encode(&self.name)
    }

    pub fn public_key_string(&self) -> String {
        self.public.encode(&self.name)
    }

    /// Path of the public key written alongside a secret key file.
    pub fn public_key_path(secret_path: &Path) -> PathBuf {
        let mut name = secret_path.as_os_str().to_owned();
        name.push(".pub");
        PathBuf::from(name)
    }

    /// Load the secret key at `path`, or generate one named `name` and write
    /// both halves (`path` and `path.pub`).
    pub fn load_or_generate(path: &Path, name: &str) -> SignerResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse_secret(&contents),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let keypair = Self::generate(name);
                keypair.save(path)?;
                tracing::info!(
                    path = %path.display(),
                    public_key = %Self::public_key_path(path).display(),
                    "generated new signing key"
                );
                Ok(keypair)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Write the secret key to `path` (owner-only on unix) and the public key
    /// to `path.pub`.
    pub fn save(&self, path: &Path) -> SignerResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, format!("{}\n", self.secret_key_string()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::write(
            Self::public_key_path(path),
            format!("{}\n", self.public_key_string()),
        )?;
        Ok(())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("name", &self.name)
            .field("public", &self.public)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_key_roundtrip() {
        let keypair = KeyPair::generate("ferry-1");
        let parsed = KeyPair::parse_secret(&keypair.secret_key_string()).unwrap();
        assert_eq!(parsed.name, "ferry-1");
        assert_eq!(parsed.public, keypair.public);
    }

    #[test]
    fn test_public_key_parse_rejects_bad_input() {
        assert!(PublicKey::parse("no-separator").is_err());
        assert!(PublicKey::parse(":AAAA").is_err());
        assert!(PublicKey::parse("k:not base64!").is_err());
        assert!(PublicKey::parse("k:AAAA").is_err());
    }

    #[test]
    fn test_secret_key_with_foreign_public_half_rejected() {
        let a = KeyPair::generate("a");
        let b = KeyPair::generate("b");
        let mut bytes = a.secret.signing_key().as_bytes().to_vec();
        bytes.extend_from_slice(b.public.verifying_key().as_bytes());
        let forged = format!(
            "a:{}",
            base64::engine::general_purpose::STANDARD.encode(bytes)
        );
        assert!(SecretKey::parse(&forged).is_err());
    }

    #[test]
    fn test_load_or_generate_writes_both_halves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys/ferry.key");

        let generated = KeyPair::load_or_generate(&path, "ferry-1").unwrap();
        let pub_path = KeyPair::public_key_path(&path);
        assert_eq!(pub_path, dir.path().join("keys/ferry.key.pub"));

        let (name, public) = PublicKey::load(&pub_path).unwrap();
        assert_eq!(name, "ferry-1");
        assert_eq!(public, generated.public);

        let reloaded = KeyPair::load_or_generate(&path, "ignored").unwrap();
        assert_eq!(reloaded.name, "ferry-1");
        assert_eq!(reloaded.public, generated.public);
    }
}
