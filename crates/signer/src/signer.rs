//! Session token signing and verification.
//!
//! A token is `base64url(claims json) "." base64url(signature)`, where the
//! signature covers the first segment exactly as transmitted.

use crate::error::{SignerError, SignerResult};
use crate::key::{KeyPair, PublicKey};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::Signer as _;
use ed25519_dalek::Verifier;
use ferry_core::TokenClaims;

/// Issues signed session tokens.
pub struct TokenSigner {
    keypair: KeyPair,
}

impl TokenSigner {
    pub fn new(keypair: KeyPair) -> Self {
        Self { keypair }
    }

    pub fn key_name(&self) -> &str {
        &self.keypair.name
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.keypair.public
    }

    /// The verifier matching this signer.
    pub fn verifier(&self) -> TokenVerifier {
        TokenVerifier::new(self.keypair.public.clone())
    }

    pub fn sign(&self, claims: &TokenClaims) -> SignerResult<String> {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let signature = self.keypair.secret.signing_key().sign(payload.as_bytes());
        Ok(format!(
            "{payload}.{}",
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}

/// Checks tokens against a single trusted public key.
#[derive(Clone, Debug)]
pub struct TokenVerifier {
    public_key: PublicKey,
}

impl TokenVerifier {
    pub fn new(public_key: PublicKey) -> Self {
        Self { public_key }
    }

    /// Verify the signature and decode the claims.
    ///
    /// Expiry and role completeness are checked by [`TokenClaims::role`].
    pub fn verify(&self, token: &str) -> SignerResult<TokenClaims> {
        let (payload, signature) = token
            .trim()
            .split_once('.')
            .ok_or_else(|| SignerError::MalformedToken("expected 'claims.signature'".to_string()))?;

        let sig_bytes = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|e| SignerError::MalformedToken(format!("invalid signature encoding: {e}")))?;
        let sig_array: [u8; 64] = sig_bytes.try_into().map_err(|bytes: Vec<u8>| {
            SignerError::MalformedToken(format!("expected 64 signature bytes, got {}", bytes.len()))
        })?;

        self.public_key
            .verifying_key()
            .verify(
                payload.as_bytes(),
                &ed25519_dalek::Signature::from_bytes(&sig_array),
            )
            .map_err(|_| SignerError::VerificationFailed)?;

        let claims = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| SignerError::MalformedToken(format!("invalid claims encoding: {e}")))?;
        Ok(serde_json::from_slice(&claims)?)
    }
}
