//! Ed25519 signing of re-emitted NARInfo.
//!
//! Signature strings follow the canonical Nix format used by the `nix`
//! CLI itself: `{keyName}:{base64Payload}`. Importing a secret key
//! generated by `nix-store --generate-binary-cache-key` therefore just
//! works.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use displaydoc::Display;
use ed25519_compact::{KeyPair, Signature as Ed25519Signature};

use crate::narinfo::Signature;

#[derive(Debug, Display)]
pub enum SigningError {
    /// signing key string lacks a colon separator
    NoColonSeparator,
    /// signing key name is blank
    BlankKeyName,
    /// invalid base64 payload: {0}
    Base64(base64::DecodeError),
    /// invalid secret key payload length: expected {expected}, got {actual}
    InvalidPayloadLength { expected: usize, actual: usize },
    /// underlying ed25519 error: {0}
    Ed25519(ed25519_compact::Error),
}

impl std::error::Error for SigningError {}

/// An imported Ed25519 keypair, identified by a Nix key name (e.g.
/// `cache.example-1`).
pub struct Signer {
    name: String,
    keypair: KeyPair,
}

impl Signer {
    /// Imports a keypair from its canonical `{keyName}:{base64Payload}` form.
    pub fn from_canonical(s: &str) -> Result<Self, SigningError> {
        let (name, payload) = decode_canonical(s, KeyPair::BYTES)?;

        let keypair = KeyPair::from_slice(&payload).map_err(SigningError::Ed25519)?;

        Ok(Self {
            name: name.to_owned(),
            keypair,
        })
    }

    /// Generates a fresh keypair, for first-boot provisioning. Returns
    /// the signer plus its canonical form so the caller can persist it.
    pub fn generate(name: impl Into<String>) -> (Self, String) {
        let keypair = KeyPair::generate();
        let name = name.into();
        let canonical = format!("{name}:{}", BASE64.encode(*keypair));
        (Self { name, keypair }, canonical)
    }

    pub fn key_name(&self) -> &str {
        &self.name
    }

    /// Signs a fingerprint, returning a `Sig:` line value.
    pub fn sign(&self, fingerprint: &str) -> Signature {
        let bytes = self.keypair.sk.sign(fingerprint.as_bytes(), None);
        Signature(format!("{}:{}", self.name, BASE64.encode(bytes)))
    }
}

fn decode_canonical(s: &str, expected_len: usize) -> Result<(&str, Vec<u8>), SigningError> {
    let colon = s.find(':').ok_or(SigningError::NoColonSeparator)?;
    let (name, rest) = s.split_at(colon);

    if name.is_empty() {
        return Err(SigningError::BlankKeyName);
    }

    let payload = BASE64
        .decode(&rest[1..])
        .map_err(SigningError::Base64)?;

    if payload.len() != expected_len {
        return Err(SigningError::InvalidPayloadLength {
            expected: expected_len,
            actual: payload.len(),
        });
    }

    Ok((name, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (String, Signer) {
        let kp = KeyPair::generate();
        let name = "cache.test-1".to_owned();
        let canonical = format!("{name}:{}", BASE64.encode(*kp));
        (canonical.clone(), Signer::from_canonical(&canonical).unwrap())
    }

    #[test]
    fn sign_produces_canonical_form_with_key_name_prefix() {
        let (_, signer) = keypair();
        let sig = signer.sign("1;/nix/store/x;sha256:y;1;");
        assert!(sig.0.starts_with("cache.test-1:"));
    }

    #[test]
    fn rejects_missing_colon() {
        assert!(matches!(
            Signer::from_canonical("nocolonhere"),
            Err(SigningError::NoColonSeparator)
        ));
    }

    #[test]
    fn rejects_wrong_payload_length() {
        let bad = format!("cache.test-1:{}", BASE64.encode(b"short"));
        assert!(matches!(
            Signer::from_canonical(&bad),
            Err(SigningError::InvalidPayloadLength { .. })
        ));
    }
}
