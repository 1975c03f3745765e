//! WireGuard key material
//!
//! Keys are handled as the base64 text `wg` reads and prints. Only private
//! keys are ever parsed back (the server key stored in settings); public keys
//! are always derived.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use std::fmt;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid key length (expected 32 bytes)")]
    InvalidLength,
}

#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|_| KeyError::InvalidBase64)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidLength)?;
        Ok(Self(StaticSecret::from(bytes)))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(X25519Public::from(&self.0).to_bytes())
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0.to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([redacted])")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// A private key and the public key derived from it
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private: PrivateKey,
    pub public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_private(PrivateKey::generate())
    }

    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_encode_to_44_chars() {
        let pair = KeyPair::generate();

        assert_eq!(pair.private.to_base64().len(), 44);
        assert_eq!(pair.public.to_base64().len(), 44);
    }

    #[test]
    fn test_public_key_derived_from_restored_private_key() {
        let pair = KeyPair::generate();
        let restored = PrivateKey::from_base64(&pair.private.to_base64()).unwrap();

        assert_eq!(restored.public_key(), pair.public);
    }

    #[test]
    fn test_distinct_pairs() {
        assert_ne!(KeyPair::generate().public, KeyPair::generate().public);
    }

    #[test]
    fn test_rejects_malformed_keys() {
        assert!(matches!(
            PrivateKey::from_base64("not base64!"),
            Err(KeyError::InvalidBase64)
        ));
        assert!(matches!(
            PrivateKey::from_base64("AAAA"),
            Err(KeyError::InvalidLength)
        ));
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let pair = KeyPair::generate();
        assert_eq!(format!("{:?}", pair.private), "PrivateKey([redacted])");
        assert!(!format!("{:?}", pair).contains(&pair.private.to_base64()));
    }
}
