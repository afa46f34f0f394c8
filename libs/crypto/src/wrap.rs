//! Symmetric key wrapping under the cluster's join public key.
//!
//! Hybrid scheme: an ephemeral X25519 key agrees a shared secret with the
//! cluster key, SHA-256 derives a wrap key from it, and AES-256-GCM seals the
//! symmetric key.
//!
//! Wire layout (standard base64 with padding):
//!
//! ```text
//! ephemeral_public (32) || nonce (12) || sealed_key || tag (16)
//! ```

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::codec::NONCE_LEN;
use crate::{CryptoError, Result, SymmetricKey};

const PUBLIC_KEY_LEN: usize = 32;
const WRAP_KDF_LABEL: &[u8] = b"nodemesh-join-key-wrap-v1";

/// The cluster's join public key, as distributed with join tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinPublicKey(PublicKey);

impl JoinPublicKey {
    /// Parse a base64-encoded 32-byte X25519 public key.
    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(s.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("join public key: {}", e)))?;
        let bytes: [u8; PUBLIC_KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "join public key must be {} bytes, got {}",
                PUBLIC_KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(PublicKey::from(bytes)))
    }

    /// Base64 form.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0.as_bytes())
    }

    /// Wrap a symmetric key for transport to the cluster.
    pub fn wrap(&self, key: &SymmetricKey) -> Result<String> {
        let mut ephemeral_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut ephemeral_bytes);
        let ephemeral = StaticSecret::from(ephemeral_bytes);
        let ephemeral_public = PublicKey::from(&ephemeral);

        let shared = ephemeral.diffie_hellman(&self.0);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey(
                "join public key is a low-order point".to_string(),
            ));
        }
        let wrap_key = derive_wrap_key(shared.as_bytes(), &ephemeral_public, &self.0);

        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let sealed = Aes256Gcm::new_from_slice(&wrap_key)
            .map_err(|_| CryptoError::EncryptFailed)?
            .encrypt(Nonce::from_slice(&nonce), key.to_hex().as_bytes())
            .map_err(|_| CryptoError::EncryptFailed)?;

        let mut out = Vec::with_capacity(PUBLIC_KEY_LEN + NONCE_LEN + sealed.len());
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(STANDARD.encode(out))
    }
}

/// The cluster-side key pair matching a [`JoinPublicKey`].
///
/// Nodes never hold one of these; it exists for issuers and tests.
pub struct JoinKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl JoinKeyPair {
    /// Generate a new key pair.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self::from_secret_bytes(bytes)
    }

    /// Rebuild a key pair from its 32-byte secret.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public half.
    pub fn public_key(&self) -> JoinPublicKey {
        JoinPublicKey(self.public)
    }

    /// Recover a symmetric key wrapped by [`JoinPublicKey::wrap`].
    pub fn unwrap(&self, wrapped: &str) -> Result<SymmetricKey> {
        let data = STANDARD.decode(wrapped.trim())?;
        let min = PUBLIC_KEY_LEN + NONCE_LEN + 16;
        if data.len() < min {
            return Err(CryptoError::Truncated {
                len: data.len(),
                min,
            });
        }

        let (ephemeral, rest) = data.split_at(PUBLIC_KEY_LEN);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);
        let mut ephemeral_bytes = [0u8; PUBLIC_KEY_LEN];
        ephemeral_bytes.copy_from_slice(ephemeral);
        let ephemeral_public = PublicKey::from(ephemeral_bytes);

        let shared = self.secret.diffie_hellman(&ephemeral_public);
        if !shared.was_contributory() {
            return Err(CryptoError::Authentication);
        }
        let wrap_key = derive_wrap_key(shared.as_bytes(), &ephemeral_public, &self.public);

        let opened = Aes256Gcm::new_from_slice(&wrap_key)
            .map_err(|_| CryptoError::Authentication)?
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::Authentication)?;

        let hex = String::from_utf8(opened).map_err(|_| CryptoError::Utf8)?;
        SymmetricKey::from_hex(&hex)
    }
}

fn derive_wrap_key(shared: &[u8], ephemeral: &PublicKey, recipient: &PublicKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(WRAP_KDF_LABEL);
    hasher.update(shared);
    hasher.update(ephemeral.as_bytes());
    hasher.update(recipient.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap() {
        let pair = JoinKeyPair::generate();
        let key = SymmetricKey::generate();

        let wrapped = pair.public_key().wrap(&key).unwrap();
        assert_eq!(pair.unwrap(&wrapped).unwrap(), key);
    }

    #[test]
    fn test_wrap_is_randomized() {
        let pair = JoinKeyPair::generate();
        let key = SymmetricKey::generate();

        let a = pair.public_key().wrap(&key).unwrap();
        let b = pair.public_key().wrap(&key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_unwrap_with_other_pair_fails() {
        let pair = JoinKeyPair::generate();
        let other = JoinKeyPair::generate();
        let wrapped = pair.public_key().wrap(&SymmetricKey::generate()).unwrap();

        assert!(matches!(
            other.unwrap(&wrapped),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn test_public_key_base64_roundtrip() {
        let pair = JoinKeyPair::from_secret_bytes([42; 32]);
        let encoded = pair.public_key().to_base64();
        assert_eq!(
            JoinPublicKey::from_base64(&encoded).unwrap(),
            pair.public_key()
        );
    }

    #[test]
    fn test_public_key_rejects_wrong_length() {
        assert!(JoinPublicKey::from_base64("AAAA").is_err());
    }

    #[test]
    fn test_low_order_public_key_rejected() {
        let zero = JoinPublicKey::from_base64(&STANDARD.encode([0u8; 32])).unwrap();
        assert!(zero.wrap(&SymmetricKey::generate()).is_err());
    }
}
