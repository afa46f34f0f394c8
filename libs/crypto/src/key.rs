//! Per-node symmetric join key.

use rand::RngCore;

use crate::{CryptoError, Result};

/// Number of random bytes in a key.
pub const RAW_KEY_LEN: usize = 16;

/// Length of the hex encoding, which is also the AES key length.
pub const HEX_KEY_LEN: usize = RAW_KEY_LEN * 2;

/// Symmetric key shared between a joining node and the cluster issuer.
///
/// The key is 16 random bytes kept in lowercase hex. The cipher key is the
/// ASCII of that hex string (32 bytes, AES-256), which is what the issuer
/// receives after unwrapping and uses to seal the response fields.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey {
    hex: String,
}

impl SymmetricKey {
    /// Generate a fresh key from the OS-seeded thread RNG.
    pub fn generate() -> Self {
        let mut raw = [0u8; RAW_KEY_LEN];
        rand::rng().fill_bytes(&mut raw);
        Self::from_raw(raw)
    }

    /// Build a key from raw bytes.
    pub fn from_raw(raw: [u8; RAW_KEY_LEN]) -> Self {
        Self {
            hex: hex::encode(raw),
        }
    }

    /// Parse the at-rest hex form. Surrounding whitespace is ignored.
    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() != HEX_KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} hex characters, got {}",
                HEX_KEY_LEN,
                s.len()
            )));
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CryptoError::InvalidKey("key is not hex encoded".to_string()));
        }

        Ok(Self {
            hex: s.to_ascii_lowercase(),
        })
    }

    /// The at-rest hex form.
    pub fn to_hex(&self) -> &str {
        &self.hex
    }

    /// AES-256 key bytes.
    pub(crate) fn cipher_key(&self) -> &[u8] {
        self.hex.as_bytes()
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey([REDACTED])")
    }
}
