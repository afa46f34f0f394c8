//! Key material and encryption primitives for the node join protocol.
//!
//! A joining node owns a [`SymmetricKey`]. It hands that key to the cluster
//! wrapped under the cluster's [`JoinPublicKey`], and the cluster answers with
//! individually encrypted fields that only the node can open.
//!
//! - `key`: the per-node symmetric key
//! - `wrap`: X25519 + AES-256-GCM key wrapping
//! - `codec`: AES-256-GCM field encryption (`nonce || ciphertext`, base64 without padding)

use thiserror::Error;

pub mod codec;
pub mod key;
pub mod wrap;

pub use codec::{decrypt_field, encrypt_field, encrypt_field_with_nonce, NONCE_LEN};
pub use key::SymmetricKey;
pub use wrap::{JoinKeyPair, JoinPublicKey};

/// Crypto errors.
///
/// None of the variants carry key material or plaintext.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key material could not be parsed.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Payload is not valid base64.
    #[error("invalid base64 encoding: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// Payload is shorter than its fixed-size header.
    #[error("ciphertext too short: {len} bytes (need at least {min})")]
    Truncated { len: usize, min: usize },

    /// Authentication tag did not verify.
    #[error("authentication failed")]
    Authentication,

    /// Decrypted payload is not UTF-8.
    #[error("decrypted payload is not valid UTF-8")]
    Utf8,

    /// Encryption failed.
    #[error("encryption failed")]
    EncryptFailed,
}

/// Result alias for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
