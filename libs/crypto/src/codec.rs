//! Field-level authenticated encryption.
//!
//! Each field travels as `base64_nopad(nonce || ciphertext || tag)` sealed with
//! AES-256-GCM under the node's [`SymmetricKey`]. Fields are independent: one
//! corrupted field does not affect the others, but callers treat any failure
//! as fatal.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use rand::RngCore;

use crate::{CryptoError, Result, SymmetricKey};

/// AES-GCM standard nonce size.
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag size.
const TAG_LEN: usize = 16;

fn cipher(key: &SymmetricKey) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key.cipher_key())
        .map_err(|_| CryptoError::InvalidKey("AES-256 key must be 32 bytes".to_string()))
}

/// Encrypt a field with a fresh random nonce.
pub fn encrypt_field(key: &SymmetricKey, plaintext: &str) -> Result<String> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    encrypt_field_with_nonce(key, &nonce, plaintext)
}

/// Encrypt a field with a caller-chosen nonce.
///
/// Output is fully determined by `(key, nonce, plaintext)`. Never reuse a
/// nonce with the same key outside of tests.
pub fn encrypt_field_with_nonce(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_LEN],
    plaintext: &str,
) -> Result<String> {
    let sealed = cipher(key)?
        .encrypt(Nonce::from_slice(nonce), plaintext.as_bytes())
        .map_err(|_| CryptoError::EncryptFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(&sealed);
    Ok(STANDARD_NO_PAD.encode(out))
}

/// Decrypt a field produced by [`encrypt_field`] or the cluster issuer.
pub fn decrypt_field(key: &SymmetricKey, encoded: &str) -> Result<String> {
    let data = STANDARD_NO_PAD.decode(encoded.trim())?;
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Truncated {
            len: data.len(),
            min: NONCE_LEN + TAG_LEN,
        });
    }

    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    let plaintext = cipher(key)?
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Authentication)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::Utf8)
}
