// SPDX-License-Identifier: MIT OR Apache-2.0

//! Methods to encrypt and decrypt data payloads symmetrically with the
//! AES128 block cipher in CTR operation mode.
//!
//! The counter block is the 96-bit message nonce followed by a 32-bit
//! big-endian block counter starting at zero.
use aes::Aes128;
use ctr::Ctr32BE;
use ctr::cipher::{KeyIvInit, StreamCipher};
use thiserror::Error;

pub const KEY_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 12;

type Aes128Ctr = Ctr32BE<Aes128>;

/// Encrypts plaintext data symmetrically with AES128 in CTR mode using a
/// secret key and nonce, returning the ciphertext.
pub fn encrypt(key: &[u8], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, AesCtrError> {
    apply_keystream(key, nonce, plaintext)
}

/// Decrypts ciphertext symmetrically with AES128 in CTR mode using a secret
/// key and nonce.
pub fn decrypt(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, AesCtrError> {
    apply_keystream(key, nonce, ciphertext)
}

// CTR mode is an involution, both directions share the keystream.
fn apply_keystream(key: &[u8], nonce: &[u8], data: &[u8]) -> Result<Vec<u8>, AesCtrError> {
    if nonce.len() != NONCE_SIZE {
        return Err(AesCtrError::InvalidNonceSize(nonce.len()));
    }

    let mut iv = [0u8; 16];
    iv[..NONCE_SIZE].copy_from_slice(nonce);

    let mut cipher = Aes128Ctr::new_from_slices(key, &iv)
        .map_err(|_| AesCtrError::InvalidKeySize(key.len()))?;
    let mut out = data.to_vec();
    cipher.apply_keystream(&mut out);
    Ok(out)
}

/// Custom error types for AES128-CTR methods.
#[derive(Debug, Error)]
pub enum AesCtrError {
    /// AES key must be exactly 128 bits.
    #[error("AES-CTR key must be {KEY_SIZE} bytes, got {0}")]
    InvalidKeySize(usize),

    /// Nonce must leave room for the 32-bit counter.
    #[error("AES-CTR nonce must be {NONCE_SIZE} bytes, got {0}")]
    InvalidNonceSize(usize),
}
