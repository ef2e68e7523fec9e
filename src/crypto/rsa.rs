// SPDX-License-Identifier: MIT OR Apache-2.0

//! RSA-PKCS1-v1.5 signatures with the static identity key.
//!
//! Session acknowledgements are the only place the static keypair is used.
//! The signature block is assembled by hand the way peer implementations lay
//! it out, with one correction: the random padding string is drawn from the
//! engine's CSPRNG rather than a weak generator. The private-key operation
//! runs blinded; the verifier recovers the block with the public key and
//! checks padding structure and digest.
use std::fmt;

use rsa::hazmat::{rsa_decrypt_and_check, rsa_encrypt};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::crypto::{Rng, RngError};

/// Default modulus size for newly generated identity keys.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// ASN.1 DigestInfo header binding a SHA-256 digest, per RFC 8017.
const SHA256_DIGEST_INFO: [u8; 19] = [
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, 0x04, 0x20,
];

/// Minimum number of padding bytes a block must carry.
const MIN_PAD_LEN: usize = 8;

/// Static RSA signing key identifying one participant across sessions.
#[derive(Clone)]
pub struct StaticSigningKey(RsaPrivateKey);

impl StaticSigningKey {
    /// Generates a fresh identity keypair with a modulus of `bits` bits.
    pub fn generate(bits: usize, rng: &Rng) -> Result<Self, StaticKeyError> {
        let key = rng.with_rng(|rng| RsaPrivateKey::new(rng, bits))??;
        Ok(Self(key))
    }

    pub fn verifying_key(&self) -> StaticVerifyingKey {
        StaticVerifyingKey(RsaPublicKey::from(&self.0))
    }

    /// Signs a session acknowledgement: the SHA-256 digest is wrapped into a
    /// PKCS#1 v1.5 block with a freshly drawn non-zero padding string and
    /// run through the blinded private-key operation.
    pub fn sign(&self, bytes: &[u8], rng: &Rng) -> Result<Vec<u8>, StaticKeyError> {
        let block = padded_digest_block(self.0.size(), bytes, rng)?;
        let m = BigUint::from_bytes_be(&block);
        let s = rng
            .with_rng(|rng| rsa_decrypt_and_check(&self.0, Some(rng), &m))?
            .map_err(|_| StaticKeyError::SigningFailed)?;
        Ok(left_pad(&s.to_bytes_be(), self.0.size()))
    }
}

impl fmt::Debug for StaticSigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Do not reveal the key when printing debug info.
        f.debug_tuple("StaticSigningKey").field(&"***").finish()
    }
}

/// Static RSA public key, looked up through the participant directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticVerifyingKey(RsaPublicKey);

impl StaticVerifyingKey {
    /// Recovers the signature block with the public-key operation and
    /// checks its structure and the embedded digest.
    pub fn verify(&self, bytes: &[u8], signature: &[u8]) -> Result<(), StaticKeyError> {
        let size = self.0.size();
        if signature.len() != size {
            return Err(StaticKeyError::VerificationFailed);
        }
        let s = BigUint::from_bytes_be(signature);
        let m = rsa_encrypt(&self.0, &s).map_err(|_| StaticKeyError::VerificationFailed)?;
        let block = left_pad(&m.to_bytes_be(), size);

        // `0x00 0x01 <non-zero padding> 0x00 <DigestInfo ‖ digest>`, the
        // padding at least eight bytes long.
        if block[0] != 0x00 || block[1] != 0x01 {
            return Err(StaticKeyError::VerificationFailed);
        }
        let pad_len = block[2..]
            .iter()
            .position(|&byte| byte == 0x00)
            .ok_or(StaticKeyError::VerificationFailed)?;
        if pad_len < MIN_PAD_LEN {
            return Err(StaticKeyError::VerificationFailed);
        }

        let digest = Sha256::digest(bytes);
        let expected: Vec<u8> = SHA256_DIGEST_INFO.iter().copied().chain(digest).collect();
        if block[2 + pad_len + 1..] != expected {
            return Err(StaticKeyError::VerificationFailed);
        }
        Ok(())
    }

    /// Signature length in bytes (the modulus size).
    pub fn signature_size(&self) -> usize {
        self.0.size()
    }
}

/// `0x00 0x01 <random non-zero padding> 0x00 <DigestInfo ‖ digest>`, sized
/// to the modulus.
fn padded_digest_block(size: usize, bytes: &[u8], rng: &Rng) -> Result<Vec<u8>, StaticKeyError> {
    let digest = Sha256::digest(bytes);
    let payload_len = SHA256_DIGEST_INFO.len() + digest.len();
    let pad_len = size
        .checked_sub(payload_len + 3)
        .filter(|&len| len >= MIN_PAD_LEN)
        .ok_or(StaticKeyError::ModulusTooSmall(size))?;

    let mut padding = rng.random_vec(pad_len)?;
    for byte in padding.iter_mut() {
        while *byte == 0x00 {
            *byte = rng.random_array::<1>()?[0];
        }
    }

    let mut block = Vec::with_capacity(size);
    block.push(0x00);
    block.push(0x01);
    block.extend_from_slice(&padding);
    block.push(0x00);
    block.extend_from_slice(&SHA256_DIGEST_INFO);
    block.extend_from_slice(&digest);
    Ok(block)
}

fn left_pad(bytes: &[u8], size: usize) -> Vec<u8> {
    let mut out = vec![0u8; size];
    out[size - bytes.len()..].copy_from_slice(bytes);
    out
}

#[derive(Debug, Error)]
pub enum StaticKeyError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error("could not generate rsa keypair")]
    KeyGenerationFailed,

    #[error("rsa modulus of {0} bytes leaves no room for the padded digest")]
    ModulusTooSmall(usize),

    #[error("could not sign payload")]
    SigningFailed,

    #[error("signature does not match public key and payload")]
    VerificationFailed,
}

impl From<rsa::Error> for StaticKeyError {
    fn from(_: rsa::Error) -> Self {
        StaticKeyError::KeyGenerationFailed
    }
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;

    use super::{StaticKeyError, StaticSigningKey};

    #[test]
    fn sign_and_verify() {
        let rng = Rng::from_seed([1; 32]);

        let signing_key = StaticSigningKey::generate(1024, &rng).unwrap();
        let verifying_key = signing_key.verifying_key();

        let signature = signing_key.sign(b"session acknowledgement", &rng).unwrap();
        assert!(verifying_key
            .verify(b"session acknowledgement", &signature)
            .is_ok());
        assert_eq!(signature.len(), verifying_key.signature_size());
    }

    #[test]
    fn padding_is_randomized() {
        let rng = Rng::from_seed([1; 32]);

        let signing_key = StaticSigningKey::generate(1024, &rng).unwrap();
        let verifying_key = signing_key.verifying_key();

        // Fresh padding every time: the signatures differ, both verify.
        let first = signing_key.sign(b"session acknowledgement", &rng).unwrap();
        let second = signing_key.sign(b"session acknowledgement", &rng).unwrap();
        assert_ne!(first, second);
        assert!(verifying_key
            .verify(b"session acknowledgement", &first)
            .is_ok());
        assert!(verifying_key
            .verify(b"session acknowledgement", &second)
            .is_ok());
    }

    #[test]
    fn failed_verify() {
        let rng = Rng::from_seed([1; 32]);

        let signing_key = StaticSigningKey::generate(1024, &rng).unwrap();
        let verifying_key = signing_key.verifying_key();
        let signature = signing_key.sign(b"session acknowledgement", &rng).unwrap();

        assert!(matches!(
            verifying_key.verify(b"something else", &signature),
            Err(StaticKeyError::VerificationFailed)
        ));

        let other_key = StaticSigningKey::generate(1024, &rng).unwrap();
        assert!(matches!(
            other_key
                .verifying_key()
                .verify(b"session acknowledgement", &signature),
            Err(StaticKeyError::VerificationFailed)
        ));

        // A garbled signature is structurally invalid, not just a digest
        // mismatch.
        let mut garbled = signature.clone();
        garbled[0] ^= 0xff;
        assert!(matches!(
            verifying_key.verify(b"session acknowledgement", &garbled),
            Err(StaticKeyError::VerificationFailed)
        ));
    }
}
