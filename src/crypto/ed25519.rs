// SPDX-License-Identifier: MIT OR Apache-2.0

//! Edwards-Curve Digital Signature Algorithm (EdDSA) related to Curve25519
//! using SHA-512.
//!
//! Every session member holds an ephemeral signing key which authenticates
//! its greet and data messages for the lifetime of that session.
use std::fmt;

use ed25519_dalek::Signer;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::ZeroizeOnDrop;

pub const SIGNING_KEY_SIZE: usize = 32;
pub const VERIFYING_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SigningKey(#[serde(with = "serde_bytes")] [u8; SIGNING_KEY_SIZE]);

impl SigningKey {
    pub fn from_bytes(bytes: [u8; SIGNING_KEY_SIZE]) -> Self {
        SigningKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNING_KEY_SIZE] {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; SIGNING_KEY_SIZE] {
        self.0
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        let key = ed25519_dalek::SigningKey::from_bytes(&self.0);
        VerifyingKey(key.verifying_key().to_bytes())
    }

    pub fn sign(&self, bytes: &[u8]) -> Signature {
        let key = ed25519_dalek::SigningKey::from_bytes(&self.0);
        Signature(key.sign(bytes).to_bytes())
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Do not reveal the key when printing debug info.
        f.debug_tuple("SigningKey").field(&"***").finish()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VerifyingKey(#[serde(with = "serde_bytes")] [u8; VERIFYING_KEY_SIZE]);

impl VerifyingKey {
    pub fn from_bytes(bytes: [u8; VERIFYING_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; VERIFYING_KEY_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; VERIFYING_KEY_SIZE] {
        self.0
    }

    pub fn verify(&self, bytes: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|_| SignatureError::InvalidKey)?;
        let signature = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify_strict(bytes, &signature)
            .map_err(|_| SignatureError::VerificationFailed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] [u8; SIGNATURE_SIZE]);

impl Signature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, SignatureError> {
        let bytes: [u8; SIGNATURE_SIZE] = bytes
            .try_into()
            .map_err(|_| SignatureError::InvalidSignatureSize(bytes.len()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; SIGNATURE_SIZE] {
        self.0
    }
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("verifying key is not a valid curve point")]
    InvalidKey,

    #[error("signature must be {SIGNATURE_SIZE} bytes, got {0}")]
    InvalidSignatureSize(usize),

    #[error("signature does not match public key and payload")]
    VerificationFailed,
}
