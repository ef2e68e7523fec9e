// SPDX-License-Identifier: MIT OR Apache-2.0

//! Curve25519 scalar multiplication for the group key-agreement chain.
//!
//! CLIQUES accumulates partial Diffie–Hellman products by repeatedly
//! scalar-multiplying arbitrary group elements, not just the base point, so
//! the wrappers here expose raw Montgomery-curve arithmetic. The neutral
//! starting element of a fresh chain is the curve generator.
use std::fmt;

use curve25519_dalek::MontgomeryPoint;
use curve25519_dalek::constants::X25519_BASEPOINT;
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

pub const SECRET_KEY_SIZE: usize = 32;
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Secret Curve25519 exponent contributing to the group key.
#[derive(Clone, Eq, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SecretKey(#[serde(with = "serde_bytes")] [u8; SECRET_KEY_SIZE]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        // Clamping
        let mut bytes = bytes;
        bytes[0] &= 248u8;
        bytes[31] &= 127u8;
        bytes[31] |= 64u8;
        SecretKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.0
    }

    /// Scalar multiplication of the base point: `g^k`.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(MontgomeryPoint::mul_base_clamped(self.0).to_bytes())
    }

    /// Scalar multiplication of an arbitrary group element: `element^k`.
    pub fn scalar_mult(&self, element: &PublicKey) -> PublicKey {
        PublicKey(MontgomeryPoint(element.0).mul_clamped(self.0).to_bytes())
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Do not reveal the exponent when printing debug info.
        f.debug_tuple("SecretKey").field(&"***").finish()
    }
}

/// Group element (compressed Montgomery u-coordinate).
#[derive(Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "serde_bytes")] [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// The curve generator, standing in for "1" at the head of a fresh
    /// intermediate-key chain.
    pub fn generator() -> Self {
        Self(X25519_BASEPOINT.to_bytes())
    }

    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;

    use super::{PublicKey, SecretKey};

    #[test]
    fn diffie_hellman() {
        let rng = Rng::from_seed([1; 32]);

        let alice_secret_key = SecretKey::from_bytes(rng.random_array().unwrap());
        let alice_public_key = alice_secret_key.public_key();

        let bob_secret_key = SecretKey::from_bytes(rng.random_array().unwrap());
        let bob_public_key = bob_secret_key.public_key();

        let alice_shared_secret = alice_secret_key.scalar_mult(&bob_public_key);
        let bob_shared_secret = bob_secret_key.scalar_mult(&alice_public_key);

        assert_eq!(alice_shared_secret, bob_shared_secret);
    }

    #[test]
    fn generator_is_base_point() {
        let rng = Rng::from_seed([1; 32]);

        let secret_key = SecretKey::from_bytes(rng.random_array().unwrap());
        assert_eq!(
            secret_key.scalar_mult(&PublicKey::generator()),
            secret_key.public_key()
        );
    }

    #[test]
    fn scalar_mult_commutes() {
        let rng = Rng::from_seed([1; 32]);

        let a = SecretKey::from_bytes(rng.random_array().unwrap());
        let b = SecretKey::from_bytes(rng.random_array().unwrap());
        let c = SecretKey::from_bytes(rng.random_array().unwrap());
        let element = c.public_key();

        assert_eq!(
            a.scalar_mult(&b.scalar_mult(&element)),
            b.scalar_mult(&a.scalar_mult(&element))
        );
    }
}
