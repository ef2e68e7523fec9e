// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic primitives and random number generator.
//!
//! Algorithms:
//! - Curve25519 scalar multiplication (CLIQUES key-agreement chain)
//! - Ed25519 (SHA-512) DSA (per-message and session signatures)
//! - RSA-PKCS1-v1.5 with SHA-256 (static identity signatures)
//! - AES-128-CTR (data payloads)
//! - SHA-256 (session ids, key hints, packet ids)
//!
//! Random Number Generator:
//! - ChaCha20 stream cipher, seeded from the operating system
pub mod aes_ctr;
pub mod ed25519;
mod rng;
pub mod rsa;
mod secret;
pub mod sha2;
pub mod x25519;

pub use rng::{Rng, RngError};
pub use secret::Secret;
