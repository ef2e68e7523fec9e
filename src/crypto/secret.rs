// SPDX-License-Identifier: MIT OR Apache-2.0

//! Container for long-lived secret bytes.
use std::fmt;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::ZeroizeOnDrop;

/// Fixed-width secret bytes; in this engine the 256-bit group key a session
/// store carries between operations.
///
/// Group keys outlive single calls and get compared across members in tests
/// and assertions, so the container compares in constant time, never prints
/// its value, and zeroises its memory on drop. Code inside the crate reaches
/// the raw bytes through [`Secret::expose`]; the name is chosen to stand out
/// wherever key material leaves the wrapper.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct Secret<const N: usize> {
    #[serde(with = "serde_bytes")]
    bytes: [u8; N],
}

impl<const N: usize> Secret<N> {
    pub(crate) fn from_bytes(bytes: [u8; N]) -> Self {
        Self { bytes }
    }

    /// Grants read access to the raw key material.
    pub(crate) fn expose(&self) -> &[u8; N] {
        &self.bytes
    }
}

impl<const N: usize> PartialEq for Secret<N> {
    fn eq(&self, other: &Self) -> bool {
        self.bytes.ct_eq(&other.bytes).into()
    }
}

impl<const N: usize> Eq for Secret<N> {}

impl<const N: usize> fmt::Debug for Secret<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret<{N}>(***)")
    }
}
