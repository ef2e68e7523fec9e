// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Mutex;

use rand_core::{RngCore, SeedableRng};
use thiserror::Error;

/// Cryptographically-secure random number generator that uses the ChaCha
/// algorithm.
///
/// A single instance is handed by reference into every protocol operation
/// that consumes randomness, so seeding one generator in tests makes a whole
/// engine run deterministic.
#[derive(Debug)]
pub struct Rng {
    rng: Mutex<rand_chacha::ChaCha20Rng>,
}

impl Default for Rng {
    fn default() -> Self {
        Self {
            rng: Mutex::new(rand_chacha::ChaCha20Rng::from_entropy()),
        }
    }
}

#[cfg(any(test, feature = "test_utils"))]
impl Rng {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: Mutex::new(rand_chacha::ChaCha20Rng::from_seed(seed)),
        }
    }
}

impl Rng {
    pub fn random_array<const N: usize>(&self) -> Result<[u8; N], RngError> {
        let mut rng = self.rng.lock().map_err(|_| RngError::LockPoisoned)?;
        let mut out = [0u8; N];
        rng.fill_bytes(&mut out);
        Ok(out)
    }

    pub fn random_vec(&self, len: usize) -> Result<Vec<u8>, RngError> {
        let mut rng = self.rng.lock().map_err(|_| RngError::LockPoisoned)?;
        let mut out = vec![0u8; len];
        rng.fill_bytes(&mut out);
        Ok(out)
    }

    /// Runs `f` with exclusive access to the underlying generator, for
    /// primitives that drive the generator themselves (RSA key generation).
    pub(crate) fn with_rng<T>(
        &self,
        f: impl FnOnce(&mut rand_chacha::ChaCha20Rng) -> T,
    ) -> Result<T, RngError> {
        let mut rng = self.rng.lock().map_err(|_| RngError::LockPoisoned)?;
        Ok(f(&mut rng))
    }
}

#[derive(Debug, Error)]
pub enum RngError {
    #[error("rng lock is poisoned")]
    LockPoisoned,
}
