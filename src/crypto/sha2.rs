// SPDX-License-Identifier: MIT OR Apache-2.0

//! SHA2 hashing functions.
use sha2::{Digest, Sha256};

pub const SHA256_DIGEST_SIZE: usize = 32;

/// SHA2-256 hashing function over the concatenation of all message parts.
pub fn sha2_256(messages: &[&[u8]]) -> [u8; SHA256_DIGEST_SIZE] {
    let mut hasher = Sha256::new();
    for message in messages {
        hasher.update(message);
    }
    let result = hasher.finalize();
    result[..].try_into().expect("sha256 digest size")
}

#[cfg(test)]
mod tests {
    use super::sha2_256;

    #[test]
    fn concatenation_is_equivalent() {
        assert_eq!(sha2_256(&[b"foo", b"bar"]), sha2_256(&[b"foobar"]));
        assert_ne!(sha2_256(&[b"foo", b"bar"]), sha2_256(&[b"barfoo"]));
    }
}
