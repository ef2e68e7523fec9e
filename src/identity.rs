// SPDX-License-Identifier: MIT OR Apache-2.0

//! Participant identity material.
use std::collections::HashMap;

use thiserror::Error;

use crate::crypto::rsa::{StaticSigningKey, StaticVerifyingKey};

/// Long-lived identity of the local participant: a stable id, the static
/// signing key, and a directory mapping other participants' ids to their
/// static public keys.
///
/// The identity is owned in one place and borrowed into each protocol
/// operation that signs or verifies session acknowledgements.
#[derive(Debug)]
pub struct LocalIdentity {
    id: String,
    static_key: StaticSigningKey,
    directory: HashMap<String, StaticVerifyingKey>,
}

impl LocalIdentity {
    pub fn new(
        id: impl Into<String>,
        static_key: StaticSigningKey,
        directory: HashMap<String, StaticVerifyingKey>,
    ) -> Result<Self, IdentityError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdentityError::EmptyId);
        }
        Ok(Self {
            id,
            static_key,
            directory,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn static_key(&self) -> &StaticSigningKey {
        &self.static_key
    }

    /// Static public key of another participant, if known.
    pub fn public_key_of(&self, id: &str) -> Option<&StaticVerifyingKey> {
        self.directory.get(id)
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("participant id must not be empty")]
    EmptyId,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::crypto::rsa::StaticSigningKey;
    use crate::crypto::Rng;

    use super::{IdentityError, LocalIdentity};

    #[test]
    fn rejects_empty_id() {
        let rng = Rng::from_seed([1; 32]);
        let static_key = StaticSigningKey::generate(1024, &rng).unwrap();
        assert!(matches!(
            LocalIdentity::new("", static_key, HashMap::new()),
            Err(IdentityError::EmptyId)
        ));
    }

    #[test]
    fn directory_lookup() {
        let rng = Rng::from_seed([1; 32]);
        let alice_key = StaticSigningKey::generate(1024, &rng).unwrap();
        let bob_key = StaticSigningKey::generate(1024, &rng).unwrap();

        let mut directory = HashMap::new();
        directory.insert("bob".to_string(), bob_key.verifying_key());

        let identity = LocalIdentity::new("alice", alice_key, directory).unwrap();
        assert_eq!(identity.id(), "alice");
        assert!(identity.public_key_of("bob").is_some());
        assert!(identity.public_key_of("carol").is_none());
    }
}
