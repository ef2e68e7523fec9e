// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic fixtures shared between the protocol tests.
use std::collections::HashMap;

use crate::crypto::ed25519::SigningKey;
use crate::crypto::rsa::StaticSigningKey;
use crate::crypto::x25519;
use crate::crypto::{Rng, Secret};
use crate::greet::{GreetStore, GreetingState};
use crate::handler::ProtocolHandler;
use crate::identity::LocalIdentity;

/// RSA modulus size for test identities; small to keep key generation fast.
pub const TEST_KEY_BITS: usize = 1024;

/// Generates one identity per name, all sharing a complete directory of
/// static public keys.
pub fn identities(names: &[&str], rng: &Rng) -> Vec<LocalIdentity> {
    let keys: Vec<StaticSigningKey> = names
        .iter()
        .map(|_| StaticSigningKey::generate(TEST_KEY_BITS, rng).expect("rsa key generation"))
        .collect();
    let directory: HashMap<String, _> = names
        .iter()
        .zip(&keys)
        .map(|(name, key)| (name.to_string(), key.verifying_key()))
        .collect();
    names
        .iter()
        .zip(keys)
        .map(|(name, key)| {
            LocalIdentity::new(*name, key, directory.clone()).expect("valid identity")
        })
        .collect()
}

/// One protocol handler per name, each with its own deterministic generator.
pub fn handlers(names: &[&str], rng: &Rng) -> Vec<ProtocolHandler> {
    identities(names, rng)
        .into_iter()
        .enumerate()
        .map(|(i, identity)| {
            let seed = [i as u8 + 10; 32];
            ProtocolHandler::new(identity, Rng::from_seed(seed))
        })
        .collect()
}

/// A pair of consistent READY stores for "alice" and "bob", with a preset
/// group key, exponents and ephemeral keys, for exercising layers above the
/// key agreement without running one.
pub fn ready_store_pair(rng: &Rng) -> (GreetStore, GreetStore) {
    let members = vec!["alice".to_string(), "bob".to_string()];
    let nonces = vec![
        rng.random_vec(32).expect("randomness"),
        rng.random_vec(32).expect("randomness"),
    ];
    let session_id = crate::greet::aske::compute_session_id(&members, &nonces);

    // A completed two-member CLIQUES chain: each entry carries the other
    // member's exponent, the group key carries both.
    let alice_exponent = x25519::SecretKey::from_bytes(rng.random_array().expect("randomness"));
    let bob_exponent = x25519::SecretKey::from_bytes(rng.random_array().expect("randomness"));
    let int_keys = vec![bob_exponent.public_key(), alice_exponent.public_key()];
    let group_key = alice_exponent.scalar_mult(&bob_exponent.public_key());

    let alice_key = SigningKey::from_bytes(rng.random_array().expect("randomness"));
    let bob_key = SigningKey::from_bytes(rng.random_array().expect("randomness"));
    let pub_keys = vec![alice_key.verifying_key(), bob_key.verifying_key()];

    let store = |own_nonce: &Vec<u8>,
                 own_key: &SigningKey,
                 own_exponent: &x25519::SecretKey| GreetStore {
        state: GreetingState::Ready,
        members: members.clone(),
        session_id: Some(session_id),
        own_nonce: Some(own_nonce.clone()),
        ephemeral_key: Some(own_key.clone()),
        nonces: nonces.clone(),
        ephemeral_pub_keys: pub_keys.clone(),
        group_key: Some(Secret::from_bytes(*group_key.as_bytes())),
        priv_key_list: vec![own_exponent.clone()],
        int_keys: int_keys.clone(),
    };

    (
        store(&nonces[0], &alice_key, &alice_exponent),
        store(&nonces[1], &bob_key, &bob_exponent),
    )
}
