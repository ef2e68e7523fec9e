// SPDX-License-Identifier: MIT OR Apache-2.0

//! Authenticated Signature Key Exchange (ASKE).
//!
//! Each member contributes a fresh nonce and an ephemeral Ed25519 signing
//! key in an upflow along the member list. The last member computes the
//! session id binding the member set to their nonces and opens the
//! acknowledgement round: every member broadcasts an RSA signature under its
//! static identity key over its own ephemeral key and the session id. A
//! session is acknowledged once every member's signature verified.
use std::collections::HashSet;

use thiserror::Error;

use crate::crypto::ed25519::{SigningKey, VerifyingKey};
use crate::crypto::rsa::StaticKeyError;
use crate::crypto::sha2::sha2_256;
use crate::crypto::{Rng, RngError};
use crate::greet::Flow;
use crate::identity::LocalIdentity;

pub(crate) const NONCE_SIZE: usize = 32;

/// Per-participant state of the ASKE protocol.
#[derive(Clone, Debug)]
pub(crate) struct AskeMember {
    id: String,
    pub(crate) members: Vec<String>,
    nonce: Option<Vec<u8>>,
    ephemeral_key: Option<SigningKey>,
    pub(crate) nonces: Vec<Vec<u8>>,
    pub(crate) ephemeral_pub_keys: Vec<VerifyingKey>,
    session_id: Option<[u8; 32]>,
    authenticated_members: HashSet<String>,
}

/// ASKE sub-message, merged into a greet message on the wire.
#[derive(Clone, Debug)]
pub(crate) struct AskeMessage {
    pub source: String,
    pub dest: String,
    pub flow: Flow,
    pub members: Vec<String>,
    pub nonces: Vec<Vec<u8>>,
    pub pub_keys: Vec<VerifyingKey>,
    pub session_signature: Option<Vec<u8>>,
}

impl AskeMember {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            members: Vec::new(),
            nonce: None,
            ephemeral_key: None,
            nonces: Vec::new(),
            ephemeral_pub_keys: Vec::new(),
            session_id: None,
            authenticated_members: HashSet::new(),
        }
    }

    /// Restores a member of an acknowledged session, for auxiliary
    /// operations.
    pub fn restore(
        id: impl Into<String>,
        members: Vec<String>,
        nonce: Option<Vec<u8>>,
        ephemeral_key: Option<SigningKey>,
        nonces: Vec<Vec<u8>>,
        ephemeral_pub_keys: Vec<VerifyingKey>,
        session_id: Option<[u8; 32]>,
    ) -> Self {
        // A restored session was fully acknowledged when it completed.
        let authenticated_members = members.iter().cloned().collect();
        Self {
            id: id.into(),
            members,
            nonce,
            ephemeral_key,
            nonces,
            ephemeral_pub_keys,
            session_id,
            authenticated_members,
        }
    }

    pub fn session_id(&self) -> Option<&[u8; 32]> {
        self.session_id.as_ref()
    }

    pub fn own_nonce(&self) -> Option<&Vec<u8>> {
        self.nonce.as_ref()
    }

    pub fn ephemeral_key(&self) -> Option<&SigningKey> {
        self.ephemeral_key.as_ref()
    }

    /// Ephemeral public key of a member, once known.
    pub fn ephemeral_pub_key(&self, member: &str) -> Option<&VerifyingKey> {
        let position = self.members.iter().position(|id| id == member)?;
        self.ephemeral_pub_keys.get(position)
    }

    /// True once every member's session signature verified.
    pub fn is_session_acknowledged(&self) -> bool {
        !self.members.is_empty()
            && self
                .members
                .iter()
                .all(|member| self.authenticated_members.contains(member))
    }

    /// Members whose acknowledgement is still outstanding.
    pub fn yet_to_authenticate(&self) -> Vec<&String> {
        self.members
            .iter()
            .filter(|member| !self.authenticated_members.contains(*member))
            .collect()
    }

    /// Starts the initial exchange towards `others`.
    pub fn commit(
        &mut self,
        others: &[String],
        identity: &LocalIdentity,
        rng: &Rng,
    ) -> Result<AskeMessage, AskeError> {
        if others.is_empty() {
            return Err(AskeError::EmptyMembers);
        }
        let mut members = vec![self.id.clone()];
        members.extend_from_slice(others);

        self.nonce = None;
        self.ephemeral_key = None;
        self.session_id = None;
        self.authenticated_members.clear();

        self.upflow(
            AskeMessage {
                source: self.id.clone(),
                dest: self.id.clone(),
                flow: Flow::Up,
                members,
                nonces: Vec::new(),
                pub_keys: Vec::new(),
                session_signature: None,
            },
            identity,
            rng,
        )
    }

    /// Extends the member list by `new` members and re-opens the exchange
    /// through them; kept members keep their nonces and ephemeral keys.
    pub fn join(&mut self, new: &[String]) -> Result<AskeMessage, AskeError> {
        if new.is_empty() {
            return Err(AskeError::EmptyMembers);
        }
        if self.session_id.is_none() {
            return Err(AskeError::NoEstablishedSession);
        }
        let mut members = self.members.clone();
        members.extend_from_slice(new);
        ensure_distinct(&members)?;

        self.members = members.clone();
        self.session_id = None;
        self.authenticated_members.clear();

        Ok(AskeMessage {
            source: self.id.clone(),
            dest: new[0].clone(),
            flow: Flow::Up,
            members,
            nonces: self.nonces.clone(),
            pub_keys: self.ephemeral_pub_keys.clone(),
            session_signature: None,
        })
    }

    /// Removes members, recomputes the session id over the kept nonces and
    /// opens a fresh acknowledgement round with the own signature.
    pub fn exclude(
        &mut self,
        exclude: &[String],
        identity: &LocalIdentity,
        rng: &Rng,
    ) -> Result<AskeMessage, AskeError> {
        if exclude.is_empty() {
            return Err(AskeError::EmptyMembers);
        }
        if self.session_id.is_none() {
            return Err(AskeError::NoEstablishedSession);
        }
        if exclude.iter().any(|id| id == &self.id) {
            return Err(AskeError::CannotExcludeSelf);
        }
        for id in exclude {
            if !self.members.contains(id) {
                return Err(AskeError::UnknownMember(id.clone()));
            }
        }

        let keep: Vec<usize> = (0..self.members.len())
            .filter(|&i| !exclude.contains(&self.members[i]))
            .collect();
        self.members = keep.iter().map(|&i| self.members[i].clone()).collect();
        self.nonces = keep.iter().map(|&i| self.nonces[i].clone()).collect();
        self.ephemeral_pub_keys = keep
            .iter()
            .map(|&i| self.ephemeral_pub_keys[i])
            .collect();

        let session_id = compute_session_id(&self.members, &self.nonces);
        self.session_id = Some(session_id);
        self.authenticated_members.clear();

        let session_signature = self.sign_session(identity, rng)?;
        self.authenticated_members.insert(self.id.clone());

        Ok(AskeMessage {
            source: self.id.clone(),
            dest: String::new(),
            flow: Flow::Down,
            members: self.members.clone(),
            nonces: self.nonces.clone(),
            pub_keys: self.ephemeral_pub_keys.clone(),
            session_signature: Some(session_signature),
        })
    }

    /// Discards all session state and hands out the ephemeral private key
    /// for publication, so past signatures stay auditable.
    pub fn quit(&mut self) -> Result<SigningKey, AskeError> {
        let ephemeral_key = self.ephemeral_key.take().ok_or(AskeError::NotParticipating)?;
        self.members.clear();
        self.nonce = None;
        self.nonces.clear();
        self.ephemeral_pub_keys.clear();
        self.session_id = None;
        self.authenticated_members.clear();
        Ok(ephemeral_key)
    }

    /// Processes an upflow: contribute nonce and ephemeral key, pass the
    /// chain on, or compute the session id and open the acknowledgement
    /// round when last.
    pub fn upflow(
        &mut self,
        message: AskeMessage,
        identity: &LocalIdentity,
        rng: &Rng,
    ) -> Result<AskeMessage, AskeError> {
        ensure_distinct(&message.members)?;
        let position = message
            .members
            .iter()
            .position(|id| id == &self.id)
            .ok_or_else(|| AskeError::UnknownMember(self.id.clone()))?;
        if message.nonces.len() != position || message.pub_keys.len() != position {
            return Err(AskeError::UnexpectedChainLength {
                expected: position,
                actual: message.nonces.len(),
            });
        }

        self.members = message.members;
        let mut nonces = message.nonces;
        let mut pub_keys = message.pub_keys;

        let nonce = rng.random_vec(NONCE_SIZE)?;
        let ephemeral_key = SigningKey::from_bytes(rng.random_array()?);
        nonces.push(nonce.clone());
        pub_keys.push(ephemeral_key.verifying_key());
        self.nonce = Some(nonce);
        self.ephemeral_key = Some(ephemeral_key);
        self.nonces = nonces;
        self.ephemeral_pub_keys = pub_keys;

        if self.nonces.len() == self.members.len() {
            let session_id = compute_session_id(&self.members, &self.nonces);
            self.session_id = Some(session_id);

            let session_signature = self.sign_session(identity, rng)?;
            self.authenticated_members.insert(self.id.clone());

            Ok(AskeMessage {
                source: self.id.clone(),
                dest: String::new(),
                flow: Flow::Down,
                members: self.members.clone(),
                nonces: self.nonces.clone(),
                pub_keys: self.ephemeral_pub_keys.clone(),
                session_signature: Some(session_signature),
            })
        } else {
            let next = self.members[self.nonces.len()].clone();
            Ok(AskeMessage {
                source: self.id.clone(),
                dest: next,
                flow: Flow::Up,
                members: self.members.clone(),
                nonces: self.nonces.clone(),
                pub_keys: self.ephemeral_pub_keys.clone(),
                session_signature: None,
            })
        }
    }

    /// Processes a downflow: verify the sender's acknowledgement and, if we
    /// have not acknowledged ourselves yet, broadcast our own.
    pub fn downflow(
        &mut self,
        message: AskeMessage,
        identity: &LocalIdentity,
        rng: &Rng,
    ) -> Result<Option<AskeMessage>, AskeError> {
        ensure_distinct(&message.members)?;
        if !message.members.contains(&self.id) {
            return Err(AskeError::UnknownMember(self.id.clone()));
        }

        let session_signature = message
            .session_signature
            .as_ref()
            .ok_or(AskeError::MissingSessionSignature)?;

        // The first downflow of the round carries the complete nonce and key
        // lists; acknowledgement-only downflows carry neither. Stage the new
        // state and verify before committing any of it.
        let initial = !message.nonces.is_empty();
        let (members, nonces, pub_keys, session_id) = if message.nonces.is_empty() {
            if self.session_id.is_none() {
                return Err(AskeError::NoEstablishedSession);
            }
            (
                self.members.clone(),
                self.nonces.clone(),
                self.ephemeral_pub_keys.clone(),
                self.session_id.expect("session id set"),
            )
        } else {
            if message.nonces.len() != message.members.len()
                || message.pub_keys.len() != message.members.len()
            {
                return Err(AskeError::UnexpectedChainLength {
                    expected: message.members.len(),
                    actual: message.nonces.len(),
                });
            }
            let position = message
                .members
                .iter()
                .position(|id| id == &self.id)
                .expect("membership checked above");
            if Some(&message.nonces[position]) != self.nonce.as_ref() {
                return Err(AskeError::OwnNonceMismatch);
            }
            let own_pub_key = self
                .ephemeral_key
                .as_ref()
                .map(SigningKey::verifying_key)
                .ok_or(AskeError::NotParticipating)?;
            if message.pub_keys[position] != own_pub_key {
                return Err(AskeError::OwnKeyMismatch);
            }
            let session_id = compute_session_id(&message.members, &message.nonces);
            (
                message.members.clone(),
                message.nonces.clone(),
                message.pub_keys.clone(),
                session_id,
            )
        };

        // Verify the sender's static signature over its ephemeral key and
        // the session id before admitting either into our state.
        let sender_position = members
            .iter()
            .position(|id| id == &message.source)
            .ok_or_else(|| AskeError::UnknownMember(message.source.clone()))?;
        let sender_static = identity
            .public_key_of(&message.source)
            .ok_or_else(|| AskeError::MissingStaticKey(message.source.clone()))?;
        let content =
            session_signature_content(&message.source, &pub_keys[sender_position], &session_id);
        sender_static
            .verify(&content, session_signature)
            .map_err(|_| AskeError::BadSessionSignature(message.source.clone()))?;

        self.members = members;
        self.nonces = nonces;
        self.ephemeral_pub_keys = pub_keys;
        self.session_id = Some(session_id);
        if initial {
            // A new acknowledgement round opens; earlier acknowledgements
            // were for the previous session id.
            self.authenticated_members.clear();
        }
        self.authenticated_members.insert(message.source.clone());

        if self.authenticated_members.contains(&self.id) {
            // Our acknowledgement is already out; consume silently.
            return Ok(None);
        }

        let session_signature = self.sign_session(identity, rng)?;
        self.authenticated_members.insert(self.id.clone());

        Ok(Some(AskeMessage {
            source: self.id.clone(),
            dest: String::new(),
            flow: Flow::Down,
            members: self.members.clone(),
            nonces: Vec::new(),
            pub_keys: Vec::new(),
            session_signature: Some(session_signature),
        }))
    }

    fn sign_session(&self, identity: &LocalIdentity, rng: &Rng) -> Result<Vec<u8>, AskeError> {
        let session_id = self.session_id.as_ref().ok_or(AskeError::NoEstablishedSession)?;
        let pub_key = self
            .ephemeral_key
            .as_ref()
            .map(SigningKey::verifying_key)
            .ok_or(AskeError::NotParticipating)?;
        let content = session_signature_content(&self.id, &pub_key, session_id);
        Ok(identity.static_key().sign(&content, rng)?)
    }
}

/// Session id: SHA-256 over the member ids sorted ascending, followed by the
/// nonces in that same order. Joint permutations of members and nonces leave
/// it unchanged.
pub(crate) fn compute_session_id(members: &[String], nonces: &[Vec<u8>]) -> [u8; 32] {
    let mut order: Vec<usize> = (0..members.len()).collect();
    order.sort_by(|&a, &b| members[a].cmp(&members[b]));

    let mut parts: Vec<&[u8]> = Vec::with_capacity(members.len() * 2);
    for &i in &order {
        parts.push(members[i].as_bytes());
    }
    for &i in &order {
        parts.push(&nonces[i]);
    }
    sha2_256(&parts)
}

/// The byte string a session signature is computed over.
fn session_signature_content(id: &str, pub_key: &VerifyingKey, session_id: &[u8; 32]) -> Vec<u8> {
    let mut content = Vec::with_capacity(id.len() + 32 + 32);
    content.extend_from_slice(id.as_bytes());
    content.extend_from_slice(pub_key.as_bytes());
    content.extend_from_slice(session_id);
    content
}

fn ensure_distinct(members: &[String]) -> Result<(), AskeError> {
    for (i, member) in members.iter().enumerate() {
        if members[..i].contains(member) {
            return Err(AskeError::DuplicateMember(member.clone()));
        }
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum AskeError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    StaticKey(#[from] StaticKeyError),

    #[error("member list must not be empty")]
    EmptyMembers,

    #[error("duplicate member {0} in list")]
    DuplicateMember(String),

    #[error("{0} is not in the member list")]
    UnknownMember(String),

    #[error("cannot exclude self, quit instead")]
    CannotExcludeSelf,

    #[error("nonce chain has {actual} entries, expected {expected}")]
    UnexpectedChainLength { expected: usize, actual: usize },

    #[error("downflow does not carry back our own nonce")]
    OwnNonceMismatch,

    #[error("downflow does not carry back our own ephemeral key")]
    OwnKeyMismatch,

    #[error("downflow carries no session signature")]
    MissingSessionSignature,

    #[error("no static public key on record for {0}")]
    MissingStaticKey(String),

    #[error("session signature of {0} does not verify")]
    BadSessionSignature(String),

    #[error("no established session for auxiliary operation")]
    NoEstablishedSession,

    #[error("not participating in a session")]
    NotParticipating,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::crypto::rsa::StaticSigningKey;
    use crate::crypto::Rng;
    use crate::greet::Flow;
    use crate::identity::LocalIdentity;

    use super::{compute_session_id, AskeError, AskeMember, AskeMessage};

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn identities(names: &[&str], rng: &Rng) -> Vec<LocalIdentity> {
        let keys: Vec<StaticSigningKey> = names
            .iter()
            .map(|_| StaticSigningKey::generate(1024, rng).unwrap())
            .collect();
        let directory: HashMap<String, _> = names
            .iter()
            .zip(&keys)
            .map(|(name, key)| (name.to_string(), key.verifying_key()))
            .collect();
        names
            .iter()
            .zip(keys)
            .map(|(name, key)| LocalIdentity::new(*name, key, directory.clone()).unwrap())
            .collect()
    }

    /// Runs commit, the upflow chain and the full acknowledgement round.
    fn run_exchange(members: &mut [AskeMember], identities: &[LocalIdentity], rng: &Rng) {
        let others: Vec<String> = identities[1..]
            .iter()
            .map(|identity| identity.id().to_string())
            .collect();
        let mut message = members[0].commit(&others, &identities[0], rng).unwrap();
        for (member, identity) in members.iter_mut().zip(identities).skip(1) {
            assert_eq!(message.flow, Flow::Up);
            message = member.upflow(message, identity, rng).unwrap();
        }
        assert_eq!(message.flow, Flow::Down);

        // Everyone processes the initial downflow and every acknowledgement
        // that follows.
        let mut broadcasts = vec![message];
        let mut next_round = Vec::new();
        while !broadcasts.is_empty() {
            for broadcast in broadcasts.drain(..) {
                for (member, identity) in members.iter_mut().zip(identities) {
                    if identity.id() == broadcast.source {
                        continue;
                    }
                    if let Some(reply) =
                        member.downflow(broadcast.clone(), identity, rng).unwrap()
                    {
                        next_round.push(reply);
                    }
                }
            }
            broadcasts.append(&mut next_round);
        }
    }

    #[test]
    fn three_member_exchange_acknowledges() {
        let rng = Rng::from_seed([1; 32]);
        let identities = identities(&["1", "2", "3"], &rng);
        let mut members: Vec<AskeMember> = identities
            .iter()
            .map(|identity| AskeMember::new(identity.id()))
            .collect();

        run_exchange(&mut members, &identities, &rng);

        let session_id = *members[0].session_id().unwrap();
        for member in &members {
            assert!(member.is_session_acknowledged());
            assert!(member.yet_to_authenticate().is_empty());
            assert_eq!(member.session_id().unwrap(), &session_id);
            assert_eq!(member.members, ids(&["1", "2", "3"]));
            assert_eq!(member.nonces.len(), 3);
            assert_eq!(member.ephemeral_pub_keys.len(), 3);
        }
    }

    #[test]
    fn session_id_ignores_joint_permutation() {
        let rng = Rng::from_seed([2; 32]);
        let members = ids(&["1", "2", "3"]);
        let nonces: Vec<Vec<u8>> = (0..3).map(|_| rng.random_vec(32).unwrap()).collect();

        let permuted_members = ids(&["3", "1", "2"]);
        let permuted_nonces = vec![nonces[2].clone(), nonces[0].clone(), nonces[1].clone()];

        assert_eq!(
            compute_session_id(&members, &nonces),
            compute_session_id(&permuted_members, &permuted_nonces)
        );

        // Re-assigning nonces to different members changes the id.
        let swapped = vec![nonces[1].clone(), nonces[0].clone(), nonces[2].clone()];
        assert_ne!(
            compute_session_id(&members, &nonces),
            compute_session_id(&members, &swapped)
        );
    }

    #[test]
    fn forged_acknowledgement_is_rejected() {
        let rng = Rng::from_seed([3; 32]);
        let identities = identities(&["1", "2"], &rng);
        let mut members: Vec<AskeMember> = identities
            .iter()
            .map(|identity| AskeMember::new(identity.id()))
            .collect();

        let message = members[0]
            .commit(&ids(&["2"]), &identities[0], &rng)
            .unwrap();
        let mut broadcast = members[1].upflow(message, &identities[1], &rng).unwrap();

        // Flip a byte of the session signature.
        if let Some(signature) = broadcast.session_signature.as_mut() {
            signature[0] ^= 0xff;
        }
        assert!(matches!(
            members[0].downflow(broadcast, &identities[0], &rng),
            Err(AskeError::BadSessionSignature(source)) if source == "2"
        ));
        assert!(!members[0].is_session_acknowledged());
    }

    #[test]
    fn quit_hands_out_the_ephemeral_key() {
        let rng = Rng::from_seed([4; 32]);
        let identities = identities(&["1", "2"], &rng);
        let mut members: Vec<AskeMember> = identities
            .iter()
            .map(|identity| AskeMember::new(identity.id()))
            .collect();
        run_exchange(&mut members, &identities, &rng);

        let pub_key = members[0].ephemeral_pub_key("1").copied().unwrap();
        let signing_key = members[0].quit().unwrap();
        assert_eq!(signing_key.verifying_key(), pub_key);
        assert!(members[0].session_id().is_none());
        assert!(matches!(
            members[0].quit(),
            Err(AskeError::NotParticipating)
        ));
    }

    #[test]
    fn commit_rejects_empty_members() {
        let rng = Rng::from_seed([5; 32]);
        let identities = identities(&["1"], &rng);
        let mut member = AskeMember::new("1");
        assert!(matches!(
            member.commit(&[], &identities[0], &rng),
            Err(AskeError::EmptyMembers)
        ));
    }

    #[test]
    fn upflow_rejects_duplicates() {
        let rng = Rng::from_seed([6; 32]);
        let identities = identities(&["1", "2"], &rng);
        let mut member = AskeMember::new("2");
        let message = AskeMessage {
            source: "1".to_string(),
            dest: "2".to_string(),
            flow: Flow::Up,
            members: ids(&["1", "2", "2"]),
            nonces: Vec::new(),
            pub_keys: Vec::new(),
            session_signature: None,
        };
        assert!(matches!(
            member.upflow(message, &identities[1], &rng),
            Err(AskeError::DuplicateMember(_))
        ));
    }
}
