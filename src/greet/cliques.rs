// SPDX-License-Identifier: MIT OR Apache-2.0

//! CLIQUES tree Diffie–Hellman group key agreement.
//!
//! Every member holds a list of private exponents (one fresh exponent per
//! operation it contributed randomness to). The protocol routes an
//! "intermediate key" vector member to member: the entry for member `i`
//! accumulates the product of everyone's exponents except `i`'s own, and the
//! trailing "cardinal" carries the full product. The cardinal is never
//! broadcast, the group key is exactly that full product: each member
//! recovers it by multiplying its own entry with its own exponents.
use thiserror::Error;

use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::{Rng, RngError};
use crate::greet::Flow;

/// Per-participant state of the CLIQUES protocol.
#[derive(Clone, Debug)]
pub(crate) struct CliquesMember {
    id: String,
    pub(crate) members: Vec<String>,
    pub(crate) priv_key_list: Vec<SecretKey>,
    pub(crate) int_keys: Vec<PublicKey>,
    group_key: Option<PublicKey>,
}

/// CLIQUES sub-message, merged into a greet message on the wire.
#[derive(Clone, Debug)]
pub(crate) struct CliquesMessage {
    pub source: String,
    pub dest: String,
    pub flow: Flow,
    pub members: Vec<String>,
    pub int_keys: Vec<PublicKey>,
}

impl CliquesMember {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            members: Vec::new(),
            priv_key_list: Vec::new(),
            int_keys: Vec::new(),
            group_key: None,
        }
    }

    /// Restores a member mid-session, for auxiliary operations on an
    /// established group.
    pub fn restore(
        id: impl Into<String>,
        members: Vec<String>,
        priv_key_list: Vec<SecretKey>,
        int_keys: Vec<PublicKey>,
        group_key: Option<PublicKey>,
    ) -> Self {
        Self {
            id: id.into(),
            members,
            priv_key_list,
            int_keys,
            group_key,
        }
    }

    pub fn group_key(&self) -> Option<&PublicKey> {
        self.group_key.as_ref()
    }

    /// Starts the initial key agreement towards `others`.
    pub fn ika(&mut self, others: &[String], rng: &Rng) -> Result<CliquesMessage, CliquesError> {
        if others.is_empty() {
            return Err(CliquesError::EmptyMembers);
        }

        let mut members = vec![self.id.clone()];
        members.extend_from_slice(others);
        ensure_distinct(&members)?;

        self.members.clear();
        self.priv_key_list.clear();
        self.int_keys.clear();
        self.group_key = None;

        // Process our own leg of the chain straight away.
        self.upflow(
            CliquesMessage {
                source: self.id.clone(),
                dest: self.id.clone(),
                flow: Flow::Up,
                members,
                int_keys: Vec::new(),
            },
            rng,
        )
    }

    /// Starts an auxiliary key agreement including `new` members: renews the
    /// own exponent and extends the chain through the newcomers.
    pub fn aka_join(&mut self, new: &[String], rng: &Rng) -> Result<CliquesMessage, CliquesError> {
        self.ensure_established()?;
        if new.is_empty() {
            return Err(CliquesError::EmptyMembers);
        }
        let mut members = self.members.clone();
        members.extend_from_slice(new);
        ensure_distinct(&members)?;

        self.renew_priv_key(rng)?;

        // The new cardinal is our own entry multiplied back with all of our
        // own exponents; the old group key never leaves this member.
        let mut int_keys = self.int_keys.clone();
        int_keys.push(self.own_full_product()?);

        Ok(CliquesMessage {
            source: self.id.clone(),
            dest: new[0].clone(),
            flow: Flow::Up,
            members,
            int_keys,
        })
    }

    /// Starts an auxiliary key agreement excluding the given members and
    /// broadcasts the reduced chain under a renewed own exponent.
    pub fn aka_exclude(
        &mut self,
        exclude: &[String],
        rng: &Rng,
    ) -> Result<CliquesMessage, CliquesError> {
        self.ensure_established()?;
        if exclude.is_empty() {
            return Err(CliquesError::EmptyMembers);
        }
        ensure_distinct(exclude)?;
        if exclude.iter().any(|id| id == &self.id) {
            return Err(CliquesError::CannotExcludeSelf);
        }
        for id in exclude {
            if !self.members.contains(id) {
                return Err(CliquesError::NotAMember(id.clone()));
            }
        }

        let keep: Vec<usize> = (0..self.members.len())
            .filter(|&i| !exclude.contains(&self.members[i]))
            .collect();
        self.members = keep.iter().map(|&i| self.members[i].clone()).collect();
        self.int_keys = keep.iter().map(|&i| self.int_keys[i]).collect();

        self.renew_priv_key(rng)?;
        self.derive_group_key()?;

        Ok(CliquesMessage {
            source: self.id.clone(),
            dest: String::new(),
            flow: Flow::Down,
            members: self.members.clone(),
            int_keys: self.int_keys.clone(),
        })
    }

    /// Renews the own exponent and broadcasts the refreshed chain.
    pub fn aka_refresh(&mut self, rng: &Rng) -> Result<CliquesMessage, CliquesError> {
        self.ensure_established()?;
        self.renew_priv_key(rng)?;
        self.derive_group_key()?;

        Ok(CliquesMessage {
            source: self.id.clone(),
            dest: String::new(),
            flow: Flow::Down,
            members: self.members.clone(),
            int_keys: self.int_keys.clone(),
        })
    }

    /// Destroys the own secret exponents and the derived group key.
    pub fn aka_quit(&mut self) {
        self.priv_key_list.clear();
        self.group_key = None;
    }

    /// Processes an upflow: contribute a fresh exponent, extend the chain
    /// and pass it on, or broadcast the downflow when the chain is complete.
    pub fn upflow(
        &mut self,
        message: CliquesMessage,
        rng: &Rng,
    ) -> Result<CliquesMessage, CliquesError> {
        ensure_distinct(&message.members)?;
        let position = message
            .members
            .iter()
            .position(|id| id == &self.id)
            .ok_or_else(|| CliquesError::NotAMember(self.id.clone()))?;

        let mut int_keys = message.int_keys;
        if int_keys.is_empty() {
            int_keys.push(PublicKey::generator());
        }
        if int_keys.len() != position + 1 {
            return Err(CliquesError::UnexpectedChainLength {
                expected: position + 1,
                actual: int_keys.len(),
            });
        }

        self.members = message.members;

        let own_key = SecretKey::from_bytes(rng.random_array()?);

        // Every entry before ours picks up the new exponent; the previous
        // cardinal becomes our entry and its multiple the new cardinal.
        let cardinal = int_keys[position];
        for key in int_keys.iter_mut().take(position) {
            *key = own_key.scalar_mult(key);
        }
        int_keys.push(own_key.scalar_mult(&cardinal));
        self.priv_key_list.push(own_key);

        if position + 1 == self.members.len() {
            // Chain complete: the cardinal is the group key and stays here.
            let group_key = int_keys.pop().expect("chain has at least one entry");
            self.int_keys = int_keys;
            self.group_key = Some(group_key);
            Ok(CliquesMessage {
                source: self.id.clone(),
                dest: String::new(),
                flow: Flow::Down,
                members: self.members.clone(),
                int_keys: self.int_keys.clone(),
            })
        } else {
            self.int_keys = int_keys;
            Ok(CliquesMessage {
                source: self.id.clone(),
                dest: self.members[position + 1].clone(),
                flow: Flow::Up,
                members: self.members.clone(),
                int_keys: self.int_keys.clone(),
            })
        }
    }

    /// Processes a downflow broadcast: adopt the completed chain and derive
    /// the group key from the own entry.
    pub fn downflow(&mut self, message: CliquesMessage) -> Result<(), CliquesError> {
        ensure_distinct(&message.members)?;
        if !message.members.contains(&self.id) {
            return Err(CliquesError::NotAMember(self.id.clone()));
        }
        if message.int_keys.len() != message.members.len() {
            return Err(CliquesError::UnexpectedChainLength {
                expected: message.members.len(),
                actual: message.int_keys.len(),
            });
        }

        self.members = message.members;
        self.int_keys = message.int_keys;
        self.derive_group_key()
    }

    /// Adds a fresh exponent and folds it into every other member's entry.
    fn renew_priv_key(&mut self, rng: &Rng) -> Result<(), CliquesError> {
        let position = self.own_position()?;
        let own_key = SecretKey::from_bytes(rng.random_array()?);
        for (i, key) in self.int_keys.iter_mut().enumerate() {
            if i != position {
                *key = own_key.scalar_mult(key);
            }
        }
        self.priv_key_list.push(own_key);
        Ok(())
    }

    fn derive_group_key(&mut self) -> Result<(), CliquesError> {
        self.group_key = Some(self.own_full_product()?);
        Ok(())
    }

    /// The own entry multiplied with every own exponent, most recent first.
    fn own_full_product(&self) -> Result<PublicKey, CliquesError> {
        let position = self.own_position()?;
        let mut key = self.int_keys[position];
        for secret in self.priv_key_list.iter().rev() {
            key = secret.scalar_mult(&key);
        }
        Ok(key)
    }

    fn own_position(&self) -> Result<usize, CliquesError> {
        self.members
            .iter()
            .position(|id| id == &self.id)
            .ok_or_else(|| CliquesError::NotAMember(self.id.clone()))
    }

    fn ensure_established(&self) -> Result<(), CliquesError> {
        if self.int_keys.is_empty() || self.int_keys.len() != self.members.len() {
            return Err(CliquesError::NoEstablishedSession);
        }
        Ok(())
    }
}

fn ensure_distinct(members: &[String]) -> Result<(), CliquesError> {
    for (i, member) in members.iter().enumerate() {
        if members[..i].contains(member) {
            return Err(CliquesError::DuplicateMember(member.clone()));
        }
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum CliquesError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error("member list must not be empty")]
    EmptyMembers,

    #[error("duplicate member {0} in list")]
    DuplicateMember(String),

    #[error("{0} is not in the member list")]
    NotAMember(String),

    #[error("cannot exclude self, quit instead")]
    CannotExcludeSelf,

    #[error("intermediate key chain has {actual} entries, expected {expected}")]
    UnexpectedChainLength { expected: usize, actual: usize },

    #[error("no established session for auxiliary operation")]
    NoEstablishedSession,
}
