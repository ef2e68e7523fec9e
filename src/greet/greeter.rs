// SPDX-License-Identifier: MIT OR Apache-2.0

//! The greeter: long-lived owner of the last completed session and
//! dispatcher for membership operations.
//!
//! Between operations only the immutable [`GreetStore`] survives. When the
//! local participant proposes an operation the greeter keeps the prepared
//! greeting aside until the proposal's echo returns from the broadcast
//! channel (matched by packet hash); inbound proposals from other members
//! spawn a fresh greeting on top of the store.
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::crypto::ed25519::{SigningKey, VerifyingKey};
use crate::crypto::sha2::sha2_256;
use crate::crypto::x25519;
use crate::crypto::{Rng, Secret};
use crate::greet::greeting::{Greeting, GreetingError, GreetingState};
use crate::greet::message::{GreetMessage, GreetMessageError, GreetingMetadata};
use crate::identity::LocalIdentity;

/// Immutable snapshot of a completed session.
///
/// Replaced atomically whenever an operation reaches READY; a host may
/// persist it between runs (the engine prescribes no format).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GreetStore {
    pub(crate) state: GreetingState,
    pub(crate) members: Vec<String>,
    pub(crate) session_id: Option<[u8; 32]>,
    pub(crate) own_nonce: Option<Vec<u8>>,
    pub(crate) ephemeral_key: Option<SigningKey>,
    pub(crate) nonces: Vec<Vec<u8>>,
    pub(crate) ephemeral_pub_keys: Vec<VerifyingKey>,
    pub(crate) group_key: Option<Secret<32>>,
    pub(crate) priv_key_list: Vec<x25519::SecretKey>,
    pub(crate) int_keys: Vec<x25519::PublicKey>,
}

impl GreetStore {
    /// An empty store: no session yet.
    pub fn new() -> Self {
        Self {
            state: GreetingState::Null,
            members: Vec::new(),
            session_id: None,
            own_nonce: None,
            ephemeral_key: None,
            nonces: Vec::new(),
            ephemeral_pub_keys: Vec::new(),
            group_key: None,
            priv_key_list: Vec::new(),
            int_keys: Vec::new(),
        }
    }

    pub fn state(&self) -> GreetingState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == GreetingState::Ready
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn session_id(&self) -> Option<&[u8; 32]> {
        self.session_id.as_ref()
    }

    pub(crate) fn group_key(&self) -> Option<&Secret<32>> {
        self.group_key.as_ref()
    }

    pub(crate) fn ephemeral_key(&self) -> Option<&SigningKey> {
        self.ephemeral_key.as_ref()
    }

    /// Ephemeral public key of a session member.
    pub fn ephemeral_pub_key(&self, member: &str) -> Option<&VerifyingKey> {
        let position = self.members.iter().position(|id| id == member)?;
        self.ephemeral_pub_keys.get(position)
    }

    /// The group key as a curve element, for restoring the CLIQUES chain.
    pub(crate) fn group_element(&self) -> Option<x25519::PublicKey> {
        self.group_key
            .as_ref()
            .map(|key| x25519::PublicKey::from_bytes(*key.expose()))
    }

    fn quit() -> Self {
        Self {
            state: GreetingState::Quit,
            ..Self::new()
        }
    }
}

impl Default for GreetStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded inbound greet packet together with its transcript identifiers.
#[derive(Debug)]
pub struct DecodedGreet {
    pub message: GreetMessage,
    /// SHA-256 of the raw payload, matched against proposals.
    pub packet_hash: [u8; 32],
    /// Transcript packet id binding sender, channel members and payload.
    pub packet_id: [u8; 32],
}

/// Outcome of driving the current greeting with one inbound message.
#[derive(Debug)]
pub struct GreeterOutput {
    /// Signed payload to send, with its in-protocol destination ("" means
    /// broadcast).
    pub outbound: Option<(String, Vec<u8>)>,
    /// State of the operation after the step.
    pub state: GreetingState,
}

/// Owns the long-lived identity, the last completed session store, at most
/// one locally proposed greeting awaiting its echo, and the greeting
/// currently in progress.
#[derive(Debug)]
pub struct Greeter {
    identity: LocalIdentity,
    store: GreetStore,
    proposed: Option<Proposed>,
    current: Option<Greeting>,
}

#[derive(Debug)]
struct Proposed {
    greeting: Greeting,
    proposal_hash: [u8; 32],
}

impl Greeter {
    pub fn new(identity: LocalIdentity) -> Self {
        Self {
            identity,
            store: GreetStore::new(),
            proposed: None,
            current: None,
        }
    }

    /// A greeter resuming from a persisted session store.
    pub fn from_store(identity: LocalIdentity, store: GreetStore) -> Self {
        Self {
            identity,
            store,
            proposed: None,
            current: None,
        }
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn store(&self) -> &GreetStore {
        &self.store
    }

    /// State of the operation in progress (live or still awaiting its
    /// proposal echo), or of the store when idle.
    pub fn state(&self) -> GreetingState {
        self.current
            .as_ref()
            .map(Greeting::state)
            .or_else(|| self.proposed.as_ref().map(|p| p.greeting.state()))
            .unwrap_or_else(|| self.store.state())
    }

    /// Proposes a membership operation by diffing the current members
    /// against `new_members`, returning the signed initial packet.
    ///
    /// Exactly one of include, exclude or refresh results; mixing includes
    /// and excludes in one call is rejected. Without an established session
    /// the diff must be a pure start.
    pub fn encode(
        &mut self,
        new_members: &[String],
        metadata: Option<GreetingMetadata>,
        rng: &Rng,
    ) -> Result<(String, Vec<u8>), GreeterError> {
        let prev_members = self.store.members().to_vec();
        let own_id = self.identity.id().to_string();

        let include: Vec<String> = new_members
            .iter()
            .filter(|id| !prev_members.contains(id) && id.as_str() != own_id)
            .cloned()
            .collect();
        let exclude: Vec<String> = prev_members
            .iter()
            .filter(|id| !new_members.contains(id))
            .cloned()
            .collect();

        let mut greeting = Greeting::new(own_id, &self.store);
        if let Some(metadata) = metadata {
            greeting.set_metadata(metadata);
        }

        let mut message = if !self.store.is_ready() {
            if !exclude.is_empty() {
                return Err(GreeterError::NoSession);
            }
            greeting.start(&include, &self.identity, rng)?
        } else {
            match (include.is_empty(), exclude.is_empty()) {
                (false, false) => return Err(GreeterError::MixedOperation),
                (false, true) => greeting.include(&include, rng)?,
                (true, false) => greeting.exclude(&exclude, &self.identity, rng)?,
                (true, true) => greeting.refresh(rng)?,
            }
        };

        let payload = greeting.sign(&mut message)?;

        // A refresh completes locally in one step; everything else waits for
        // the proposal to echo back from the channel.
        if greeting.state() == GreetingState::Ready {
            self.store = greeting.new_store()?;
        }
        if greeting.state() == GreetingState::Quit {
            self.store = GreetStore::quit();
        }
        self.proposed = Some(Proposed {
            greeting,
            proposal_hash: sha2_256(&[&payload]),
        });

        Ok((message.dest, payload))
    }

    /// Leaves the session immediately, returning the signed QUIT packet.
    pub fn quit(&mut self) -> Result<Vec<u8>, GreeterError> {
        let mut greeting = Greeting::new(self.identity.id(), &self.store);
        let (_message, payload) = greeting.quit()?;
        self.store = GreetStore::quit();
        self.proposed = None;
        self.current = None;
        Ok(payload)
    }

    /// Decodes an inbound greet payload and binds it to a greeting: the echo
    /// of our own proposal revives the prepared greeting, a foreign initial
    /// packet spawns a fresh one, anything else goes to the greeting already
    /// in progress.
    pub fn decode(
        &mut self,
        payload: &[u8],
        from: &str,
        channel_members: &[String],
    ) -> Result<DecodedGreet, GreeterError> {
        let packet_hash = sha2_256(&[payload]);
        let packet_id = packet_id(from, channel_members, payload);
        let message = GreetMessage::decode(payload)?;

        if let Some(proposed) = self.proposed.take() {
            if proposed.proposal_hash == packet_hash {
                debug!(source = from, "proposal echo observed, activating greeting");
                self.current = Some(proposed.greeting);
                return Ok(DecodedGreet {
                    message,
                    packet_hash,
                    packet_id,
                });
            }
            self.proposed = Some(proposed);
        }

        if self.current.is_none() {
            if from == self.identity.id() {
                return Err(GreeterError::StaleOwnPacket);
            }
            debug!(source = from, "inbound operation, creating greeting");
            self.current = Some(Greeting::new(self.identity.id(), &self.store));
        }

        Ok(DecodedGreet {
            message,
            packet_hash,
            packet_id,
        })
    }

    /// Drives the current greeting with a decoded message; finalizes the
    /// operation when it reaches READY or QUIT.
    pub fn process(
        &mut self,
        decoded: &DecodedGreet,
        rng: &Rng,
    ) -> Result<GreeterOutput, GreeterError> {
        let greeting = self.current.as_mut().ok_or(GreeterError::NoGreeting)?;

        let outbound = greeting.process_message(&decoded.message, &self.identity, rng)?;
        let outbound = match outbound {
            Some(mut message) => {
                let payload = greeting.sign(&mut message)?;
                Some((message.dest, payload))
            }
            None => None,
        };

        let state = greeting.state();
        match state {
            GreetingState::Ready => {
                self.store = greeting.new_store()?;
                self.current = None;
            }
            GreetingState::Quit => {
                self.store = GreetStore::quit();
                self.current = None;
            }
            _ => {}
        }

        Ok(GreeterOutput { outbound, state })
    }
}

/// Transcript packet id: the sender, the other channel members and the
/// payload, delimited the same way on every implementation.
fn packet_id(sender: &str, channel_members: &[String], payload: &[u8]) -> [u8; 32] {
    let others: Vec<&str> = channel_members
        .iter()
        .map(String::as_str)
        .filter(|id| *id != sender)
        .collect();
    let others = others.join("\n");
    sha2_256(&[sender.as_bytes(), b"\n", others.as_bytes(), b"\n\n", payload])
}

#[derive(Debug, Error)]
pub enum GreeterError {
    #[error(transparent)]
    Greeting(#[from] GreetingError),

    #[error(transparent)]
    Message(#[from] GreetMessageError),

    #[error("operation mixes includes and excludes")]
    MixedOperation,

    #[error("no established session")]
    NoSession,

    #[error("own packet without a matching proposal")]
    StaleOwnPacket,

    #[error("no greeting in progress")]
    NoGreeting,
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;
    use crate::greet::GreetingState;
    use crate::test_utils::{identities, ready_store_pair};

    use super::{packet_id, Greeter, GreeterError};

    fn members(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn packet_id_binds_sender_and_channel() {
        let channel = members(&["1", "2", "3"]);
        let id_1 = packet_id("1", &channel, b"payload");
        let id_2 = packet_id("2", &channel, b"payload");
        assert_ne!(id_1, id_2);

        let shrunk = members(&["1", "2"]);
        assert_ne!(id_1, packet_id("1", &shrunk, b"payload"));
        assert_eq!(id_1, packet_id("1", &channel, b"payload"));
    }

    #[test]
    fn mixed_membership_diff_is_rejected() {
        let rng = Rng::from_seed([11; 32]);
        let mut ids = identities(&["alice", "bob", "carol"], &rng);
        let (alice_store, _) = ready_store_pair(&rng);
        let mut greeter = Greeter::from_store(ids.remove(0), alice_store);

        // Dropping "bob" while adding "carol" in one operation.
        assert!(matches!(
            greeter.encode(&members(&["alice", "carol"]), None, &rng),
            Err(GreeterError::MixedOperation)
        ));
    }

    #[test]
    fn start_with_nobody_is_rejected() {
        let rng = Rng::from_seed([12; 32]);
        let mut ids = identities(&["alice", "bob"], &rng);
        let mut greeter = Greeter::new(ids.remove(0));
        assert!(matches!(
            greeter.encode(&[], None, &rng),
            Err(GreeterError::Greeting(_))
        ));
        assert_eq!(greeter.state(), GreetingState::Null);
    }

    #[test]
    fn refresh_completes_locally() {
        let rng = Rng::from_seed([13; 32]);
        let mut ids = identities(&["alice", "bob"], &rng);
        let (alice_store, _) = ready_store_pair(&rng);
        let old_key = alice_store.group_key().unwrap().clone();
        let mut greeter = Greeter::from_store(ids.remove(0), alice_store);

        let (to, _payload) = greeter
            .encode(&members(&["alice", "bob"]), None, &rng)
            .unwrap();
        assert_eq!(to, "");
        assert_eq!(greeter.state(), GreetingState::Ready);
        assert_ne!(greeter.store().group_key().unwrap(), &old_key);
    }

    #[test]
    fn proposal_echo_activates_the_greeting() {
        let rng = Rng::from_seed([14; 32]);
        let mut ids = identities(&["alice", "bob"], &rng);
        let mut greeter = Greeter::new(ids.remove(0));

        let (_to, payload) = greeter.encode(&members(&["bob"]), None, &rng).unwrap();
        let channel = members(&["alice", "bob"]);
        let decoded = greeter.decode(&payload, "alice", &channel).unwrap();
        assert_eq!(decoded.message.source, "alice");

        // The proposed greeting took over; the own echo is then dropped
        // without output.
        let output = greeter.process(&decoded, &rng).unwrap();
        assert!(output.outbound.is_none());
        assert_eq!(output.state, GreetingState::InitUpflow);

        // A duplicate of the own packet routes to the active greeting and
        // is dropped the same way.
        let decoded = greeter.decode(&payload, "alice", &channel).unwrap();
        let output = greeter.process(&decoded, &rng).unwrap();
        assert!(output.outbound.is_none());
    }
}
