// SPDX-License-Identifier: MIT OR Apache-2.0

//! The greeting state machine: drives one membership operation end-to-end.
//!
//! A greeting owns all mutable state of the operation in flight and a
//! by-value copy of the previous session's store, which it never mutates.
//! Inbound greet messages are split into their CLIQUES and ASKE sub-messages
//! by the greet-type bits, the sub-protocols are stepped, and their outputs
//! merge back into a single outbound greet message.
use thiserror::Error;

use crate::crypto::ed25519::VerifyingKey;
use crate::crypto::{Rng, Secret};
use crate::greet::aske::{AskeError, AskeMember, AskeMessage};
use crate::greet::cliques::{CliquesError, CliquesMember, CliquesMessage};
use crate::greet::greet_type::bits;
use crate::greet::greeter::GreetStore;
use crate::greet::message::{GreetMessage, GreetMessageError, GreetingMetadata};
use crate::greet::{Flow, GreetType, GreetTypeError, Operation};
use crate::identity::LocalIdentity;

/// Phases of a greeting.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum GreetingState {
    /// No session and no operation running.
    Null,
    /// Initial key agreement, chain still travelling member to member.
    InitUpflow,
    /// Initial key agreement, acknowledgement round running.
    InitDownflow,
    /// Session established.
    Ready,
    /// Auxiliary operation, chain travelling through the new members.
    AuxUpflow,
    /// Auxiliary operation, acknowledgement round running.
    AuxDownflow,
    /// Participation ended.
    Quit,
}

/// One membership operation in progress.
#[derive(Debug)]
pub struct Greeting {
    id: String,
    state: GreetingState,
    cliques: CliquesMember,
    aske: AskeMember,
    metadata: Option<GreetingMetadata>,
    seen_inbound: bool,
}

impl Greeting {
    /// Creates a greeting on top of the previous session store: fresh for an
    /// initial key agreement, restored mid-session for auxiliary operations.
    pub fn new(id: impl Into<String>, prev_store: &GreetStore) -> Self {
        let id = id.into();
        if prev_store.is_ready() {
            Self {
                cliques: CliquesMember::restore(
                    id.clone(),
                    prev_store.members.clone(),
                    prev_store.priv_key_list.clone(),
                    prev_store.int_keys.clone(),
                    prev_store.group_element(),
                ),
                aske: AskeMember::restore(
                    id.clone(),
                    prev_store.members.clone(),
                    prev_store.own_nonce.clone(),
                    prev_store.ephemeral_key.clone(),
                    prev_store.nonces.clone(),
                    prev_store.ephemeral_pub_keys.clone(),
                    prev_store.session_id,
                ),
                id,
                state: GreetingState::Ready,
                metadata: None,
                seen_inbound: false,
            }
        } else {
            Self {
                cliques: CliquesMember::new(id.clone()),
                aske: AskeMember::new(id.clone()),
                id,
                state: GreetingState::Null,
                metadata: None,
                seen_inbound: false,
            }
        }
    }

    pub fn state(&self) -> GreetingState {
        self.state
    }

    pub fn metadata(&self) -> Option<&GreetingMetadata> {
        self.metadata.as_ref()
    }

    /// Ephemeral public key of a session member, once introduced.
    pub fn ephemeral_pub_key(&self, member: &str) -> Option<&VerifyingKey> {
        self.aske.ephemeral_pub_key(member)
    }

    /// Signs an outbound greet message with the own ephemeral key and
    /// returns the wire payload.
    pub fn sign(&self, message: &mut GreetMessage) -> Result<Vec<u8>, GreetingError> {
        let ephemeral_key = self
            .aske
            .ephemeral_key()
            .ok_or(GreetingError::NotParticipating)?;
        Ok(message.encode_signed(ephemeral_key)?)
    }

    /// Starts the initial key agreement towards `others`.
    pub fn start(
        &mut self,
        others: &[String],
        identity: &LocalIdentity,
        rng: &Rng,
    ) -> Result<GreetMessage, GreetingError> {
        if self.state != GreetingState::Null {
            return Err(GreetingError::IllegalCaller {
                operation: Operation::Start,
                state: self.state,
            });
        }
        let cliques = self.cliques.ika(others, rng)?;
        let aske = self.aske.commit(others, identity, rng)?;
        self.state = GreetingState::InitUpflow;
        self.build(GreetType::INIT_INITIATOR_UP, Some(cliques), Some(aske))
    }

    /// Starts an include operation towards the `new` members.
    pub fn include(&mut self, new: &[String], rng: &Rng) -> Result<GreetMessage, GreetingError> {
        if self.state != GreetingState::Ready {
            return Err(GreetingError::IllegalCaller {
                operation: Operation::Include,
                state: self.state,
            });
        }
        let cliques = self.cliques.aka_join(new, rng)?;
        let aske = self.aske.join(new)?;
        self.state = GreetingState::AuxUpflow;
        self.build(GreetType::INCLUDE_AUX_INITIATOR_UP, Some(cliques), Some(aske))
    }

    /// Starts an exclude operation removing the `exclude` members.
    pub fn exclude(
        &mut self,
        exclude: &[String],
        identity: &LocalIdentity,
        rng: &Rng,
    ) -> Result<GreetMessage, GreetingError> {
        if self.state != GreetingState::Ready {
            return Err(GreetingError::IllegalCaller {
                operation: Operation::Exclude,
                state: self.state,
            });
        }
        let cliques = self.cliques.aka_exclude(exclude, rng)?;
        let aske = self.aske.exclude(exclude, identity, rng)?;

        // Last man standing: the group collapses to just us.
        self.state = if self.cliques.members == [self.id.clone()] {
            GreetingState::Quit
        } else {
            GreetingState::AuxDownflow
        };
        self.build(
            GreetType::EXCLUDE_AUX_INITIATOR_DOWN,
            Some(cliques),
            Some(aske),
        )
    }

    /// Renews the own key contribution and broadcasts the refreshed chain.
    /// Members and session id stay untouched.
    pub fn refresh(&mut self, rng: &Rng) -> Result<GreetMessage, GreetingError> {
        if !matches!(
            self.state,
            GreetingState::Ready | GreetingState::InitDownflow | GreetingState::AuxDownflow
        ) {
            return Err(GreetingError::IllegalCaller {
                operation: Operation::Refresh,
                state: self.state,
            });
        }
        let cliques = self.cliques.aka_refresh(rng)?;
        self.build(GreetType::REFRESH_AUX_INITIATOR_DOWN, Some(cliques), None)
    }

    /// Leaves the session, publishing the own ephemeral private key so past
    /// signatures remain auditable, and destroys all secrets.
    pub fn quit(&mut self) -> Result<(GreetMessage, Vec<u8>), GreetingError> {
        if self.state == GreetingState::Quit {
            return Err(GreetingError::IllegalCaller {
                operation: Operation::Quit,
                state: self.state,
            });
        }
        let ephemeral_key = self
            .aske
            .ephemeral_key()
            .cloned()
            .ok_or(GreetingError::NotParticipating)?;

        let mut message = GreetMessage {
            source: self.id.clone(),
            dest: String::new(),
            greet_type: GreetType::QUIT_DOWN,
            members: Vec::new(),
            int_keys: Vec::new(),
            nonces: Vec::new(),
            pub_keys: Vec::new(),
            session_signature: None,
            signing_key: Some(ephemeral_key.clone()),
            metadata: None,
            signature: None,
        };
        // Sign before the key material is destroyed.
        let payload = message.encode_signed(&ephemeral_key)?;

        self.cliques.aka_quit();
        self.aske.quit()?;
        self.state = GreetingState::Quit;
        Ok((message, payload))
    }

    /// Attaches initial-packet metadata; only valid before encoding.
    pub fn set_metadata(&mut self, metadata: GreetingMetadata) {
        self.metadata = Some(metadata);
    }

    /// Processes one inbound greet message, returning the merged outbound
    /// message if the protocol asks us to speak.
    pub fn process_message(
        &mut self,
        message: &GreetMessage,
        identity: &LocalIdentity,
        rng: &Rng,
    ) -> Result<Option<GreetMessage>, GreetingError> {
        // A quit greeting stays quiet.
        if self.state == GreetingState::Quit {
            return Ok(None);
        }

        // A member list that omits us means we are out; stop participating
        // without a reply.
        if !message.members.is_empty() && !message.members.iter().any(|m| m == &self.id) {
            self.state = GreetingState::Quit;
            return Ok(None);
        }

        // Not for us, or our own echo.
        if !message.dest.is_empty() && message.dest != self.id {
            return Ok(None);
        }
        if message.source == self.id {
            return Ok(None);
        }

        // A peer's quit would require the recovery flow, which is
        // intentionally not implemented.
        if message.greet_type.operation() == Operation::Quit {
            return Err(GreetingError::Unimplemented(
                "recovery after a peer quit the session",
            ));
        }

        self.verify_signature(message)?;

        // Initial-packet metadata is recorded once, on the very first
        // inbound message; later messages of the operation carry none.
        if let Some(metadata) = &message.metadata {
            if self.seen_inbound {
                return Err(GreetingError::UnexpectedMetadata);
            }
            self.metadata = Some(metadata.clone());
        }
        self.seen_inbound = true;

        let greet_type = message.greet_type;
        let mut out_cliques = None;
        let mut out_aske = None;

        if greet_type.is_downflow() {
            if greet_type.has_gka() {
                self.cliques.downflow(to_cliques(message))?;
            }
            if greet_type.has_ske() {
                out_aske = self.aske.downflow(to_aske(message), identity, rng)?;
            }
        } else {
            if greet_type.has_gka() {
                out_cliques = Some(self.cliques.upflow(to_cliques(message), rng)?);
            }
            if greet_type.has_ske() {
                out_aske = Some(self.aske.upflow(to_aske(message), identity, rng)?);
            }
        }

        let outbound = self.merge(greet_type, out_cliques, out_aske)?;

        // State follows the flow: an outbound upflow keeps the chain
        // travelling; otherwise we sit in the downflow phase until every
        // member acknowledged the session.
        match &outbound {
            Some(out) if !out.greet_type.is_downflow() => {
                self.state = if greet_type.is_auxiliary() {
                    GreetingState::AuxUpflow
                } else {
                    GreetingState::InitUpflow
                };
            }
            _ => {
                if self.aske.is_session_acknowledged() {
                    self.state = GreetingState::Ready;
                } else {
                    self.state = if greet_type.is_auxiliary() {
                        GreetingState::AuxDownflow
                    } else {
                        GreetingState::InitDownflow
                    };
                }
            }
        }

        // Last man standing.
        if self.cliques.members == [self.id.clone()] {
            self.state = GreetingState::Quit;
            return Ok(None);
        }

        Ok(outbound)
    }

    /// Snapshot of the completed session, replacing the previous store.
    pub fn new_store(&self) -> Result<GreetStore, GreetingError> {
        if self.state != GreetingState::Ready {
            return Err(GreetingError::IncompleteSession);
        }
        let session_id = *self
            .aske
            .session_id()
            .ok_or(GreetingError::IncompleteSession)?;
        let group_key = self
            .cliques
            .group_key()
            .ok_or(GreetingError::IncompleteSession)?;

        let members = self.aske.members.clone();
        let nonces = self.aske.nonces.clone();
        let ephemeral_pub_keys = self.aske.ephemeral_pub_keys.clone();
        if members.len() != nonces.len() || members.len() != ephemeral_pub_keys.len() {
            return Err(GreetingError::IncompleteSession);
        }

        Ok(GreetStore {
            state: GreetingState::Ready,
            members,
            session_id: Some(session_id),
            own_nonce: self.aske.own_nonce().cloned(),
            ephemeral_key: self.aske.ephemeral_key().cloned(),
            nonces,
            ephemeral_pub_keys,
            group_key: Some(Secret::from_bytes(*group_key.as_bytes())),
            priv_key_list: self.cliques.priv_key_list.clone(),
            int_keys: self.cliques.int_keys.clone(),
        })
    }

    /// Verifies the detached message signature once the sender's ephemeral
    /// key is known, either from our state or introduced by this message.
    /// Until then verification is deferred to the session-signature check.
    fn verify_signature(&self, message: &GreetMessage) -> Result<(), GreetingError> {
        let known = self.aske.ephemeral_pub_key(&message.source).copied();
        let introduced = message
            .members
            .iter()
            .position(|m| m == &message.source)
            .and_then(|position| message.pub_keys.get(position))
            .copied();
        if let Some(pub_key) = known.or(introduced) {
            message
                .verify(&pub_key)
                .map_err(|_| GreetingError::BadSignature(message.source.clone()))?;
        }
        Ok(())
    }

    /// Merges the sub-protocol outputs into one outbound greet message and
    /// derives its greet type from the inbound one.
    fn merge(
        &self,
        inbound: GreetType,
        cliques: Option<CliquesMessage>,
        aske: Option<AskeMessage>,
    ) -> Result<Option<GreetMessage>, GreetingError> {
        if cliques.is_none() && aske.is_none() {
            return Ok(None);
        }

        let dest = cliques
            .as_ref()
            .map(|c| c.dest.clone())
            .or_else(|| aske.as_ref().map(|a| a.dest.clone()))
            .unwrap_or_default();
        let members = cliques
            .as_ref()
            .map(|c| c.members.clone())
            .or_else(|| aske.as_ref().map(|a| a.members.clone()))
            .unwrap_or_default();

        // Acknowledgement-only downflows carry no key-agreement content.
        let is_confirm = cliques.is_none()
            && aske
                .as_ref()
                .is_some_and(|a| a.flow == Flow::Down && a.nonces.is_empty());

        // We are forwarding, not initiating; clearing INIT and GKA one at a
        // time passes through codes outside the wire set, so the raw setter
        // is used and the result validated as a whole.
        let mut greet_type = inbound.raw_with_bit(bits::INIT, false);
        if is_confirm {
            greet_type = greet_type.raw_with_bit(bits::GKA, false);
        }
        if dest.is_empty() {
            greet_type = greet_type.raw_with_bit(bits::DOWN, true);
        }
        let greet_type = GreetType::from_bits(greet_type.bits())?;

        Ok(Some(GreetMessage {
            source: self.id.clone(),
            dest,
            greet_type,
            members,
            int_keys: cliques.map(|c| c.int_keys).unwrap_or_default(),
            nonces: aske.as_ref().map(|a| a.nonces.clone()).unwrap_or_default(),
            pub_keys: aske
                .as_ref()
                .map(|a| a.pub_keys.clone())
                .unwrap_or_default(),
            session_signature: aske.and_then(|a| a.session_signature),
            signing_key: None,
            metadata: None,
            signature: None,
        }))
    }

    /// Builds an initiator message from the sub-protocol outputs.
    fn build(
        &mut self,
        greet_type: GreetType,
        cliques: Option<CliquesMessage>,
        aske: Option<AskeMessage>,
    ) -> Result<GreetMessage, GreetingError> {
        let dest = cliques
            .as_ref()
            .map(|c| c.dest.clone())
            .or_else(|| aske.as_ref().map(|a| a.dest.clone()))
            .unwrap_or_default();
        let members = cliques
            .as_ref()
            .map(|c| c.members.clone())
            .or_else(|| aske.as_ref().map(|a| a.members.clone()))
            .unwrap_or_default();

        Ok(GreetMessage {
            source: self.id.clone(),
            dest,
            greet_type,
            members,
            int_keys: cliques.map(|c| c.int_keys).unwrap_or_default(),
            nonces: aske.as_ref().map(|a| a.nonces.clone()).unwrap_or_default(),
            pub_keys: aske
                .as_ref()
                .map(|a| a.pub_keys.clone())
                .unwrap_or_default(),
            session_signature: aske.and_then(|a| a.session_signature),
            signing_key: None,
            metadata: self.metadata.clone(),
            signature: None,
        })
    }
}

fn to_cliques(message: &GreetMessage) -> CliquesMessage {
    CliquesMessage {
        source: message.source.clone(),
        dest: message.dest.clone(),
        flow: if message.is_downflow() {
            Flow::Down
        } else {
            Flow::Up
        },
        members: message.members.clone(),
        int_keys: message.int_keys.clone(),
    }
}

fn to_aske(message: &GreetMessage) -> AskeMessage {
    AskeMessage {
        source: message.source.clone(),
        dest: message.dest.clone(),
        flow: if message.is_downflow() {
            Flow::Down
        } else {
            Flow::Up
        },
        members: message.members.clone(),
        nonces: message.nonces.clone(),
        pub_keys: message.pub_keys.clone(),
        session_signature: message.session_signature.clone(),
    }
}

#[derive(Debug, Error)]
pub enum GreetingError {
    #[error("cannot {operation} while the greeting is {state:?}")]
    IllegalCaller {
        operation: Operation,
        state: GreetingState,
    },

    #[error(transparent)]
    Cliques(#[from] CliquesError),

    #[error(transparent)]
    Aske(#[from] AskeError),

    #[error(transparent)]
    GreetType(#[from] GreetTypeError),

    #[error(transparent)]
    Message(#[from] GreetMessageError),

    #[error("greet message signature of {0} does not verify")]
    BadSignature(String),

    #[error("metadata on a non-initial greet message")]
    UnexpectedMetadata,

    #[error("not participating in a session")]
    NotParticipating,

    #[error("session is not complete")]
    IncompleteSession,

    #[error("{0} is not implemented")]
    Unimplemented(&'static str),
}
