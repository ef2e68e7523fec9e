// SPDX-License-Identifier: MIT OR Apache-2.0

//! Top-level protocol handler: classifies inbound frames, drives the
//! greeter, and surfaces everything through three owned queues.
//!
//! The queues are plain process-local inboxes drained by the application:
//! `protocol_out_queue` for greet frames, `message_out_queue` for data
//! frames, `ui_queue` for events addressed to the user. Rejected inbound
//! packets never change state; they are dropped with an event or a log line
//! as the error dictates.
use std::collections::VecDeque;

use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::{self, TlvReader, TlvType, WireFrame};
use crate::greet::{Greeter, GreeterError, GreetingState};
use crate::identity::LocalIdentity;
use crate::message::{MessageError, MessageSecurity};
use crate::Rng;

/// A wire frame queued for the transport. An empty `to` means broadcast.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundPacket {
    pub from: String,
    pub to: String,
    pub message: String,
}

/// An event queued for the user interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UiEvent {
    /// A verified data message from another member.
    Message { from: String, body: String },
    Info(String),
    Error(String),
}

/// Per-participant protocol engine.
pub struct ProtocolHandler {
    greeter: Greeter,
    message_security: Option<MessageSecurity>,
    padding_size: usize,
    rng: Rng,

    /// Wire-encoded greet frames for the transport.
    pub protocol_out_queue: VecDeque<OutboundPacket>,
    /// Wire-encoded data frames for the transport.
    pub message_out_queue: VecDeque<OutboundPacket>,
    /// Events for the user interface.
    pub ui_queue: VecDeque<UiEvent>,
}

impl ProtocolHandler {
    pub fn new(identity: LocalIdentity, rng: Rng) -> Self {
        Self {
            greeter: Greeter::new(identity),
            message_security: None,
            padding_size: 0,
            rng,
            protocol_out_queue: VecDeque::new(),
            message_out_queue: VecDeque::new(),
            ui_queue: VecDeque::new(),
        }
    }

    /// Sets the padding quantum for outbound data messages; zero disables
    /// padding.
    pub fn set_padding_size(&mut self, padding_size: usize) {
        self.padding_size = padding_size;
    }

    pub fn id(&self) -> &str {
        self.greeter.identity().id()
    }

    /// State of the operation in progress, or of the completed session.
    pub fn state(&self) -> GreetingState {
        self.greeter.state()
    }

    /// The completed session store, while one exists.
    pub fn greet_store(&self) -> &crate::greet::GreetStore {
        self.greeter.store()
    }

    /// Starts the initial key agreement with `others`.
    pub fn start(&mut self, others: &[String]) -> Result<(), HandlerError> {
        self.require_state("start", GreetingState::Null)?;
        let (to, payload) = self.greeter.encode(others, None, &self.rng)?;
        self.enqueue_protocol(to, &payload);
        Ok(())
    }

    /// Includes `new` members into the established session.
    pub fn join(&mut self, new: &[String]) -> Result<(), HandlerError> {
        self.require_state("join", GreetingState::Ready)?;
        if new.is_empty() {
            return Err(HandlerError::EmptyMembers("join"));
        }
        let mut new_members = self.greeter.store().members().to_vec();
        new_members.extend_from_slice(new);
        let (to, payload) = self.greeter.encode(&new_members, None, &self.rng)?;
        self.enqueue_protocol(to, &payload);
        Ok(())
    }

    /// Excludes `gone` members from the established session.
    pub fn exclude(&mut self, gone: &[String]) -> Result<(), HandlerError> {
        self.require_state("exclude", GreetingState::Ready)?;
        if gone.is_empty() {
            return Err(HandlerError::EmptyMembers("exclude"));
        }
        if let Some(unknown) = gone
            .iter()
            .find(|id| !self.greeter.store().members().contains(id))
        {
            return Err(HandlerError::NotAMember(unknown.clone()));
        }
        let new_members: Vec<String> = self
            .greeter
            .store()
            .members()
            .iter()
            .filter(|member| !gone.contains(member))
            .cloned()
            .collect();
        let (to, payload) = self.greeter.encode(&new_members, None, &self.rng)?;
        self.enqueue_protocol(to, &payload);
        self.after_operation_step();
        Ok(())
    }

    /// Refreshes the group key of the established session.
    pub fn refresh(&mut self) -> Result<(), HandlerError> {
        self.require_state("refresh", GreetingState::Ready)?;
        let members = self.greeter.store().members().to_vec();
        let (to, payload) = self.greeter.encode(&members, None, &self.rng)?;
        self.enqueue_protocol(to, &payload);
        self.after_operation_step();
        Ok(())
    }

    /// Leaves the session, publishing the own ephemeral private key.
    pub fn quit(&mut self) -> Result<(), HandlerError> {
        self.require_state("quit", GreetingState::Ready)?;
        let payload = self.greeter.quit()?;
        self.enqueue_protocol(String::new(), &payload);
        self.message_security = None;
        Ok(())
    }

    /// Encrypts and queues a data message for the whole session.
    pub fn send(&mut self, body: &str) -> Result<(), HandlerError> {
        self.require_state("send", GreetingState::Ready)?;
        let message_security = self
            .message_security
            .as_ref()
            .ok_or(HandlerError::IllegalState {
                operation: "send",
                state: self.state(),
            })?;
        let payload = message_security.auth_encrypt(&[], body, &self.rng)?;
        self.message_out_queue.push_back(OutboundPacket {
            from: self.id().to_string(),
            to: String::new(),
            message: codec::encode_frame(&payload),
        });
        Ok(())
    }

    /// Processes one inbound frame from the transport.
    ///
    /// Rejected frames are dropped with a queue event or a log line; only
    /// caller misuse surfaces as an error.
    pub fn process_message(&mut self, from: &str, message: &str) -> Result<(), HandlerError> {
        let frame = match codec::classify(message) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%from, %err, "dropping malformed frame");
                self.ui_queue.push_back(UiEvent::Error(err.to_string()));
                return Ok(());
            }
        };

        match frame {
            WireFrame::Plain(_) => {
                debug!(%from, "plain text, requesting encryption");
                self.ui_queue.push_back(UiEvent::Info(
                    "Received unencrypted message, requesting encryption.".to_string(),
                ));
                self.protocol_out_queue.push_back(OutboundPacket {
                    from: self.id().to_string(),
                    to: from.to_string(),
                    message: codec::encode_query(""),
                });
            }
            WireFrame::Query { version, .. } => {
                if self.state() == GreetingState::Null && from != self.id() {
                    debug!(%from, version, "query received, starting key agreement");
                    self.start(&[from.to_string()])?;
                }
            }
            WireFrame::Error { text, .. } => {
                self.ui_queue
                    .push_back(UiEvent::Error(format!("Error in mpEnc protocol: {text}")));
            }
            WireFrame::Encoded(records) => {
                self.process_encoded(from, &records);
            }
        }
        Ok(())
    }

    /// Dispatches a decoded record stream to the greet or data branch.
    fn process_encoded(&mut self, from: &str, records: &[u8]) {
        let reader = TlvReader::new(records);
        match reader.peek_type() {
            Ok(Some(record_type)) if record_type == TlvType::MessageSignature as u16 => {
                if let Err(err) = self.process_greet(from, records) {
                    warn!(%from, %err, "dropping greet packet");
                    self.ui_queue.push_back(UiEvent::Error(err.to_string()));
                }
            }
            Ok(Some(record_type)) if record_type == TlvType::SidkeyHint as u16 => {
                self.process_data(from, records);
            }
            _ => {
                warn!(%from, "dropping frame with unrecognized leading record");
                self.ui_queue
                    .push_back(UiEvent::Error("unrecognized frame content".to_string()));
            }
        }
    }

    fn process_greet(&mut self, from: &str, records: &[u8]) -> Result<(), GreeterError> {
        let channel_members = self.greeter.store().members().to_vec();
        let decoded = match self.greeter.decode(records, from, &channel_members) {
            Ok(decoded) => decoded,
            Err(GreeterError::StaleOwnPacket) => {
                // Our own echo after the operation already finished.
                debug!(%from, "ignoring stale own packet");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let output = self.greeter.process(&decoded, &self.rng)?;
        if let Some((to, payload)) = output.outbound {
            self.enqueue_protocol(to, &payload);
        }
        self.after_operation_step();
        Ok(())
    }

    fn process_data(&mut self, from: &str, records: &[u8]) {
        let Some(message_security) = self.message_security.as_ref() else {
            warn!(%from, "data message without an established session");
            return;
        };
        match message_security.decrypt_verify(records, from) {
            Ok(received) => {
                self.ui_queue.push_back(UiEvent::Message {
                    from: received.author,
                    body: received.body,
                });
            }
            Err(MessageError::BadSignature) => {
                self.ui_queue.push_back(UiEvent::Error(
                    "Signature of received message invalid.".to_string(),
                ));
            }
            Err(MessageError::UnknownAuthor(author)) => {
                // No state change; not worth a user-facing event.
                warn!(%author, "data message from unknown author");
            }
            Err(err) => {
                warn!(%from, %err, "dropping data packet");
                self.ui_queue.push_back(UiEvent::Error(err.to_string()));
            }
        }
    }

    /// Reconciles the session-dependent surface after a greeting step.
    fn after_operation_step(&mut self) {
        match self.greeter.state() {
            GreetingState::Ready => {
                match MessageSecurity::new(self.greeter.store(), self.padding_size) {
                    Ok(message_security) => self.message_security = Some(message_security),
                    Err(err) => warn!(%err, "session ready but message security unavailable"),
                }
            }
            GreetingState::Quit => {
                self.message_security = None;
            }
            _ => {}
        }
    }

    fn require_state(
        &self,
        operation: &'static str,
        expected: GreetingState,
    ) -> Result<(), HandlerError> {
        let state = self.state();
        if state != expected {
            return Err(HandlerError::IllegalState { operation, state });
        }
        Ok(())
    }

    fn enqueue_protocol(&mut self, to: String, payload: &[u8]) {
        self.protocol_out_queue.push_back(OutboundPacket {
            from: self.id().to_string(),
            to,
            message: codec::encode_frame(payload),
        });
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("cannot {operation} while the engine is {state:?}")]
    IllegalState {
        operation: &'static str,
        state: GreetingState,
    },

    #[error("{0} requires a non-empty member list")]
    EmptyMembers(&'static str),

    #[error("{0} is not a session member")]
    NotAMember(String),

    #[error(transparent)]
    Greeter(#[from] GreeterError),

    #[error(transparent)]
    Message(#[from] MessageError),
}
