// SPDX-License-Identifier: MIT OR Apache-2.0

//! `mpenc` is a per-participant protocol engine for multi-party end-to-end
//! encrypted group chat.
//!
//! The engine couples two interlocking key-agreement protocols and drives
//! them over an untrusted broadcast channel:
//!
//! - **CLIQUES**, a tree Diffie–Hellman group key agreement on Curve25519.
//!   An "intermediate key" vector accumulates partial products along the
//!   member list (the _upflow_); the final broadcast (the _downflow_) lets
//!   every member reconstruct the shared group key from its own entry.
//! - **ASKE** (Authenticated Signature Key Exchange), which establishes a
//!   per-session ephemeral Ed25519 signing key for every member and a joint
//!   session identifier, acknowledged by each member with an RSA signature
//!   under their static identity key.
//!
//! On top of the key agreement sit:
//!
//! - a **greeting state machine** negotiating membership operations (start,
//!   include, exclude, refresh, quit) as upflow/downflow rounds,
//! - an **authenticated data-message codec** which signs, encrypts and pads
//!   in-session payloads with the agreed group key and ephemeral keys,
//! - a **type-length-value wire codec** mapping everything to opaque
//!   `?mpENC:` base64 frames that are bit-compatible across implementations.
//!
//! The engine is a pure, single-threaded state machine. It does not talk to
//! the network itself: the host delivers inbound frames through
//! [`ProtocolHandler::process_message`] and drains three outbound queues
//! (protocol frames, data frames, user-interface events). The only
//! requirements on the transport are ordered per-sender delivery and
//! membership notifications.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//!
//! use mpenc::crypto::rsa::StaticSigningKey;
//! use mpenc::{LocalIdentity, ProtocolHandler, Rng};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let rng = Rng::default();
//! let static_key = StaticSigningKey::generate(2048, &rng)?;
//! let directory = HashMap::new(); // other members' static public keys
//! let identity = LocalIdentity::new("alice", static_key, directory)?;
//! let mut alice = ProtocolHandler::new(identity, rng);
//!
//! alice.start(&["bob".into(), "carol".into()])?;
//! while let Some(packet) = alice.protocol_out_queue.pop_front() {
//!     // hand packet.message to the broadcast channel
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Security caveats
//!
//! Ephemeral keys give the sessions limited forward secrecy and ASKE gives
//! limited deniability; neither goes further than that. Recovery flows after
//! a peer's QUIT are intentionally unimplemented and surface as explicit
//! errors rather than guessed semantics.
pub mod codec;
pub mod crypto;
mod greet;
mod handler;
mod identity;
mod message;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
#[cfg(test)]
mod tests;

pub use crypto::{Rng, RngError};
pub use greet::{
    DecodedGreet, GreetHeader, GreetMessage, GreetMessageError, GreetStore, GreetType,
    GreetTypeError, Greeter, GreeterError, GreeterOutput, Greeting, GreetingError,
    GreetingMetadata, GreetingState, Operation,
};
pub use handler::{HandlerError, OutboundPacket, ProtocolHandler, UiEvent};
pub use identity::{IdentityError, LocalIdentity};
pub use message::{MessageError, MessageSecurity, ReceivedMessage};
