// SPDX-License-Identifier: MIT OR Apache-2.0

//! Authenticated group key agreement and membership operations.
//!
//! A "greeting" is one membership operation (start, include, exclude,
//! refresh or quit) negotiated end-to-end over the broadcast channel. Each
//! greeting interleaves two sub-protocols:
//!
//! - [`cliques`], the tree Diffie–Hellman chain deriving the group key,
//! - [`aske`], the signature key exchange establishing ephemeral signing
//!   keys and the session id.
//!
//! Their sub-messages travel merged inside a single [`GreetMessage`], tagged
//! by a [`GreetType`] bitfield that says which sub-protocols are present and
//! in which direction the message flows. The [`Greeting`] state machine
//! drives one operation; the [`Greeter`] owns the long-lived state between
//! operations and dispatches inbound packets.
pub(crate) mod aske;
pub(crate) mod cliques;
mod greet_type;
mod greeter;
mod greeting;
mod message;

pub use greet_type::{GreetType, GreetTypeError, Operation};
pub use greeter::{DecodedGreet, GreetStore, Greeter, GreeterError, GreeterOutput};
pub use greeting::{Greeting, GreetingError, GreetingState};
pub use message::{GreetHeader, GreetMessage, GreetMessageError, GreetingMetadata};

/// Direction of a key-agreement message through the member list: routed
/// member to member (up) or broadcast to all (down).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Flow {
    Up,
    Down,
}
