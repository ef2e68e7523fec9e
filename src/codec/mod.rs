// SPDX-License-Identifier: MIT OR Apache-2.0

//! Type-length-value wire codec.
//!
//! Every packet is a sequence of `(u16 type, u16 length, bytes value)`
//! records, big-endian, wrapped into an ASCII frame for the transport:
//!
//! - `?mpENC:<base64(records)>.` for encrypted protocol and data frames
//! - `?mpENCv<versionByte>?<text>` for protocol queries
//! - `?mpENC Error:<base64 signature>:<text>` for error reports
//!
//! The record registry and the byte-level layout are fixed; peers running
//! other implementations parse these frames bit for bit.
mod tlv;
mod wire;

pub use tlv::{TlvError, TlvReader, TlvWriter};
pub use wire::{
    classify, decode_frame, encode_error_frame, encode_frame, encode_query, error_signature_input,
    WireError, WireFrame, ERROR_PREFIX, FRAME_PREFIX, QUERY_PREFIX,
};

/// Wire protocol version carried in every frame's PROTOCOL_VERSION record
/// and in query frames.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Record types of the TLV registry (big-endian u16 on the wire).
///
/// The `0x00xx` range holds message-level records, `0x01xx` holds greet
/// fields. `MessagePayload` is the registry's historical DATA_MESSAGE
/// record; one record, two names.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum TlvType {
    ProtocolVersion = 0x0001,
    MessagePayload = 0x0002,
    MessageSignature = 0x0003,
    MessageIv = 0x0004,
    MessageType = 0x0005,
    SidkeyHint = 0x0006,
    MessageParent = 0x0010,
    MessageBody = 0x0011,
    Source = 0x0100,
    Dest = 0x0101,
    Member = 0x0102,
    IntKey = 0x0103,
    Nonce = 0x0104,
    PubKey = 0x0105,
    SessionSignature = 0x0106,
    SigningKey = 0x0107,
    GreetType = 0x0108,
    PrevPf = 0x0109,
    ChainHash = 0x010A,
    LatestPm = 0x010B,
}

/// Message categories carried in the MESSAGE_TYPE record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Greet = 0x00,
    Data = 0x01,
}

/// Domain-separation prefix for greet-message signature inputs.
pub const GREET_MESSAGE_SIGNATURE_PREFIX: &[u8] = b"greetmsgsig";

/// Domain-separation prefix for data-message signature inputs; the sidkey
/// hash follows the prefix.
pub const DATA_MESSAGE_SIGNATURE_PREFIX: &[u8] = b"datamsgsig";

/// Domain-separation prefix for error-frame signature inputs.
pub const ERROR_MESSAGE_SIGNATURE_PREFIX: &[u8] = b"errormsgsig";
