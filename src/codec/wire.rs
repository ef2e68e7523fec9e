// SPDX-License-Identifier: MIT OR Apache-2.0

//! ASCII wire framing and inbound frame classification.
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

use crate::codec::{ERROR_MESSAGE_SIGNATURE_PREFIX, PROTOCOL_VERSION};

/// Prefix of encrypted protocol and data frames.
pub const FRAME_PREFIX: &str = "?mpENC:";

/// Prefix of error frames.
pub const ERROR_PREFIX: &str = "?mpENC Error:";

/// Prefix of protocol query frames; a version byte and `?` follow.
pub const QUERY_PREFIX: &str = "?mpENCv";

/// Terminator of encrypted frames.
const FRAME_SUFFIX: char = '.';

/// Wraps a TLV record stream into an encrypted frame.
pub fn encode_frame(records: &[u8]) -> String {
    format!("{FRAME_PREFIX}{}{FRAME_SUFFIX}", BASE64.encode(records))
}

/// Unwraps an encrypted frame back into its TLV record stream.
pub fn decode_frame(frame: &str) -> Result<Vec<u8>, WireError> {
    let body = frame
        .strip_prefix(FRAME_PREFIX)
        .and_then(|rest| rest.strip_suffix(FRAME_SUFFIX))
        .ok_or(WireError::MissingFraming)?;
    BASE64
        .decode(body)
        .map_err(|_| WireError::InvalidBase64)
}

/// Builds a protocol query frame, `?mpENCv<versionByte>?<text>`.
///
/// The version is a single ASCII character whose code is the protocol
/// version number.
pub fn encode_query(text: &str) -> String {
    format!("{QUERY_PREFIX}{}?{text}", char::from(PROTOCOL_VERSION))
}

/// Builds an error frame, `?mpENC Error:<base64 signature>:<text>`.
pub fn encode_error_frame(signature: &[u8], text: &str) -> String {
    format!("{ERROR_PREFIX}{}:{text}", BASE64.encode(signature))
}

/// The byte string an error-frame signature is computed over.
pub fn error_signature_input(text: &str) -> Vec<u8> {
    let mut input = ERROR_MESSAGE_SIGNATURE_PREFIX.to_vec();
    input.extend_from_slice(text.as_bytes());
    input
}

/// An inbound frame, classified by its prefix.
#[derive(Debug, PartialEq, Eq)]
pub enum WireFrame<'a> {
    /// No mpENC framing at all; plain conversation text.
    Plain(&'a str),

    /// A protocol query, inviting the receiver to start a session.
    Query { version: u8, text: &'a str },

    /// An error report. Unsigned reports carry an empty signature.
    Error { signature: Vec<u8>, text: &'a str },

    /// An encrypted frame, decoded back to its TLV record stream.
    Encoded(Vec<u8>),
}

/// Classifies an inbound frame by prefix and unwraps it.
pub fn classify(pubtxt: &str) -> Result<WireFrame<'_>, WireError> {
    if let Some(rest) = pubtxt.strip_prefix(ERROR_PREFIX) {
        // `<base64 signature>:<text>`, but tolerate bare text: peers may
        // report errors before any signing key exists.
        if let Some((head, tail)) = rest.split_once(':') {
            if let Ok(signature) = BASE64.decode(head) {
                return Ok(WireFrame::Error {
                    signature,
                    text: tail,
                });
            }
        }
        return Ok(WireFrame::Error {
            signature: Vec::new(),
            text: rest,
        });
    }

    if pubtxt.starts_with(FRAME_PREFIX) {
        return Ok(WireFrame::Encoded(decode_frame(pubtxt)?));
    }

    if let Some(rest) = pubtxt.strip_prefix(QUERY_PREFIX) {
        let mut chars = rest.chars();
        let version = chars.next().filter(char::is_ascii).ok_or(WireError::MalformedQuery)?;
        if chars.next() != Some('?') {
            return Err(WireError::MalformedQuery);
        }
        return Ok(WireFrame::Query {
            version: version as u8,
            text: chars.as_str(),
        });
    }

    Ok(WireFrame::Plain(pubtxt))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("frame lacks the ?mpENC prefix or terminating dot")]
    MissingFraming,

    #[error("frame body is not valid base64")]
    InvalidBase64,

    #[error("query frame lacks version byte or separator")]
    MalformedQuery,
}

#[cfg(test)]
mod tests {
    use super::{classify, decode_frame, encode_frame, encode_query, WireFrame};

    #[test]
    fn frame_round_trip() {
        // Arbitrary bytes survive framing, not just valid records.
        let payloads: [&[u8]; 4] = [b"", b"\x00", b"\x01\x00\x00\x02hi", &[0xff; 63]];
        for payload in payloads {
            let frame = encode_frame(payload);
            assert!(frame.starts_with("?mpENC:"));
            assert!(frame.ends_with('.'));
            assert_eq!(decode_frame(&frame).unwrap(), payload);
        }
    }

    #[test]
    fn classify_by_prefix() {
        assert_eq!(
            classify("Kia ora").unwrap(),
            WireFrame::Plain("Kia ora")
        );
        assert_eq!(
            classify(&encode_frame(b"abc")).unwrap(),
            WireFrame::Encoded(b"abc".to_vec())
        );
        assert_eq!(
            classify(&encode_query("")).unwrap(),
            WireFrame::Query {
                version: 0x01,
                text: "",
            }
        );
    }

    #[test]
    fn error_frame_without_signature() {
        assert_eq!(
            classify("?mpENC Error:Hatschi!").unwrap(),
            WireFrame::Error {
                signature: Vec::new(),
                text: "Hatschi!",
            }
        );
    }

    #[test]
    fn error_frame_with_signature() {
        let frame = super::encode_error_frame(b"sig", "went wrong");
        assert_eq!(
            classify(&frame).unwrap(),
            WireFrame::Error {
                signature: b"sig".to_vec(),
                text: "went wrong",
            }
        );
    }

    #[test]
    fn malformed_frames_fail() {
        assert!(decode_frame("?mpENC:no-terminator").is_err());
        assert!(decode_frame("?mpENC:!!!.").is_err());
    }
}
