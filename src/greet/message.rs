// SPDX-License-Identifier: MIT OR Apache-2.0

//! The greet message: one typed transport packet of a membership operation.
//!
//! A greet payload is a fixed TLV sequence: the detached signature first,
//! then version, category, greet type, routing, the repeated key-agreement
//! fields, optional initiator metadata and optional trailing signatures.
//! Encoding is canonical, so the signature input can be reconstructed from a
//! decoded message.
use thiserror::Error;

use crate::codec::{
    MessageType, TlvError, TlvReader, TlvType, TlvWriter, GREET_MESSAGE_SIGNATURE_PREFIX,
    PROTOCOL_VERSION,
};
use crate::crypto::ed25519::{Signature, SignatureError, SigningKey, VerifyingKey};
use crate::crypto::x25519;
use crate::greet::GreetType;

/// Metadata attached to the initial packet of a new operation, linking it to
/// the previous session and the sender's latest seen messages.
///
/// The parent pointers are opaque here; their causal meaning belongs to a
/// layer above the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GreetingMetadata {
    /// Packet id of the previous operation's final packet.
    pub prev_pf: Vec<u8>,
    /// Chain hash at the previous operation's end.
    pub prev_chain_hash: Vec<u8>,
    /// Packet ids of the latest messages seen by the initiator.
    pub parents: Vec<Vec<u8>>,
}

/// A decoded or to-be-sent greet message.
///
/// An empty `dest` means broadcast. The ephemeral private key travels in
/// `signing_key` only when the sender quits.
#[derive(Clone, Debug)]
pub struct GreetMessage {
    pub source: String,
    pub dest: String,
    pub greet_type: GreetType,
    pub members: Vec<String>,
    pub int_keys: Vec<x25519::PublicKey>,
    pub nonces: Vec<Vec<u8>>,
    pub pub_keys: Vec<VerifyingKey>,
    pub session_signature: Option<Vec<u8>>,
    pub signing_key: Option<SigningKey>,
    pub metadata: Option<GreetingMetadata>,
    /// Detached signature over the encoded content; present on decoded
    /// messages, filled in at encode time for outbound ones.
    pub signature: Option<Signature>,
}

/// Routing and type fields of a greet payload, decoded without touching the
/// rest of the packet.
#[derive(Clone, Debug)]
pub struct GreetHeader {
    pub greet_type: GreetType,
    pub source: String,
    pub dest: String,
}

impl GreetMessage {
    /// Encodes the message content, i.e. everything the signature covers.
    pub fn encode_content(&self) -> Result<Vec<u8>, GreetMessageError> {
        let mut writer = TlvWriter::new();
        writer.push(TlvType::ProtocolVersion, &[PROTOCOL_VERSION])?;
        writer.push(TlvType::MessageType, &[MessageType::Greet as u8])?;
        writer.push(TlvType::GreetType, &self.greet_type.to_bytes())?;
        writer.push(TlvType::Source, self.source.as_bytes())?;
        writer.push(TlvType::Dest, self.dest.as_bytes())?;
        for member in &self.members {
            writer.push(TlvType::Member, member.as_bytes())?;
        }
        for int_key in &self.int_keys {
            writer.push(TlvType::IntKey, int_key.as_bytes())?;
        }
        for nonce in &self.nonces {
            writer.push(TlvType::Nonce, nonce)?;
        }
        for pub_key in &self.pub_keys {
            writer.push(TlvType::PubKey, pub_key.as_bytes())?;
        }
        if let Some(metadata) = &self.metadata {
            writer.push(TlvType::PrevPf, &metadata.prev_pf)?;
            writer.push(TlvType::ChainHash, &metadata.prev_chain_hash)?;
            for parent in &metadata.parents {
                writer.push(TlvType::LatestPm, parent)?;
            }
        }
        if let Some(session_signature) = &self.session_signature {
            writer.push(TlvType::SessionSignature, session_signature)?;
        }
        if let Some(signing_key) = &self.signing_key {
            writer.push(TlvType::SigningKey, signing_key.as_bytes())?;
        }
        Ok(writer.into_bytes())
    }

    /// Signs the content with the sender's ephemeral key and returns the
    /// complete payload, signature record first.
    pub fn encode_signed(&mut self, ephemeral_key: &SigningKey) -> Result<Vec<u8>, GreetMessageError> {
        let content = self.encode_content()?;
        let signature = ephemeral_key.sign(&signature_input(&content));
        let mut writer = TlvWriter::new();
        writer.push(TlvType::MessageSignature, signature.as_bytes())?;
        writer.extend_raw(&content);
        self.signature = Some(signature);
        Ok(writer.into_bytes())
    }

    /// Verifies the detached signature against the claimed sender's
    /// ephemeral public key.
    pub fn verify(&self, pub_key: &VerifyingKey) -> Result<(), GreetMessageError> {
        let signature = self
            .signature
            .as_ref()
            .ok_or(GreetMessageError::MissingSignature)?;
        let content = self.encode_content()?;
        pub_key
            .verify(&signature_input(&content), signature)
            .map_err(|_| GreetMessageError::BadSignature)
    }

    /// Decodes a full greet payload.
    pub fn decode(payload: &[u8]) -> Result<Self, GreetMessageError> {
        let mut reader = TlvReader::new(payload);

        let signature = Signature::from_slice(reader.pop(TlvType::MessageSignature)?)
            .map_err(GreetMessageError::Signature)?;

        let version = reader.pop(TlvType::ProtocolVersion)?;
        if version != [PROTOCOL_VERSION] {
            return Err(GreetMessageError::UnsupportedVersion(version.to_vec()));
        }

        let category = reader.pop(TlvType::MessageType)?;
        if category != [MessageType::Greet as u8] {
            return Err(GreetMessageError::NotAGreetMessage);
        }

        let greet_type = decode_greet_type(reader.pop(TlvType::GreetType)?)?;
        let source = decode_utf8(reader.pop(TlvType::Source)?)?;
        let dest = decode_utf8(reader.pop(TlvType::Dest)?)?;

        let members = reader
            .pop_all(TlvType::Member)?
            .into_iter()
            .map(decode_utf8)
            .collect::<Result<Vec<_>, _>>()?;

        let int_keys = reader
            .pop_all(TlvType::IntKey)?
            .into_iter()
            .map(|bytes| {
                let bytes: [u8; x25519::PUBLIC_KEY_SIZE] = bytes
                    .try_into()
                    .map_err(|_| GreetMessageError::InvalidKeyLength(bytes.len()))?;
                Ok(x25519::PublicKey::from_bytes(bytes))
            })
            .collect::<Result<Vec<_>, GreetMessageError>>()?;

        let nonces = reader
            .pop_all(TlvType::Nonce)?
            .into_iter()
            .map(<[u8]>::to_vec)
            .collect();

        let pub_keys = reader
            .pop_all(TlvType::PubKey)?
            .into_iter()
            .map(|bytes| {
                let bytes: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| GreetMessageError::InvalidKeyLength(bytes.len()))?;
                Ok(VerifyingKey::from_bytes(bytes))
            })
            .collect::<Result<Vec<_>, GreetMessageError>>()?;

        let metadata = match reader.pop_maybe(TlvType::PrevPf)? {
            Some(prev_pf) => {
                let prev_chain_hash = reader.pop(TlvType::ChainHash)?.to_vec();
                let parents = reader
                    .pop_all(TlvType::LatestPm)?
                    .into_iter()
                    .map(<[u8]>::to_vec)
                    .collect();
                Some(GreetingMetadata {
                    prev_pf: prev_pf.to_vec(),
                    prev_chain_hash,
                    parents,
                })
            }
            None => None,
        };

        let session_signature = reader
            .pop_maybe(TlvType::SessionSignature)?
            .map(<[u8]>::to_vec);

        let signing_key = reader
            .pop_maybe(TlvType::SigningKey)?
            .map(|bytes| {
                let bytes: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| GreetMessageError::InvalidKeyLength(bytes.len()))?;
                Ok::<SigningKey, GreetMessageError>(SigningKey::from_bytes(bytes))
            })
            .transpose()?;

        if !reader.is_empty() {
            return Err(GreetMessageError::Tlv(TlvError::TrailingBytes(
                reader.remaining().len(),
            )));
        }

        Ok(GreetMessage {
            source,
            dest,
            greet_type,
            members,
            int_keys,
            nonces,
            pub_keys,
            session_signature,
            signing_key,
            metadata,
            signature: Some(signature),
        })
    }

    /// Partially decodes only the type and routing fields, skipping the
    /// rest of the packet.
    pub fn peek_header(payload: &[u8]) -> Result<GreetHeader, GreetMessageError> {
        let mut reader = TlvReader::new(payload);
        reader.pop_until(TlvType::GreetType)?;
        let greet_type = decode_greet_type(reader.pop(TlvType::GreetType)?)?;
        let source = decode_utf8(reader.pop(TlvType::Source)?)?;
        let dest = decode_utf8(reader.pop(TlvType::Dest)?)?;
        Ok(GreetHeader {
            greet_type,
            source,
            dest,
        })
    }

    pub fn is_downflow(&self) -> bool {
        self.greet_type.is_downflow()
    }

    pub fn is_initiator(&self) -> bool {
        self.greet_type.is_initiator()
    }
}

/// The byte string a greet-message signature is computed over.
fn signature_input(content: &[u8]) -> Vec<u8> {
    let mut input = GREET_MESSAGE_SIGNATURE_PREFIX.to_vec();
    input.extend_from_slice(content);
    input
}

fn decode_greet_type(bytes: &[u8]) -> Result<GreetType, GreetMessageError> {
    let bytes: [u8; 2] = bytes
        .try_into()
        .map_err(|_| GreetMessageError::InvalidGreetTypeLength(bytes.len()))?;
    Ok(GreetType::from_bits(u16::from_be_bytes(bytes))?)
}

fn decode_utf8(bytes: &[u8]) -> Result<String, GreetMessageError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| GreetMessageError::InvalidUtf8)
}

#[derive(Debug, Error)]
pub enum GreetMessageError {
    #[error(transparent)]
    Tlv(#[from] TlvError),

    #[error(transparent)]
    GreetType(#[from] crate::greet::GreetTypeError),

    #[error(transparent)]
    Signature(SignatureError),

    #[error("unsupported protocol version {0:02x?}")]
    UnsupportedVersion(Vec<u8>),

    #[error("payload is not a greet message")]
    NotAGreetMessage,

    #[error("greet type record must be 2 bytes, got {0}")]
    InvalidGreetTypeLength(usize),

    #[error("key record must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("text record is not valid utf-8")]
    InvalidUtf8,

    #[error("message carries no detached signature")]
    MissingSignature,

    #[error("greet message signature does not verify against sender key")]
    BadSignature,
}
