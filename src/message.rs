// SPDX-License-Identifier: MIT OR Apache-2.0

//! Authenticated encryption and verification of in-session data payloads.
//!
//! A data payload is signed with the sender's ephemeral Ed25519 key,
//! encrypted with AES-128-CTR under the first half of the group key, and
//! length-padded to blunt traffic analysis. A one-byte session hint derived
//! from the session id and group key lets receivers pick the right session
//! before verifying.
use thiserror::Error;

use crate::codec::{
    MessageType, TlvError, TlvReader, TlvType, TlvWriter, DATA_MESSAGE_SIGNATURE_PREFIX,
    PROTOCOL_VERSION,
};
use crate::crypto::aes_ctr::{self, AesCtrError};
use crate::crypto::ed25519::{Signature, SigningKey, VerifyingKey};
use crate::crypto::sha2::sha2_256;
use crate::crypto::{Rng, RngError, Secret};
use crate::greet::GreetStore;

/// A decrypted and verified data message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub author: String,
    /// Opaque parent pointers; their causal meaning belongs to a layer above
    /// the engine.
    pub parents: Vec<Vec<u8>>,
    /// Session members the message was readable by, the author excepted.
    pub readers: Vec<String>,
    pub body: String,
}

/// Data-message protection derived from a completed session.
#[derive(Debug)]
pub struct MessageSecurity {
    members: Vec<String>,
    session_id: [u8; 32],
    group_key: Secret<32>,
    sidkey_hash: [u8; 32],
    ephemeral_key: SigningKey,
    ephemeral_pub_keys: Vec<VerifyingKey>,
    /// Padding quantum; zero disables padding.
    padding_size: usize,
}

impl MessageSecurity {
    /// Builds the protection layer from a READY session store.
    pub fn new(store: &GreetStore, padding_size: usize) -> Result<Self, MessageError> {
        if !store.is_ready() {
            return Err(MessageError::SessionNotReady);
        }
        let session_id = *store.session_id().ok_or(MessageError::SessionNotReady)?;
        let group_key = store.group_key().ok_or(MessageError::SessionNotReady)?;
        let ephemeral_key = store
            .ephemeral_key()
            .ok_or(MessageError::SessionNotReady)?
            .clone();

        let sidkey_hash = sha2_256(&[&session_id, group_key.expose()]);

        Ok(Self {
            members: store.members().to_vec(),
            session_id,
            group_key: group_key.clone(),
            sidkey_hash,
            ephemeral_key,
            ephemeral_pub_keys: store
                .members()
                .iter()
                .filter_map(|member| store.ephemeral_pub_key(member))
                .copied()
                .collect(),
            padding_size,
        })
    }

    pub fn session_id(&self) -> &[u8; 32] {
        &self.session_id
    }

    /// Signs, encrypts and packages a payload, returning the TLV packet.
    pub fn auth_encrypt(
        &self,
        parents: &[Vec<u8>],
        body: &str,
        rng: &Rng,
    ) -> Result<Vec<u8>, MessageError> {
        // Inner record stream: parent pointers, then the body.
        let mut inner = TlvWriter::new();
        for parent in parents {
            inner.push(TlvType::MessageParent, parent)?;
        }
        inner.push(TlvType::MessageBody, body.as_bytes())?;
        let inner = inner.into_bytes();

        // Length-prefix and zero-pad to the next power-of-two multiple of
        // the padding quantum.
        let cleartext_len =
            u16::try_from(inner.len()).map_err(|_| TlvError::ValueTooLong(inner.len()))?;
        let mut cleartext = cleartext_len.to_be_bytes().to_vec();
        cleartext.extend_from_slice(&inner);
        if self.padding_size > 0 {
            cleartext.resize(padded_size(cleartext.len(), self.padding_size), 0);
        }

        let nonce: [u8; aes_ctr::NONCE_SIZE] = rng.random_array()?;
        let ciphertext = aes_ctr::encrypt(
            &self.group_key.expose()[..aes_ctr::KEY_SIZE],
            &nonce,
            &cleartext,
        )?;

        let mut content = TlvWriter::new();
        content.push(TlvType::ProtocolVersion, &[PROTOCOL_VERSION])?;
        content.push(TlvType::MessageType, &[MessageType::Data as u8])?;
        content.push(TlvType::MessageIv, &nonce)?;
        content.push(TlvType::MessagePayload, &ciphertext)?;
        let content = content.into_bytes();

        let signature = self.ephemeral_key.sign(&self.signature_input(&content));

        let mut packet = TlvWriter::new();
        packet.push(TlvType::SidkeyHint, &self.sidkey_hash[..1])?;
        packet.push(TlvType::MessageSignature, signature.as_bytes())?;
        packet.extend_raw(&content);
        Ok(packet.into_bytes())
    }

    /// Verifies and decrypts an inbound data packet from `author_hint`.
    pub fn decrypt_verify(
        &self,
        payload: &[u8],
        author_hint: &str,
    ) -> Result<ReceivedMessage, MessageError> {
        let position = self
            .members
            .iter()
            .position(|member| member == author_hint)
            .ok_or_else(|| MessageError::UnknownAuthor(author_hint.to_string()))?;
        let author_key = self
            .ephemeral_pub_keys
            .get(position)
            .ok_or_else(|| MessageError::UnknownAuthor(author_hint.to_string()))?;

        let mut reader = TlvReader::new(payload);
        let _hint = reader.pop(TlvType::SidkeyHint)?;
        let signature = Signature::from_slice(reader.pop(TlvType::MessageSignature)?)
            .map_err(|_| MessageError::BadSignature)?;
        let content = reader.remaining();

        author_key
            .verify(&self.signature_input(content), &signature)
            .map_err(|_| MessageError::BadSignature)?;

        let version = reader.pop(TlvType::ProtocolVersion)?;
        if version != [PROTOCOL_VERSION] {
            return Err(MessageError::UnsupportedVersion(version.to_vec()));
        }
        let category = reader.pop(TlvType::MessageType)?;
        if category != [MessageType::Data as u8] {
            return Err(MessageError::NotADataMessage);
        }
        let nonce = reader.pop(TlvType::MessageIv)?;
        let ciphertext = reader.pop(TlvType::MessagePayload)?;

        let cleartext = aes_ctr::decrypt(
            &self.group_key.expose()[..aes_ctr::KEY_SIZE],
            nonce,
            ciphertext,
        )?;

        // Strip the length prefix and the zero padding.
        if cleartext.len() < 2 {
            return Err(MessageError::TruncatedCleartext(cleartext.len()));
        }
        let inner_len = u16::from_be_bytes([cleartext[0], cleartext[1]]) as usize;
        let inner = cleartext
            .get(2..2 + inner_len)
            .ok_or(MessageError::TruncatedCleartext(cleartext.len()))?;

        let mut inner_reader = TlvReader::new(inner);
        let parents = inner_reader
            .pop_all(TlvType::MessageParent)?
            .into_iter()
            .map(<[u8]>::to_vec)
            .collect();
        let body = String::from_utf8(inner_reader.pop(TlvType::MessageBody)?.to_vec())
            .map_err(|_| MessageError::InvalidUtf8)?;

        let readers = self
            .members
            .iter()
            .filter(|member| member.as_str() != author_hint)
            .cloned()
            .collect();

        Ok(ReceivedMessage {
            author: author_hint.to_string(),
            parents,
            readers,
            body,
        })
    }

    fn signature_input(&self, content: &[u8]) -> Vec<u8> {
        let mut input = DATA_MESSAGE_SIGNATURE_PREFIX.to_vec();
        input.extend_from_slice(&self.sidkey_hash);
        input.extend_from_slice(content);
        input
    }
}

/// Smallest power-of-two multiple of `quantum` that holds `len` bytes.
fn padded_size(len: usize, quantum: usize) -> usize {
    let mut size = quantum;
    while size < len {
        size *= 2;
    }
    size
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Tlv(#[from] TlvError),

    #[error(transparent)]
    Cipher(#[from] AesCtrError),

    #[error("session store is not ready")]
    SessionNotReady,

    #[error("no known ephemeral key for author {0}")]
    UnknownAuthor(String),

    #[error("signature of received message invalid")]
    BadSignature,

    #[error("unsupported protocol version {0:02x?}")]
    UnsupportedVersion(Vec<u8>),

    #[error("payload is not a data message")]
    NotADataMessage,

    #[error("cleartext of {0} bytes is shorter than its length prefix")]
    TruncatedCleartext(usize),

    #[error("message body is not valid utf-8")]
    InvalidUtf8,
}
