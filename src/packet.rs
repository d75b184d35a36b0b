//! # Signed Wire Packets
//!
//! A [`Packet`] is the optional application-level envelope carried on top of
//! the relay transport. The relay engine never looks inside it; producers
//! build, sign and serialize packets, consumers deserialize and must call
//! [`Packet::verify`] before trusting the author.
//!
//! ## Wire Layout
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 16 | Fixed prefix [`PACKET_PREFIX`] |
//! | 16 | 4 | `channel_id`, big-endian |
//! | 20 | .. | MessagePack array: version, message id, author, body, utf8 flag, encryption scheme, signature |
//!
//! The version string must be exactly [`PROTOCOL_VERSION`]. A mismatch is
//! reported as [`PacketError::IncompatibleProtocolVersion`], separate from
//! generic decode failures, so consumers can ignore packets from other
//! protocol generations without treating them as corrupt.
//!
//! ## Signatures
//!
//! Signatures cover `message_id || body` and are produced by the
//! [`Keystore`] entry for `author_id`. Changing the body drops the signature
//! and assigns a new message id.

use std::fmt;

use serde::de::{self, IgnoredAny, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_bytes::ByteBuf;
use uuid::Uuid;

use crate::keystore::{Keystore, KeystoreError, SIGNATURE_LENGTH};

/// Magic bytes every serialized packet starts with.
pub const PACKET_PREFIX: [u8; 16] = [
    0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF, 0xFE, 0xDC, 0xBA, 0x98, 0x76, 0x54, 0x32, 0x10,
];

/// The only protocol version this crate reads and writes.
pub const PROTOCOL_VERSION: &str = "v1-pre4";

/// Shortest input `Packet::deserialize` will attempt to decode.
pub const MIN_PACKET_LENGTH: usize = 96;

/// Prefix plus big-endian channel id.
const HEADER_LENGTH: usize = PACKET_PREFIX.len() + 4;

const TAIL_FIELDS: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("invalid packet: {0}")]
    Construction(&'static str),
    #[error("cannot serialize packet: {0}")]
    Serialization(&'static str),
    #[error("cannot deserialize packet: {0}")]
    Deserialization(String),
    #[error("protocol version {found:?} incompatible with version {PROTOCOL_VERSION:?}")]
    IncompatibleProtocolVersion { found: String },
    #[error("packet has no signature")]
    Unsigned,
    #[error(transparent)]
    Keystore(#[from] KeystoreError),
}

/// Body supplied to a packet constructor.
///
/// Text bodies are stored as UTF-8 and mark the packet `utf8_encoded` unless
/// an encryption scheme is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    Text(String),
    Bytes(Vec<u8>),
}

impl PacketBody {
    fn into_parts(self) -> (Vec<u8>, bool) {
        match self {
            Self::Text(text) => (text.into_bytes(), true),
            Self::Bytes(bytes) => (bytes, false),
        }
    }
}

impl From<String> for PacketBody {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for PacketBody {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for PacketBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for PacketBody {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    channel_id: u32,
    message_id: Uuid,
    author_id: String,
    body: Vec<u8>,
    utf8_encoded: bool,
    encryption_scheme: String,
    signature: Option<Vec<u8>>,
}

impl Packet {
    /// Unsigned packet on channel 0 with no encryption scheme.
    pub fn new(author_id: impl Into<String>, body: impl Into<PacketBody>) -> Result<Self, PacketError> {
        Self::new_with(author_id, body, 0, String::new())
    }

    /// Unsigned packet with an explicit channel and encryption scheme.
    ///
    /// `channel_id` is reduced modulo 2^32.
    pub fn new_with(
        author_id: impl Into<String>,
        body: impl Into<PacketBody>,
        channel_id: i64,
        encryption_scheme: impl Into<String>,
    ) -> Result<Self, PacketError> {
        let encryption_scheme = encryption_scheme.into();
        let (body, is_text) = body.into().into_parts();
        let utf8_encoded = is_text && encryption_scheme.is_empty();
        Self::from_parts(
            channel_id,
            Uuid::new_v4(),
            author_id.into(),
            body,
            utf8_encoded,
            encryption_scheme,
            None,
        )
    }

    /// Validating constructor shared by `new_with` and `deserialize`.
    pub fn from_parts(
        channel_id: i64,
        message_id: Uuid,
        author_id: String,
        body: Vec<u8>,
        utf8_encoded: bool,
        encryption_scheme: String,
        signature: Option<Vec<u8>>,
    ) -> Result<Self, PacketError> {
        if author_id.is_empty() {
            return Err(PacketError::Construction("author_id can't be empty"));
        }
        if body.is_empty() {
            return Err(PacketError::Construction("body can't be empty"));
        }
        if !encryption_scheme.is_empty() && utf8_encoded {
            return Err(PacketError::Construction(
                "encryption_scheme is set, but utf8_encoded is true",
            ));
        }
        if signature.as_ref().is_some_and(|sig| sig.len() != SIGNATURE_LENGTH) {
            return Err(PacketError::Construction("signature must be 64 bytes"));
        }
        Ok(Self {
            channel_id: channel_id.rem_euclid(1 << 32) as u32,
            message_id,
            author_id,
            body,
            utf8_encoded,
            encryption_scheme,
            signature,
        })
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn author_id(&self) -> &str {
        &self.author_id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The body as text, when the packet says it is UTF-8.
    pub fn body_text(&self) -> Option<&str> {
        if self.utf8_encoded {
            std::str::from_utf8(&self.body).ok()
        } else {
            None
        }
    }

    pub fn utf8_encoded(&self) -> bool {
        self.utf8_encoded
    }

    pub fn encryption_scheme(&self) -> &str {
        &self.encryption_scheme
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Replace the body. Drops the signature and assigns a new message id.
    pub fn set_body(&mut self, body: impl Into<PacketBody>) -> Result<(), PacketError> {
        let (body, is_text) = body.into().into_parts();
        if body.is_empty() {
            return Err(PacketError::Construction("body can't be empty"));
        }
        self.signature = None;
        self.message_id = Uuid::new_v4();
        self.utf8_encoded = is_text && self.encryption_scheme.is_empty();
        self.body = body;
        Ok(())
    }

    fn signed_payload(&self) -> Vec<u8> {
        let id = self.message_id.as_bytes();
        let mut payload = Vec::with_capacity(id.len() + self.body.len());
        payload.extend_from_slice(id);
        payload.extend_from_slice(&self.body);
        payload
    }

    /// Sign `message_id || body` with the author's key from `keystore`.
    pub fn sign(&mut self, keystore: &Keystore) -> Result<(), PacketError> {
        let signature = keystore.sign(&self.author_id, &self.signed_payload())?;
        self.signature = Some(signature.to_vec());
        Ok(())
    }

    /// Check the stored signature. `Ok(false)` means inauthentic.
    pub fn verify(&self, keystore: &Keystore) -> Result<bool, PacketError> {
        let signature = self.signature.as_deref().ok_or(PacketError::Unsigned)?;
        Ok(keystore.verify(&self.author_id, &self.signed_payload(), signature)?)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        let signature = self
            .signature
            .as_deref()
            .ok_or(PacketError::Serialization("signature missing"))?;
        if signature.len() != SIGNATURE_LENGTH {
            return Err(PacketError::Serialization("signature length invalid"));
        }

        let tail = WireTail {
            protocol_version: PROTOCOL_VERSION,
            message_id: self.message_id.as_bytes(),
            author_id: &self.author_id,
            body: &self.body,
            utf8_encoded: self.utf8_encoded,
            encryption_scheme: &self.encryption_scheme,
            signature,
        };
        let encoded = rmp_serde::to_vec(&tail)
            .map_err(|_| PacketError::Serialization("field encoding failed"))?;

        let mut out = Vec::with_capacity(HEADER_LENGTH + encoded.len());
        out.extend_from_slice(&PACKET_PREFIX);
        out.extend_from_slice(&self.channel_id.to_be_bytes());
        out.extend_from_slice(&encoded);
        Ok(out)
    }

    /// Decode a packet. Does not check the signature.
    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < MIN_PACKET_LENGTH {
            return Err(PacketError::Deserialization(format!(
                "need at least {MIN_PACKET_LENGTH} bytes, got {}",
                data.len()
            )));
        }
        if data[..PACKET_PREFIX.len()] != PACKET_PREFIX {
            return Err(PacketError::Deserialization("prefix mismatch".into()));
        }
        let mut channel_bytes = [0u8; 4];
        channel_bytes.copy_from_slice(&data[PACKET_PREFIX.len()..HEADER_LENGTH]);
        let channel_id = u32::from_be_bytes(channel_bytes);

        let mut rest = &data[HEADER_LENGTH..];
        let decoded = DecodedTail::deserialize(&mut rmp_serde::Deserializer::new(&mut rest))
            .map_err(|e| PacketError::Deserialization(e.to_string()))?;
        if !rest.is_empty() {
            return Err(PacketError::Deserialization(format!(
                "{} trailing bytes after packet fields",
                rest.len()
            )));
        }

        let fields = match decoded {
            DecodedTail::Current(fields) => fields,
            DecodedTail::Foreign(found) => {
                return Err(PacketError::IncompatibleProtocolVersion { found });
            }
        };
        let message_id = Uuid::from_slice(&fields.message_id)
            .map_err(|_| PacketError::Deserialization("message id must be 16 bytes".into()))?;

        Self::from_parts(
            i64::from(channel_id),
            message_id,
            fields.author_id,
            fields.body,
            fields.utf8_encoded,
            fields.encryption_scheme,
            Some(fields.signature),
        )
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("channel_id", &self.channel_id)
            .field("message_id", &self.message_id)
            .field("author_id", &self.author_id)
            .field("body_len", &self.body.len())
            .field("utf8_encoded", &self.utf8_encoded)
            .field("encryption_scheme", &self.encryption_scheme)
            .field("signature", &self.signature.as_ref().map(hex::encode))
            .finish()
    }
}

// ============================================================================
// MessagePack tail
// ============================================================================

/// Encoded as a positional MessagePack array by `rmp_serde::to_vec`.
#[derive(Serialize)]
struct WireTail<'a> {
    protocol_version: &'a str,
    #[serde(with = "serde_bytes")]
    message_id: &'a [u8],
    author_id: &'a str,
    #[serde(with = "serde_bytes")]
    body: &'a [u8],
    utf8_encoded: bool,
    encryption_scheme: &'a str,
    #[serde(with = "serde_bytes")]
    signature: &'a [u8],
}

struct TailFields {
    message_id: Vec<u8>,
    author_id: String,
    body: Vec<u8>,
    utf8_encoded: bool,
    encryption_scheme: String,
    signature: Vec<u8>,
}

/// The version is read first; the remaining fields are only interpreted
/// when it matches ours.
enum DecodedTail {
    Current(TailFields),
    Foreign(String),
}

impl<'de> Deserialize<'de> for DecodedTail {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_seq(TailVisitor)
    }
}

struct TailVisitor;

fn required<'de, A, T>(seq: &mut A, index: usize) -> Result<T, A::Error>
where
    A: SeqAccess<'de>,
    T: Deserialize<'de>,
{
    seq.next_element()?
        .ok_or_else(|| de::Error::invalid_length(index, &"7 packet fields"))
}

impl<'de> Visitor<'de> for TailVisitor {
    type Value = DecodedTail;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array of packet fields")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let version: String = required(&mut seq, 0)?;
        if version != PROTOCOL_VERSION {
            while seq.next_element::<IgnoredAny>()?.is_some() {}
            return Ok(DecodedTail::Foreign(version));
        }

        let message_id: ByteBuf = required(&mut seq, 1)?;
        let author_id: String = required(&mut seq, 2)?;
        let body: ByteBuf = required(&mut seq, 3)?;
        let utf8_encoded: bool = required(&mut seq, 4)?;
        let encryption_scheme: String = required(&mut seq, 5)?;
        let signature: ByteBuf = required(&mut seq, 6)?;
        if seq.next_element::<IgnoredAny>()?.is_some() {
            return Err(de::Error::invalid_length(TAIL_FIELDS + 1, &"7 packet fields"));
        }

        Ok(DecodedTail::Current(TailFields {
            message_id: message_id.into_vec(),
            author_id,
            body: body.into_vec(),
            utf8_encoded,
            encryption_scheme,
            signature: signature.into_vec(),
        }))
    }
}
