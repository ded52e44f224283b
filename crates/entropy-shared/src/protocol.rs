//! Payload codec for decrypted envelopes.
//!
//! Every envelope body is a UTF-8 JSON object whose `type` field selects one
//! of the [`Payload`] variants.  Decoding is strict about the discriminant and
//! the required fields of each variant but tolerates unknown extra fields, so
//! newer senders can add data without breaking older clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{
    TYPE_BLOCK_SYNC, TYPE_CHUNKED_FILE_INIT, TYPE_FILE_CHUNK, TYPE_PLAIN_MESSAGE, TYPE_SYNC_ECHO,
};
use crate::error::CodecError;
use crate::types::{FileId, IdentityHash};

/// All payloads a peer (or one of our own devices) can deliver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Payload {
    /// Ordinary text message from the sender
    #[serde(rename = "msg")]
    PlainMessage(PlainMessage),

    /// Copy of a message the local user sent from another device
    #[serde(rename = "sync_msg")]
    SyncEcho(SyncEcho),

    /// Block-list change made on another of the user's devices
    #[serde(rename = "block_sync")]
    BlockSync(BlockSync),

    /// Announces an attachment that will arrive as separate chunks
    #[serde(rename = "file_chunked_v1")]
    ChunkedFileInit(ChunkedFileInit),

    /// One encrypted chunk of a previously announced attachment
    #[serde(rename = "file_chunk")]
    FileChunk(FileChunk),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainMessage {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Sender clock, epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEcho {
    /// Peer the original message was addressed to
    pub destination: IdentityHash,
    pub content: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockSync {
    pub peer_hash: IdentityHash,
    pub is_blocked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkedFileInit {
    pub id: FileId,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub total_chunks: u32,
    #[serde(alias = "decryptionBundle")]
    pub bundle: MediaBundle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    pub file_id: FileId,
    pub index: u32,
    /// Chunk ciphertext (base64 on the wire)
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Key material for the chunks of one attachment.  Opaque to the codec; only
/// the media decryption delegate interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaBundle {
    pub key_b64: String,
    pub nonce_b64: String,
}

impl Payload {
    /// Wire discriminant of this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::PlainMessage(_) => TYPE_PLAIN_MESSAGE,
            Payload::SyncEcho(_) => TYPE_SYNC_ECHO,
            Payload::BlockSync(_) => TYPE_BLOCK_SYNC,
            Payload::ChunkedFileInit(_) => TYPE_CHUNKED_FILE_INIT,
            Payload::FileChunk(_) => TYPE_FILE_CHUNK,
        }
    }

    /// Serialize to the JSON wire text
    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|e| CodecError::Serialization(e.to_string()))
    }

    /// Parse decrypted envelope text
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))?;

        let object = value
            .as_object()
            .ok_or_else(|| CodecError::Malformed("expected a JSON object".to_string()))?;

        let kind = match object.get("type") {
            Some(Value::String(kind)) => known_kind(kind)?,
            Some(_) | None => return Err(CodecError::MissingType),
        };

        let payload: Payload =
            serde_json::from_value(value).map_err(|e| CodecError::InvalidField {
                kind,
                reason: e.to_string(),
            })?;

        if let Payload::ChunkedFileInit(init) = &payload {
            if init.total_chunks == 0 {
                return Err(CodecError::ZeroChunks);
            }
        }

        Ok(payload)
    }
}

/// Free-function form of [`Payload::decode`].
pub fn decode(text: &str) -> Result<Payload, CodecError> {
    Payload::decode(text)
}

/// Free-function form of [`Payload::encode`].
pub fn encode(payload: &Payload) -> Result<String, CodecError> {
    payload.encode()
}

fn known_kind(kind: &str) -> Result<&'static str, CodecError> {
    [
        TYPE_PLAIN_MESSAGE,
        TYPE_SYNC_ECHO,
        TYPE_BLOCK_SYNC,
        TYPE_CHUNKED_FILE_INIT,
        TYPE_FILE_CHUNK,
    ]
    .into_iter()
    .find(|known| *known == kind)
    .ok_or_else(|| CodecError::UnknownType(kind.to_string()))
}

/// Convert an optional sender timestamp (epoch ms) into a UTC instant.
pub fn sent_at(timestamp: Option<i64>) -> Option<DateTime<Utc>> {
    timestamp.and_then(DateTime::<Utc>::from_timestamp_millis)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
