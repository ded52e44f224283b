//! Conversation state held by the [`ConversationStore`](crate::ConversationStore).
//!
//! Every struct derives `Serialize` and `Deserialize` (camelCase) so a
//! snapshot can be handed directly to the UI layer.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use entropy_shared::types::{FileId, IdentityHash};

// ---------------------------------------------------------------------------
// ChatState
// ---------------------------------------------------------------------------

/// Everything the inbound core mutates: conversations and the block list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatState {
    /// Identity hash of the local user.
    pub identity_hash: IdentityHash,
    /// Conversations keyed by peer identity.
    pub chats: HashMap<IdentityHash, Conversation>,
    /// Blocked peer identities.
    pub blocked: BTreeSet<IdentityHash>,
}

impl ChatState {
    pub fn new(identity_hash: IdentityHash) -> Self {
        Self {
            identity_hash,
            chats: HashMap::new(),
            blocked: BTreeSet::new(),
        }
    }

    pub fn conversation(&self, peer: &IdentityHash) -> Option<&Conversation> {
        self.chats.get(peer)
    }

    pub fn is_blocked(&self, peer: &IdentityHash) -> bool {
        self.blocked.contains(peer)
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A one-to-one (or group) conversation with a peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub peer_hash: IdentityHash,
    /// Display alias; empty until the user names the peer.
    pub peer_alias: String,
    /// Messages in arrival order.
    pub messages: Vec<Message>,
    pub unread_count: u32,
    pub is_verified: bool,
    pub is_group: bool,
}

impl Conversation {
    pub fn new(peer_hash: IdentityHash) -> Self {
        Self {
            peer_hash,
            peer_alias: String::new(),
            messages: Vec::new(),
            unread_count: 0,
            is_verified: false,
            is_group: false,
        }
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message.  Immutable once appended, except for the
/// attachment completion fields and the display content that goes with them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub content: String,
    /// `true` when the local user (on any device) wrote this message.
    pub is_mine: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentRef>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// AttachmentRef
// ---------------------------------------------------------------------------

/// Attachment metadata carried by a message.  `is_complete` flips to `true`
/// once, when every chunk has arrived, and never reverts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub file_id: FileId,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub is_chunked: bool,
    pub is_complete: bool,
}
