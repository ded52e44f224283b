//! # entropy-store
//!
//! State owned by the Entropy inbound core: the mutation-ordered conversation
//! store (chats, messages, block list) with snapshot/subscribe access for the
//! UI, and the attachment blob store that receives reassembled files.

pub mod blobs;
pub mod conversations;
pub mod models;

mod error;

pub use blobs::{AttachmentBlobStore, FsBlobStore, MemoryBlobStore};
pub use conversations::ConversationStore;
pub use error::StoreError;
pub use models::*;
