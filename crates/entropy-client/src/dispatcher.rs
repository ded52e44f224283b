//! Inbound envelope dispatcher.
//!
//! Turns one decrypted envelope into its effect on conversation state:
//! decode the payload, decide provenance, drive the reassembler and apply the
//! resulting store mutation.  Malformed, spoofed or out-of-order payloads are
//! logged and dropped; the only error reported upward is a store conflict,
//! which indicates a concurrency bug rather than bad input.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use entropy_shared::constants::{FILE_CONTENT_PREFIX, RECEIVING_CONTENT_PREFIX};
use entropy_shared::error::CodecError;
use entropy_shared::protocol::{
    self, BlockSync, ChunkedFileInit, FileChunk, Payload, PlainMessage, SyncEcho,
};
use entropy_shared::types::{FileId, IdentityHash};
use entropy_store::{AttachmentBlobStore, AttachmentRef, ConversationStore, Message, StoreError};

use crate::config::InboxConfig;
use crate::decryption::DecryptionService;
use crate::error::{DecryptError, DispatchError, ReassemblyError};
use crate::reassembler::{ChunkOutcome, FileOpening, OpenOutcome, Reassembler, ReassemblyLimits};

/// One envelope as delivered by the transport, still encrypted.
#[derive(Debug, Clone)]
pub struct InboundEnvelope {
    pub sender: IdentityHash,
    pub body: Vec<u8>,
}

/// What handling an envelope did.
#[derive(Debug)]
pub enum Disposition {
    /// A new message was filed under `peer`.
    Appended {
        peer: IdentityHash,
        message_id: String,
    },
    /// The message (or attachment announcement) was already present.
    Duplicate {
        peer: IdentityHash,
        message_id: String,
    },
    BlockListUpdated {
        peer: IdentityHash,
        blocked: bool,
        changed: bool,
    },
    AttachmentOpened {
        peer: IdentityHash,
        file_id: FileId,
    },
    ChunkAccepted {
        file_id: FileId,
        received: u32,
        total: u32,
    },
    /// Last chunk arrived; the message is marked complete.  A blob store
    /// failure does not undo that and is only reported here.
    AttachmentCompleted {
        peer: IdentityHash,
        file_id: FileId,
        size: usize,
        blob_warning: Option<StoreError>,
    },
    Dropped(DropReason),
}

#[derive(Debug)]
pub enum DropReason {
    Decode(CodecError),
    Decrypt(DecryptError),
    Reassembly(ReassemblyError),
    /// Sync echo from someone other than the local user.
    SpoofedSync { sender: IdentityHash },
    BlockedSender { sender: IdentityHash },
    FileTooLarge { file_id: FileId, size: u64, max: u64 },
    /// Chunk for a file that already completed.
    AlreadyComplete { file_id: FileId },
}

/// Behavioural switches taken from [`InboxConfig`].
#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    pub accept_foreign_sync: bool,
    pub drop_blocked_senders: bool,
    pub max_file_size: u64,
    pub max_in_flight: usize,
}

impl From<&InboxConfig> for DispatchPolicy {
    fn from(config: &InboxConfig) -> Self {
        Self {
            accept_foreign_sync: config.accept_foreign_sync,
            drop_blocked_senders: config.drop_blocked_senders,
            max_file_size: config.max_file_size,
            max_in_flight: config.max_in_flight.max(1),
        }
    }
}

pub struct Dispatcher {
    store: Arc<ConversationStore>,
    reassembler: Reassembler,
    decryption: Arc<dyn DecryptionService>,
    blobs: Arc<dyn AttachmentBlobStore>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    pub fn new(
        store: Arc<ConversationStore>,
        decryption: Arc<dyn DecryptionService>,
        blobs: Arc<dyn AttachmentBlobStore>,
        config: &InboxConfig,
    ) -> Self {
        Self {
            store,
            reassembler: Reassembler::new(ReassemblyLimits::from(config)),
            decryption,
            blobs,
            policy: DispatchPolicy::from(config),
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    /// Decrypt an envelope, then [`handle`](Self::handle) its text.
    pub async fn receive(&self, envelope: InboundEnvelope) -> Result<Disposition, DispatchError> {
        let text = match self
            .decryption
            .decrypt(&envelope.sender, &envelope.body)
            .await
        {
            Ok(t) => t,
            Err(e) => {
                warn!(sender = %envelope.sender.short(), error = %e, "Envelope decryption failed, dropping");
                return Ok(Disposition::Dropped(DropReason::Decrypt(e)));
            }
        };

        self.handle(&envelope.sender, &text).await
    }

    /// Apply one decrypted envelope from `sender`.
    pub async fn handle(
        &self,
        sender: &IdentityHash,
        text: &str,
    ) -> Result<Disposition, DispatchError> {
        let payload = match protocol::decode(text) {
            Ok(p) => p,
            Err(e) => {
                warn!(sender = %sender.short(), error = %e, "Undecodable payload, dropping");
                return Ok(Disposition::Dropped(DropReason::Decode(e)));
            }
        };

        debug!(sender = %sender.short(), kind = payload.kind(), "Dispatching payload");

        match payload {
            Payload::PlainMessage(msg) => Ok(self.on_plain_message(sender, msg).await),
            Payload::SyncEcho(echo) => Ok(self.on_sync_echo(sender, echo).await),
            Payload::BlockSync(block) => Ok(self.on_block_sync(sender, block).await),
            Payload::ChunkedFileInit(init) => Ok(self.on_chunked_init(sender, init).await),
            Payload::FileChunk(chunk) => self.on_file_chunk(chunk).await,
        }
    }

    /// Process envelopes from `rx` until the channel closes, at most
    /// `max_in_flight` at a time.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<InboundEnvelope>) {
        let mut tasks = JoinSet::new();
        info!(max_in_flight = self.policy.max_in_flight, "Inbound dispatcher started");

        while let Some(envelope) = rx.recv().await {
            while tasks.len() >= self.policy.max_in_flight {
                reap(tasks.join_next().await);
            }

            let dispatcher = self.clone();
            tasks.spawn(async move { dispatcher.receive(envelope).await });
        }

        while let Some(result) = tasks.join_next().await {
            reap(Some(result));
        }

        info!("Inbound dispatcher stopped");
    }

    async fn sender_blocked(&self, sender: &IdentityHash) -> bool {
        self.policy.drop_blocked_senders && self.store.is_blocked(sender).await
    }

    async fn on_plain_message(&self, sender: &IdentityHash, msg: PlainMessage) -> Disposition {
        if self.sender_blocked(sender).await {
            debug!(sender = %sender.short(), "Message from blocked peer dropped");
            return Disposition::Dropped(DropReason::BlockedSender {
                sender: sender.clone(),
            });
        }

        let message = Message {
            id: msg.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            content: msg.content,
            is_mine: false,
            attachment: None,
            timestamp: protocol::sent_at(msg.timestamp).unwrap_or_else(Utc::now),
        };

        self.append(sender.clone(), message).await
    }

    async fn on_sync_echo(&self, sender: &IdentityHash, echo: SyncEcho) -> Disposition {
        if sender != self.store.local_identity() && !self.policy.accept_foreign_sync {
            warn!(sender = %sender.short(), "Sync echo from foreign identity dropped");
            return Disposition::Dropped(DropReason::SpoofedSync {
                sender: sender.clone(),
            });
        }

        let message = Message {
            id: echo.id,
            content: echo.content,
            is_mine: true,
            attachment: None,
            timestamp: protocol::sent_at(echo.timestamp).unwrap_or_else(Utc::now),
        };

        // filed under the peer the message went to, not under the sender
        self.append(echo.destination, message).await
    }

    async fn on_block_sync(&self, sender: &IdentityHash, block: BlockSync) -> Disposition {
        let changed = self.store.set_blocked(&block.peer_hash, block.is_blocked).await;

        info!(
            sender = %sender.short(),
            peer = %block.peer_hash.short(),
            blocked = block.is_blocked,
            changed,
            "Block list synced"
        );

        Disposition::BlockListUpdated {
            peer: block.peer_hash,
            blocked: block.is_blocked,
            changed,
        }
    }

    async fn on_chunked_init(&self, sender: &IdentityHash, init: ChunkedFileInit) -> Disposition {
        if self.sender_blocked(sender).await {
            debug!(sender = %sender.short(), "Attachment from blocked peer dropped");
            return Disposition::Dropped(DropReason::BlockedSender {
                sender: sender.clone(),
            });
        }

        if init.file_size > self.policy.max_file_size {
            warn!(file_id = %init.id, size = init.file_size, "Announced attachment too large");
            return Disposition::Dropped(DropReason::FileTooLarge {
                file_id: init.id,
                size: init.file_size,
                max: self.policy.max_file_size,
            });
        }

        let limits = self.reassembler.limits();
        if init.total_chunks > limits.max_total_chunks {
            warn!(file_id = %init.id, total = init.total_chunks, "Announced attachment has too many chunks");
            return Disposition::Dropped(DropReason::Reassembly(ReassemblyError::TooManyChunks {
                file_id: init.id,
                total: init.total_chunks,
                max: limits.max_total_chunks,
            }));
        }

        // The message goes in first so a fast final chunk always finds it.
        // Its id is the file id, which makes a replayed init a duplicate.
        let message = Message {
            id: init.id.to_string(),
            content: format!("{RECEIVING_CONTENT_PREFIX}{}", init.file_name),
            is_mine: false,
            attachment: Some(AttachmentRef {
                file_id: init.id.clone(),
                file_name: init.file_name.clone(),
                file_type: init.file_type,
                file_size: init.file_size,
                total_chunks: init.total_chunks,
                is_chunked: true,
                is_complete: false,
            }),
            timestamp: Utc::now(),
        };

        if !self.store.append_message(sender, message).await {
            let existing_is_attachment = self
                .store
                .conversation(sender)
                .await
                .and_then(|c| c.message(init.id.as_str()).map(|m| m.attachment.is_some()));

            if existing_is_attachment == Some(false) {
                warn!(
                    sender = %sender.short(),
                    file_id = %init.id,
                    "Attachment id collides with an existing text message, not opening"
                );
            } else {
                debug!(file_id = %init.id, "Duplicate attachment announcement");
            }
            return Disposition::Duplicate {
                peer: sender.clone(),
                message_id: init.id.to_string(),
            };
        }

        let opening = FileOpening {
            file_id: init.id.clone(),
            owner: sender.clone(),
            file_name: init.file_name,
            file_size: init.file_size,
            total_chunks: init.total_chunks,
            bundle: init.bundle,
        };

        match self.reassembler.open_file(opening).await {
            Ok(OpenOutcome::Opened) => {
                info!(
                    sender = %sender.short(),
                    file_id = %init.id,
                    total = init.total_chunks,
                    "Receiving chunked attachment"
                );
                Disposition::AttachmentOpened {
                    peer: sender.clone(),
                    file_id: init.id,
                }
            }
            Ok(outcome) => {
                self.retract_pending(sender, &init.id).await;
                debug!(file_id = %init.id, ?outcome, "Attachment already tracked");
                Disposition::Duplicate {
                    peer: sender.clone(),
                    message_id: init.id.to_string(),
                }
            }
            Err(e) => {
                self.retract_pending(sender, &init.id).await;
                warn!(file_id = %init.id, error = %e, "Attachment refused");
                Disposition::Dropped(DropReason::Reassembly(e))
            }
        }
    }

    async fn on_file_chunk(&self, chunk: FileChunk) -> Result<Disposition, DispatchError> {
        let outcome = self
            .reassembler
            .submit_chunk(
                &chunk.file_id,
                chunk.index,
                &chunk.data,
                self.decryption.as_ref(),
            )
            .await;

        let file = match outcome {
            Ok(ChunkOutcome::Accepted { received, total }) => {
                debug!(file_id = %chunk.file_id, index = chunk.index, received, total, "Chunk stored");
                return Ok(Disposition::ChunkAccepted {
                    file_id: chunk.file_id,
                    received,
                    total,
                });
            }
            Ok(ChunkOutcome::Ignored) => {
                debug!(file_id = %chunk.file_id, index = chunk.index, "Chunk for completed file ignored");
                return Ok(Disposition::Dropped(DropReason::AlreadyComplete {
                    file_id: chunk.file_id,
                }));
            }
            Ok(ChunkOutcome::Completed(file)) => file,
            Err(e) => {
                warn!(file_id = %chunk.file_id, index = chunk.index, error = %e, "Chunk dropped");
                return Ok(Disposition::Dropped(DropReason::Reassembly(e)));
            }
        };

        let size = file.blob.len();
        let blob_warning = match self.blobs.put(&file.file_id, file.blob).await {
            Ok(()) => None,
            Err(e) => {
                error!(file_id = %file.file_id, error = %e, "Failed to store reassembled attachment");
                Some(e)
            }
        };

        self.store
            .mark_attachment_complete(
                &file.owner,
                file.file_id.as_str(),
                format!("{FILE_CONTENT_PREFIX}{}", file.file_name),
            )
            .await?;

        info!(
            peer = %file.owner.short(),
            file_id = %file.file_id,
            size,
            "Attachment complete"
        );

        Ok(Disposition::AttachmentCompleted {
            peer: file.owner,
            file_id: file.file_id,
            size,
            blob_warning,
        })
    }

    async fn append(&self, peer: IdentityHash, message: Message) -> Disposition {
        let message_id = message.id.clone();
        let is_mine = message.is_mine;

        if self.store.append_message(&peer, message).await {
            debug!(peer = %peer.short(), msg_id = %message_id, is_mine, "Message appended");
            Disposition::Appended { peer, message_id }
        } else {
            Disposition::Duplicate { peer, message_id }
        }
    }

    // Remove an announcement that will never complete.
    async fn retract_pending(&self, peer: &IdentityHash, file_id: &FileId) {
        self.store
            .update(|state| {
                if let Some(conversation) = state.chats.get_mut(peer) {
                    conversation.messages.retain(|m| {
                        m.id != file_id.as_str()
                            || m.attachment.as_ref().map_or(true, |a| a.is_complete)
                    });
                }
            })
            .await;
    }
}

fn reap(result: Option<Result<Result<Disposition, DispatchError>, tokio::task::JoinError>>) {
    match result {
        Some(Ok(Ok(disposition))) => debug!(?disposition, "Envelope processed"),
        Some(Ok(Err(e))) => error!(error = %e, "Envelope processing hit a store conflict"),
        Some(Err(e)) => error!(error = %e, "Envelope task failed"),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use entropy_shared::crypto::{encrypt_media_chunk, generate_bundle, open_bundle};
    use entropy_shared::protocol::MediaBundle;
    use entropy_store::MemoryBlobStore;
    use futures::future::join_all;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    use crate::decryption::ChunkCipherService;

    /// Envelopes are plaintext; chunks decrypt to their ciphertext.
    struct Passthrough;

    #[async_trait]
    impl DecryptionService for Passthrough {
        async fn decrypt(&self, _sender: &IdentityHash, raw: &[u8]) -> Result<String, DecryptError> {
            String::from_utf8(raw.to_vec()).map_err(|e| DecryptError::Envelope(e.to_string()))
        }

        async fn decrypt_media_chunk(
            &self,
            _bundle: &MediaBundle,
            _index: u32,
            ciphertext: &[u8],
        ) -> Result<Vec<u8>, DecryptError> {
            Ok(ciphertext.to_vec())
        }
    }

    struct FailingBlobs;

    #[async_trait]
    impl AttachmentBlobStore for FailingBlobs {
        async fn put(&self, _file_id: &FileId, _data: Bytes) -> Result<(), StoreError> {
            Err(StoreError::BlobStorage("disk full".to_string()))
        }

        async fn get(&self, file_id: &FileId) -> Result<Bytes, StoreError> {
            Err(StoreError::BlobNotFound(file_id.to_string()))
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        blobs: Arc<MemoryBlobStore>,
    }

    fn harness_with(config: InboxConfig, decryption: Arc<dyn DecryptionService>) -> Harness {
        let store = Arc::new(ConversationStore::new(IdentityHash::from("me")));
        let blobs = Arc::new(MemoryBlobStore::new());
        let dispatcher = Dispatcher::new(store, decryption, blobs.clone(), &config);
        Harness { dispatcher, blobs }
    }

    fn harness() -> Harness {
        harness_with(InboxConfig::default(), Arc::new(Passthrough))
    }

    fn me() -> IdentityHash {
        IdentityHash::from("me")
    }

    fn friend() -> IdentityHash {
        IdentityHash::from("friend")
    }

    const INIT_F1: &str = r#"{"type":"file_chunked_v1","id":"f1","fileName":"test.txt",
        "fileType":"text/plain","fileSize":12,"totalChunks":2,
        "bundle":{"key_b64":"k","nonce_b64":"n"}}"#;
    const CHUNK_F1_0: &str = r#"{"type":"file_chunk","fileId":"f1","index":0,"data":"Y2h1bmsx"}"#;
    const CHUNK_F1_1: &str = r#"{"type":"file_chunk","fileId":"f1","index":1,"data":"Y2h1bmsy"}"#;

    #[tokio::test]
    async fn test_plain_message_filed_under_sender() {
        let h = harness();
        let d = h
            .dispatcher
            .handle(&friend(), r#"{"type":"msg","content":"hello","id":"m1"}"#)
            .await
            .unwrap();
        assert!(matches!(d, Disposition::Appended { .. }));

        let chat = h.dispatcher.store().conversation(&friend()).await.unwrap();
        assert_eq!(chat.messages.len(), 1);
        assert_eq!(chat.messages[0].content, "hello");
        assert!(!chat.messages[0].is_mine);
    }

    #[tokio::test]
    async fn test_replayed_plain_message_applied_once() {
        let h = harness();
        let text = r#"{"type":"msg","content":"hello","id":"m1"}"#;
        h.dispatcher.handle(&friend(), text).await.unwrap();
        let d = h.dispatcher.handle(&friend(), text).await.unwrap();

        assert!(matches!(d, Disposition::Duplicate { .. }));
        let chat = h.dispatcher.store().conversation(&friend()).await.unwrap();
        assert_eq!(chat.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_echo_is_mine_under_destination() {
        let h = harness();
        let text = r#"{"type":"sync_msg","destination":"friend","content":"I sent this from my phone","id":"sync123"}"#;
        h.dispatcher.handle(&me(), text).await.unwrap();

        let state = h.dispatcher.store().snapshot().await;
        assert!(!state.chats.contains_key(&me()));
        let chat = &state.chats[&friend()];
        assert_eq!(chat.messages.len(), 1);
        assert_eq!(chat.messages[0].content, "I sent this from my phone");
        assert!(chat.messages[0].is_mine);
        assert_eq!(chat.unread_count, 0);
    }

    #[tokio::test]
    async fn test_foreign_sync_echo_dropped() {
        let h = harness();
        let text = r#"{"type":"sync_msg","destination":"victim","content":"forged","id":"s1"}"#;
        let d = h.dispatcher.handle(&friend(), text).await.unwrap();

        assert!(matches!(d, Disposition::Dropped(DropReason::SpoofedSync { .. })));
        assert!(h.dispatcher.store().snapshot().await.chats.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_sync_echo_accepted_when_configured() {
        let config = InboxConfig {
            accept_foreign_sync: true,
            ..InboxConfig::default()
        };
        let h = harness_with(config, Arc::new(Passthrough));
        let text = r#"{"type":"sync_msg","destination":"friend","content":"hi","id":"s1"}"#;
        let d = h.dispatcher.handle(&IdentityHash::from("my-laptop"), text).await.unwrap();

        assert!(matches!(d, Disposition::Appended { .. }));
    }

    #[tokio::test]
    async fn test_block_sync_idempotent() {
        let h = harness();
        let text = r#"{"type":"block_sync","peerHash":"spammer","isBlocked":true}"#;

        let first = h.dispatcher.handle(&me(), text).await.unwrap();
        assert!(matches!(first, Disposition::BlockListUpdated { changed: true, .. }));
        let second = h.dispatcher.handle(&me(), text).await.unwrap();
        assert!(matches!(second, Disposition::BlockListUpdated { changed: false, .. }));

        let state = h.dispatcher.store().snapshot().await;
        assert!(state.blocked.contains(&IdentityHash::from("spammer")));
        assert_eq!(state.blocked.len(), 1);
    }

    #[tokio::test]
    async fn test_blocked_sender_dropped() {
        let h = harness();
        h.dispatcher
            .handle(&me(), r#"{"type":"block_sync","peerHash":"friend","isBlocked":true}"#)
            .await
            .unwrap();

        let d = h
            .dispatcher
            .handle(&friend(), r#"{"type":"msg","content":"let me in"}"#)
            .await
            .unwrap();
        assert!(matches!(d, Disposition::Dropped(DropReason::BlockedSender { .. })));
        assert!(h.dispatcher.store().conversation(&friend()).await.is_none());
    }

    #[tokio::test]
    async fn test_chunked_file_scenario() {
        let h = harness();

        let d = h.dispatcher.handle(&friend(), INIT_F1).await.unwrap();
        assert!(matches!(d, Disposition::AttachmentOpened { .. }));
        let chat = h.dispatcher.store().conversation(&friend()).await.unwrap();
        let attachment = chat.messages[0].attachment.clone().unwrap();
        assert!(attachment.is_chunked);
        assert!(!attachment.is_complete);
        assert_eq!(attachment.total_chunks, 2);

        h.dispatcher.handle(&friend(), CHUNK_F1_0).await.unwrap();
        let d = h.dispatcher.handle(&friend(), CHUNK_F1_1).await.unwrap();
        match d {
            Disposition::AttachmentCompleted { size, blob_warning, .. } => {
                assert_eq!(size, 12);
                assert!(blob_warning.is_none());
            }
            other => panic!("expected completion, got {other:?}"),
        }

        let blob = h.blobs.get(&FileId::from("f1")).await.unwrap();
        assert_eq!(&blob[..], b"chunk1chunk2");

        let chat = h.dispatcher.store().conversation(&friend()).await.unwrap();
        let msg = chat.message("f1").unwrap();
        assert_eq!(msg.content, "File: test.txt");
        assert!(msg.attachment.as_ref().unwrap().is_complete);
        assert_eq!(h.dispatcher.reassembler().open_files().await, 0);
    }

    #[tokio::test]
    async fn test_chunk_before_init_absorbed() {
        let h = harness();
        let rev = h.dispatcher.store().revision();

        let d = h.dispatcher.handle(&friend(), CHUNK_F1_0).await.unwrap();
        assert!(matches!(
            d,
            Disposition::Dropped(DropReason::Reassembly(ReassemblyError::UnknownFile(_)))
        ));
        assert_eq!(h.dispatcher.store().revision(), rev);
    }

    #[tokio::test]
    async fn test_duplicate_init_creates_one_message() {
        let h = harness();
        h.dispatcher.handle(&friend(), INIT_F1).await.unwrap();
        let d = h.dispatcher.handle(&friend(), INIT_F1).await.unwrap();
        assert!(matches!(d, Disposition::Duplicate { .. }));

        let chat = h.dispatcher.store().conversation(&friend()).await.unwrap();
        assert_eq!(chat.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_replay_after_completion_is_noop() {
        let h = harness();
        for text in [INIT_F1, CHUNK_F1_0, CHUNK_F1_1] {
            h.dispatcher.handle(&friend(), text).await.unwrap();
        }
        let rev = h.dispatcher.store().revision();

        let chunk = h.dispatcher.handle(&friend(), CHUNK_F1_1).await.unwrap();
        assert!(matches!(chunk, Disposition::Dropped(DropReason::AlreadyComplete { .. })));
        let init = h.dispatcher.handle(&friend(), INIT_F1).await.unwrap();
        assert!(matches!(init, Disposition::Duplicate { .. }));

        assert_eq!(h.dispatcher.store().revision(), rev);
        assert_eq!(h.blobs.len().await, 1);
    }

    #[tokio::test]
    async fn test_out_of_range_chunk_dropped() {
        let h = harness();
        h.dispatcher.handle(&friend(), INIT_F1).await.unwrap();

        let d = h
            .dispatcher
            .handle(&friend(), r#"{"type":"file_chunk","fileId":"f1","index":5,"data":"eA=="}"#)
            .await
            .unwrap();
        assert!(matches!(
            d,
            Disposition::Dropped(DropReason::Reassembly(ReassemblyError::OutOfRange { .. }))
        ));
        assert_eq!(
            h.dispatcher.reassembler().progress(&FileId::from("f1")).await,
            Some((0, 2))
        );
    }

    #[tokio::test]
    async fn test_oversized_file_dropped() {
        let config = InboxConfig {
            max_file_size: 4,
            ..InboxConfig::default()
        };
        let h = harness_with(config, Arc::new(Passthrough));

        let d = h.dispatcher.handle(&friend(), INIT_F1).await.unwrap();
        assert!(matches!(d, Disposition::Dropped(DropReason::FileTooLarge { size: 12, .. })));
        assert!(h.dispatcher.store().conversation(&friend()).await.is_none());
    }

    #[tokio::test]
    async fn test_refused_open_retracts_message() {
        let config = InboxConfig {
            max_open_files: 1,
            ..InboxConfig::default()
        };
        let h = harness_with(config, Arc::new(Passthrough));
        h.dispatcher.handle(&friend(), INIT_F1).await.unwrap();

        let second = INIT_F1.replace(r#""id":"f1""#, r#""id":"f2""#);
        let d = h.dispatcher.handle(&friend(), &second).await.unwrap();
        assert!(matches!(
            d,
            Disposition::Dropped(DropReason::Reassembly(ReassemblyError::TooManyOpenFiles { .. }))
        ));

        let chat = h.dispatcher.store().conversation(&friend()).await.unwrap();
        assert_eq!(chat.messages.len(), 1);
        assert_eq!(chat.messages[0].id, "f1");
    }

    #[tokio::test]
    async fn test_undecodable_text_leaves_state_unchanged() {
        let h = harness();
        let before = h.dispatcher.store().snapshot().await;

        for text in ["not json at all", r#"{"content":"no type"}"#, r#"{"type":"typing"}"#] {
            let d = h.dispatcher.handle(&friend(), text).await.unwrap();
            assert!(matches!(d, Disposition::Dropped(DropReason::Decode(_))));
        }

        assert_eq!(h.dispatcher.store().snapshot().await, before);
        assert_eq!(h.dispatcher.store().revision(), 0);
    }

    #[tokio::test]
    async fn test_blob_failure_is_warning() {
        let store = Arc::new(ConversationStore::new(me()));
        let dispatcher = Dispatcher::new(
            store,
            Arc::new(Passthrough),
            Arc::new(FailingBlobs),
            &InboxConfig::default(),
        );

        for text in [INIT_F1, CHUNK_F1_0] {
            dispatcher.handle(&friend(), text).await.unwrap();
        }
        let d = dispatcher.handle(&friend(), CHUNK_F1_1).await.unwrap();
        match d {
            Disposition::AttachmentCompleted { blob_warning, .. } => {
                assert!(matches!(blob_warning, Some(StoreError::BlobStorage(_))));
            }
            other => panic!("expected completion, got {other:?}"),
        }
        let chat = dispatcher.store().conversation(&friend()).await.unwrap();
        assert!(chat.message("f1").unwrap().attachment.as_ref().unwrap().is_complete);
    }

    #[tokio::test]
    async fn test_concurrent_chunks_complete_once() {
        let h = harness();
        let total = 8u32;
        let init = format!(
            r#"{{"type":"file_chunked_v1","id":"big","fileName":"big.bin","fileType":"application/octet-stream",
                "fileSize":64,"totalChunks":{total},"bundle":{{"key_b64":"k","nonce_b64":"n"}}}}"#
        );
        h.dispatcher.handle(&friend(), &init).await.unwrap();

        let chunks: Vec<String> = (0..total)
            .rev()
            .map(|i| {
                Payload::FileChunk(FileChunk {
                    file_id: FileId::from("big"),
                    index: i,
                    data: vec![i as u8; 8],
                })
                .encode()
                .unwrap()
            })
            .collect();

        // every chunk twice, all at once
        let sender = friend();
        let results = join_all(
            chunks
                .iter()
                .chain(chunks.iter())
                .map(|text| h.dispatcher.handle(&sender, text)),
        )
        .await;

        let completions = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Disposition::AttachmentCompleted { .. })))
            .count();
        assert_eq!(completions, 1);

        let expected: Vec<u8> = (0..total).flat_map(|i| vec![i as u8; 8]).collect();
        assert_eq!(h.blobs.get(&FileId::from("big")).await.unwrap().to_vec(), expected);
    }

    #[tokio::test]
    async fn test_receive_with_real_chunk_cipher() {
        let h = harness_with(InboxConfig::default(), Arc::new(ChunkCipherService));
        let bundle = generate_bundle();
        let (key, nonce) = open_bundle(&bundle).unwrap();

        let init = Payload::ChunkedFileInit(ChunkedFileInit {
            id: FileId::from("photo"),
            file_name: "photo.jpg".to_string(),
            file_type: "image/jpeg".to_string(),
            file_size: 10,
            total_chunks: 2,
            bundle,
        });
        let parts: [&[u8]; 2] = [b"hello", b"world"];

        let mut envelopes = vec![init.encode().unwrap()];
        for (i, part) in parts.iter().enumerate().rev() {
            let sealed = encrypt_media_chunk(&key, &nonce, i as u32, part).unwrap();
            envelopes.push(
                Payload::FileChunk(FileChunk {
                    file_id: FileId::from("photo"),
                    index: i as u32,
                    data: sealed,
                })
                .encode()
                .unwrap(),
            );
        }

        let mut last = None;
        for body in envelopes {
            last = Some(
                h.dispatcher
                    .receive(InboundEnvelope {
                        sender: friend(),
                        body: body.into_bytes(),
                    })
                    .await
                    .unwrap(),
            );
        }

        assert!(matches!(last, Some(Disposition::AttachmentCompleted { .. })));
        assert_eq!(
            &h.blobs.get(&FileId::from("photo")).await.unwrap()[..],
            b"helloworld"
        );
    }

    #[tokio::test]
    async fn test_completed_attachment_written_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(
            entropy_store::FsBlobStore::new(dir.path().to_path_buf(), 1024)
                .await
                .unwrap(),
        );
        let dispatcher = Dispatcher::new(
            Arc::new(ConversationStore::new(me())),
            Arc::new(Passthrough),
            blobs.clone(),
            &InboxConfig::default(),
        );

        for text in [INIT_F1, CHUNK_F1_1, CHUNK_F1_0] {
            dispatcher.handle(&friend(), text).await.unwrap();
        }

        let blob = blobs.get(&FileId::from("f1")).await.unwrap();
        assert_eq!(&blob[..], b"chunk1chunk2");
    }

    /// Chunks sealed under a bundle keyed "slow" wait until released;
    /// everything else passes straight through.
    #[derive(Default)]
    struct SlowBundle {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl DecryptionService for SlowBundle {
        async fn decrypt(&self, _sender: &IdentityHash, raw: &[u8]) -> Result<String, DecryptError> {
            String::from_utf8(raw.to_vec()).map_err(|e| DecryptError::Envelope(e.to_string()))
        }

        async fn decrypt_media_chunk(
            &self,
            bundle: &MediaBundle,
            _index: u32,
            ciphertext: &[u8],
        ) -> Result<Vec<u8>, DecryptError> {
            if bundle.key_b64 == "slow" {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(ciphertext.to_vec())
        }
    }

    fn single_chunk_init(id: &str, key: &str) -> String {
        format!(
            r#"{{"type":"file_chunked_v1","id":"{id}","fileName":"{id}.txt","fileType":"text/plain",
                "fileSize":4,"totalChunks":1,"bundle":{{"key_b64":"{key}","nonce_b64":"n"}}}}"#
        )
    }

    fn chunk(id: &str, index: u32, data: &[u8]) -> String {
        Payload::FileChunk(FileChunk {
            file_id: FileId::from(id),
            index,
            data: data.to_vec(),
        })
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn test_slow_decryption_does_not_block_others() {
        let delegate = Arc::new(SlowBundle::default());
        let h = harness_with(InboxConfig::default(), delegate.clone());
        h.dispatcher.handle(&friend(), &single_chunk_init("a", "slow")).await.unwrap();
        h.dispatcher.handle(&friend(), &single_chunk_init("b", "k")).await.unwrap();

        let slow_chunk = chunk("a", 0, b"aaaa");
        let fast_chunk = chunk("b", 0, b"bbbb");
        let text = r#"{"type":"msg","content":"meanwhile","id":"m1"}"#;

        let sender = friend();
        let slow = h.dispatcher.handle(&sender, &slow_chunk);
        let others = async {
            delegate.entered.notified().await;
            let fast = timeout(Duration::from_secs(1), h.dispatcher.handle(&sender, &fast_chunk))
                .await
                .expect("fast file blocked behind slow decryption")
                .unwrap();
            let msg = timeout(Duration::from_secs(1), h.dispatcher.handle(&sender, text))
                .await
                .expect("message blocked behind slow decryption")
                .unwrap();
            delegate.release.notify_one();
            (fast, msg)
        };
        let (slow, (fast, msg)) = tokio::join!(slow, others);

        assert!(matches!(fast, Disposition::AttachmentCompleted { .. }));
        assert!(matches!(msg, Disposition::Appended { .. }));
        assert!(matches!(slow.unwrap(), Disposition::AttachmentCompleted { .. }));
        assert_eq!(h.blobs.len().await, 2);
    }

    #[tokio::test]
    async fn test_chunk_data_beyond_declared_size_dropped() {
        let config = InboxConfig {
            max_file_size: 4,
            ..InboxConfig::default()
        };
        let h = harness_with(config, Arc::new(Passthrough));
        h.dispatcher.handle(&friend(), &single_chunk_init("big", "k")).await.unwrap();

        let d = h
            .dispatcher
            .handle(&friend(), &chunk("big", 0, &vec![7u8; 1_000_000]))
            .await
            .unwrap();
        assert!(matches!(
            d,
            Disposition::Dropped(DropReason::Reassembly(ReassemblyError::ExceedsDeclaredSize {
                received: 1_000_000,
                max: 4,
                ..
            }))
        ));
        assert!(h.blobs.is_empty().await);

        let chat = h.dispatcher.store().conversation(&friend()).await.unwrap();
        let attachment = chat.message("big").unwrap().attachment.clone().unwrap();
        assert!(!attachment.is_complete);
    }

    #[tokio::test]
    async fn test_init_colliding_with_text_message_not_opened() {
        let h = harness();
        h.dispatcher
            .handle(&friend(), r#"{"type":"msg","content":"hi","id":"f1"}"#)
            .await
            .unwrap();

        let d = h.dispatcher.handle(&friend(), INIT_F1).await.unwrap();
        assert!(matches!(d, Disposition::Duplicate { .. }));
        assert_eq!(h.dispatcher.reassembler().open_files().await, 0);

        let chat = h.dispatcher.store().conversation(&friend()).await.unwrap();
        assert_eq!(chat.messages.len(), 1);
        assert_eq!(chat.messages[0].content, "hi");
        assert!(chat.messages[0].attachment.is_none());
    }

    #[tokio::test]
    async fn test_undecryptable_envelope_dropped() {
        let h = harness();
        let d = h
            .dispatcher
            .receive(InboundEnvelope {
                sender: friend(),
                body: vec![0xff, 0x00, 0xfe],
            })
            .await
            .unwrap();
        assert!(matches!(d, Disposition::Dropped(DropReason::Decrypt(_))));
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let h = harness();
        let dispatcher = Arc::new(h.dispatcher);
        let (tx, rx) = mpsc::channel(16);
        let worker = tokio::spawn(dispatcher.clone().run(rx));

        for i in 0..10 {
            let body = format!(r#"{{"type":"msg","content":"n{i}","id":"m{i}"}}"#);
            tx.send(InboundEnvelope {
                sender: friend(),
                body: body.into_bytes(),
            })
            .await
            .unwrap();
        }
        drop(tx);
        worker.await.unwrap();

        let chat = dispatcher.store().conversation(&friend()).await.unwrap();
        assert_eq!(chat.messages.len(), 10);
        assert_eq!(chat.unread_count, 10);
    }
}
