//! Mutation-ordered conversation state.
//!
//! [`ConversationStore`] owns the [`ChatState`].  Every change goes through a
//! synchronous mutator run under one async mutex, so callers never hold a
//! mutable reference outside the guarded scope and never hold the lock across
//! an `.await`.  Observers subscribe to a revision counter that is bumped
//! after each applied change and read a snapshot afterwards, which means they
//! only ever see fully-applied states.

use tokio::sync::{watch, Mutex};
use tracing::{debug, error};

use entropy_shared::types::IdentityHash;

use crate::error::{Result, StoreError};
use crate::models::{ChatState, Conversation, Message};

pub struct ConversationStore {
    identity_hash: IdentityHash,
    state: Mutex<ChatState>,
    revision: watch::Sender<u64>,
}

impl ConversationStore {
    pub fn new(identity_hash: IdentityHash) -> Self {
        Self::with_state(ChatState::new(identity_hash))
    }

    /// Start from previously loaded state.
    pub fn with_state(state: ChatState) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            identity_hash: state.identity_hash.clone(),
            state: Mutex::new(state),
            revision,
        }
    }

    /// Identity hash of the local user.
    pub fn local_identity(&self) -> &IdentityHash {
        &self.identity_hash
    }

    /// Apply `mutator` atomically and notify subscribers.
    pub async fn update<R>(&self, mutator: impl FnOnce(&mut ChatState) -> R) -> R {
        self.apply(|state| (mutator(state), true)).await
    }

    // Runs the mutator under the lock; bumps the revision only when it
    // reports a change.
    async fn apply<R>(&self, mutator: impl FnOnce(&mut ChatState) -> (R, bool)) -> R {
        let mut state = self.state.lock().await;
        let (result, changed) = mutator(&mut *state);
        if changed {
            self.revision.send_modify(|rev| *rev += 1);
        }
        result
    }

    /// Create an empty conversation for `peer` if none exists.
    pub async fn ensure_conversation(&self, peer: &IdentityHash) -> bool {
        self.apply(|state| {
            let created = !state.chats.contains_key(peer);
            if created {
                state
                    .chats
                    .insert(peer.clone(), Conversation::new(peer.clone()));
            }
            (created, created)
        })
        .await
    }

    /// Append `message` to the conversation with `peer`, creating the
    /// conversation on first use.  Returns `false` without changing anything
    /// when a message with the same id is already present.
    pub async fn append_message(&self, peer: &IdentityHash, message: Message) -> bool {
        self.apply(|state| {
            let conversation = state
                .chats
                .entry(peer.clone())
                .or_insert_with(|| Conversation::new(peer.clone()));

            if conversation.message(&message.id).is_some() {
                debug!(peer = %peer.short(), msg_id = %message.id, "Message already present");
                return (false, false);
            }

            if !message.is_mine {
                conversation.unread_count = conversation.unread_count.saturating_add(1);
            }
            conversation.messages.push(message);
            (true, true)
        })
        .await
    }

    /// Flip the attachment of `message_id` to complete and replace its
    /// display content.
    ///
    /// A missing message, a message without attachment or an attachment that
    /// is already complete means completion fired twice or for the wrong
    /// conversation; that is reported as [`StoreError::Conflict`].
    pub async fn mark_attachment_complete(
        &self,
        peer: &IdentityHash,
        message_id: &str,
        content: String,
    ) -> Result<()> {
        let outcome = self
            .apply(|state| {
                let message = match state
                    .chats
                    .get_mut(peer)
                    .and_then(|c| c.message_mut(message_id))
                {
                    Some(m) => m,
                    None => {
                        return (
                            Err(StoreError::Conflict(format!(
                                "no message {message_id} in conversation {peer}"
                            ))),
                            false,
                        )
                    }
                };

                let attachment = match message.attachment.as_mut() {
                    Some(a) => a,
                    None => {
                        return (
                            Err(StoreError::Conflict(format!(
                                "message {message_id} carries no attachment"
                            ))),
                            false,
                        )
                    }
                };

                if attachment.is_complete {
                    return (
                        Err(StoreError::Conflict(format!(
                            "attachment {} already complete",
                            attachment.file_id
                        ))),
                        false,
                    );
                }

                attachment.is_complete = true;
                message.content = content;
                (Ok(()), true)
            })
            .await;

        if let Err(e) = &outcome {
            error!(peer = %peer.short(), msg_id = %message_id, error = %e, "Attachment completion rejected");
        }
        outcome
    }

    /// Add or remove `peer` from the block list.  Returns whether membership
    /// changed; repeating the same request is a no-op.
    pub async fn set_blocked(&self, peer: &IdentityHash, blocked: bool) -> bool {
        self.apply(|state| {
            let changed = if blocked {
                state.blocked.insert(peer.clone())
            } else {
                state.blocked.remove(peer)
            };
            (changed, changed)
        })
        .await
    }

    pub async fn is_blocked(&self, peer: &IdentityHash) -> bool {
        self.state.lock().await.is_blocked(peer)
    }

    pub async fn conversation(&self, peer: &IdentityHash) -> Option<Conversation> {
        self.state.lock().await.conversation(peer).cloned()
    }

    /// Copy of the current, fully-applied state.
    pub async fn snapshot(&self) -> ChatState {
        self.state.lock().await.clone()
    }

    /// Receiver notified after every applied change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }
}
