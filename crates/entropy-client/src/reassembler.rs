//! Chunked attachment reassembly.
//!
//! One entry per announced file tracks which chunk indices have arrived.  The
//! entry is removed in the same critical section that observes the last
//! missing index, so completion is emitted exactly once even when the final
//! chunks race each other.  Chunk decryption happens with no lock held.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use entropy_shared::protocol::MediaBundle;
use entropy_shared::types::{FileId, IdentityHash};

use crate::config::InboxConfig;
use crate::decryption::DecryptionService;
use crate::error::ReassemblyError;

#[derive(Debug, Clone, Copy)]
pub struct ReassemblyLimits {
    pub max_file_size: u64,
    pub max_total_chunks: u32,
    pub max_open_files: usize,
    pub completed_tombstones: usize,
}

impl From<&InboxConfig> for ReassemblyLimits {
    fn from(config: &InboxConfig) -> Self {
        Self {
            max_file_size: config.max_file_size,
            max_total_chunks: config.max_total_chunks,
            max_open_files: config.max_open_files,
            completed_tombstones: config.completed_tombstones,
        }
    }
}

impl Default for ReassemblyLimits {
    fn default() -> Self {
        Self::from(&InboxConfig::default())
    }
}

/// Everything needed to start reassembling one file.
#[derive(Debug, Clone)]
pub struct FileOpening {
    pub file_id: FileId,
    /// Conversation the attachment message was filed under.
    pub owner: IdentityHash,
    pub file_name: String,
    /// Declared plaintext size; received chunks may not add up to more.
    pub file_size: u64,
    pub total_chunks: u32,
    pub bundle: MediaBundle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened,
    AlreadyOpen,
    AlreadyCompleted,
}

/// A fully reassembled attachment, chunks concatenated in index order.
#[derive(Debug, Clone)]
pub struct CompletedFile {
    pub file_id: FileId,
    pub owner: IdentityHash,
    pub file_name: String,
    pub blob: Bytes,
}

#[derive(Debug)]
pub enum ChunkOutcome {
    Accepted { received: u32, total: u32 },
    Completed(CompletedFile),
    /// The file already completed; late or redelivered chunk.
    Ignored,
}

struct Entry {
    owner: IdentityHash,
    file_name: String,
    total_chunks: u32,
    bundle: Arc<MediaBundle>,
    received: BTreeMap<u32, Vec<u8>>,
    received_bytes: u64,
    max_bytes: u64,
}

#[derive(Default)]
struct Table {
    open: HashMap<FileId, Entry>,
    completed: HashSet<FileId>,
    completed_order: VecDeque<FileId>,
}

impl Table {
    fn remember_completed(&mut self, file_id: FileId, capacity: usize) {
        if capacity == 0 {
            return;
        }
        if self.completed.insert(file_id.clone()) {
            self.completed_order.push_back(file_id);
        }
        while self.completed_order.len() > capacity {
            if let Some(evicted) = self.completed_order.pop_front() {
                self.completed.remove(&evicted);
            }
        }
    }
}

pub struct Reassembler {
    table: Mutex<Table>,
    limits: ReassemblyLimits,
}

impl Reassembler {
    pub fn new(limits: ReassemblyLimits) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            limits,
        }
    }

    pub fn limits(&self) -> &ReassemblyLimits {
        &self.limits
    }

    /// Start tracking a file.  Re-opening a file that is open or already
    /// completed is a no-op.
    pub async fn open_file(&self, opening: FileOpening) -> Result<OpenOutcome, ReassemblyError> {
        if opening.total_chunks > self.limits.max_total_chunks {
            return Err(ReassemblyError::TooManyChunks {
                file_id: opening.file_id,
                total: opening.total_chunks,
                max: self.limits.max_total_chunks,
            });
        }

        let mut table = self.table.lock().await;

        if table.completed.contains(&opening.file_id) {
            debug!(file_id = %opening.file_id, "Init for completed file ignored");
            return Ok(OpenOutcome::AlreadyCompleted);
        }
        if table.open.contains_key(&opening.file_id) {
            debug!(file_id = %opening.file_id, "Duplicate init ignored");
            return Ok(OpenOutcome::AlreadyOpen);
        }
        if table.open.len() >= self.limits.max_open_files {
            return Err(ReassemblyError::TooManyOpenFiles {
                max: self.limits.max_open_files,
            });
        }

        debug!(
            file_id = %opening.file_id,
            owner = %opening.owner.short(),
            total = opening.total_chunks,
            "Reassembly opened"
        );

        table.open.insert(
            opening.file_id,
            Entry {
                owner: opening.owner,
                file_name: opening.file_name,
                total_chunks: opening.total_chunks,
                bundle: Arc::new(opening.bundle),
                received: BTreeMap::new(),
                received_bytes: 0,
                max_bytes: opening.file_size.min(self.limits.max_file_size),
            },
        );
        Ok(OpenOutcome::Opened)
    }

    /// Decrypt and record one chunk.
    ///
    /// A chunk for an unknown file or with an index outside `[0, total)` is
    /// refused, as is one that would take the file past its declared size.
    /// A redelivered index replaces the earlier bytes and is counted once.  A
    /// decryption failure drops only this chunk.
    pub async fn submit_chunk(
        &self,
        file_id: &FileId,
        index: u32,
        ciphertext: &[u8],
        decryptor: &dyn DecryptionService,
    ) -> Result<ChunkOutcome, ReassemblyError> {
        let bundle = {
            let table = self.table.lock().await;
            if table.completed.contains(file_id) {
                return Ok(ChunkOutcome::Ignored);
            }
            let entry = table
                .open
                .get(file_id)
                .ok_or_else(|| ReassemblyError::UnknownFile(file_id.clone()))?;
            if index >= entry.total_chunks {
                return Err(ReassemblyError::OutOfRange {
                    file_id: file_id.clone(),
                    index,
                    total: entry.total_chunks,
                });
            }
            entry.bundle.clone()
        };

        let plaintext = match decryptor.decrypt_media_chunk(&bundle, index, ciphertext).await {
            Ok(p) => p,
            Err(e) => {
                warn!(file_id = %file_id, index, error = %e, "Chunk decryption failed");
                return Err(e.into());
            }
        };

        let finished = {
            let mut table = self.table.lock().await;
            if table.completed.contains(file_id) {
                return Ok(ChunkOutcome::Ignored);
            }
            let entry = match table.open.get_mut(file_id) {
                Some(e) if Arc::ptr_eq(&e.bundle, &bundle) && index < e.total_chunks => e,
                // discarded or re-opened while this chunk was decrypting
                _ => return Err(ReassemblyError::UnknownFile(file_id.clone())),
            };

            let replaced = entry.received.get(&index).map_or(0, |c| c.len() as u64);
            let received_bytes = entry.received_bytes - replaced + plaintext.len() as u64;
            if received_bytes > entry.max_bytes {
                warn!(
                    file_id = %file_id,
                    index,
                    received = received_bytes,
                    max = entry.max_bytes,
                    "Chunk exceeds declared file size"
                );
                return Err(ReassemblyError::ExceedsDeclaredSize {
                    file_id: file_id.clone(),
                    received: received_bytes,
                    max: entry.max_bytes,
                });
            }
            entry.received_bytes = received_bytes;

            if entry.received.insert(index, plaintext).is_some() {
                debug!(file_id = %file_id, index, "Redelivered chunk replaced");
            }

            let received = entry.received.len() as u32;
            let total = entry.total_chunks;
            if received < total {
                return Ok(ChunkOutcome::Accepted { received, total });
            }

            let finished = table.open.remove(file_id);
            table.remember_completed(file_id.clone(), self.limits.completed_tombstones);
            finished
        };

        let entry = match finished {
            Some(e) => e,
            None => return Err(ReassemblyError::UnknownFile(file_id.clone())),
        };

        let blob = assemble(entry.received);
        info!(file_id = %file_id, size = blob.len(), chunks = entry.total_chunks, "Attachment reassembled");

        Ok(ChunkOutcome::Completed(CompletedFile {
            file_id: file_id.clone(),
            owner: entry.owner,
            file_name: entry.file_name,
            blob,
        }))
    }

    /// Drop a stalled reassembly.  Returns whether an entry existed.
    pub async fn discard(&self, file_id: &FileId) -> bool {
        let removed = self.table.lock().await.open.remove(file_id).is_some();
        if removed {
            debug!(file_id = %file_id, "Reassembly discarded");
        }
        removed
    }

    pub async fn open_files(&self) -> usize {
        self.table.lock().await.open.len()
    }

    /// `(received, total)` for an open file.
    pub async fn progress(&self, file_id: &FileId) -> Option<(u32, u32)> {
        self.table
            .lock()
            .await
            .open
            .get(file_id)
            .map(|e| (e.received.len() as u32, e.total_chunks))
    }

    pub async fn is_completed(&self, file_id: &FileId) -> bool {
        self.table.lock().await.completed.contains(file_id)
    }
}

// BTreeMap iterates by ascending index, never by arrival order
fn assemble(chunks: BTreeMap<u32, Vec<u8>>) -> Bytes {
    let size = chunks.values().map(Vec::len).sum();
    let mut blob = BytesMut::with_capacity(size);
    for chunk in chunks.into_values() {
        blob.extend_from_slice(&chunk);
    }
    blob.freeze()
}
