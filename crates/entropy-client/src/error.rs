use thiserror::Error;

use entropy_shared::error::CryptoError;
use entropy_shared::types::FileId;
use entropy_store::StoreError;

/// Failure reported by the decryption service for one envelope or chunk.
#[derive(Error, Debug)]
pub enum DecryptError {
    #[error("Envelope decryption failed: {0}")]
    Envelope(String),

    #[error("Chunk decryption failed: {0}")]
    Chunk(#[from] CryptoError),

    #[error("Decryption task failed: {0}")]
    Task(String),
}

/// Why the reassembler refused an init or a chunk.
#[derive(Error, Debug)]
pub enum ReassemblyError {
    #[error("No open reassembly for file {0}")]
    UnknownFile(FileId),

    #[error("Chunk {index} out of range for file {file_id} ({total} chunks)")]
    OutOfRange {
        file_id: FileId,
        index: u32,
        total: u32,
    },

    #[error("File {file_id} declares {total} chunks (max {max})")]
    TooManyChunks {
        file_id: FileId,
        total: u32,
        max: u32,
    },

    #[error("File {file_id} chunks total {received} bytes (max {max})")]
    ExceedsDeclaredSize {
        file_id: FileId,
        received: u64,
        max: u64,
    },

    #[error("Too many files reassembling (max {max})")]
    TooManyOpenFiles { max: usize },

    #[error(transparent)]
    Decrypt(#[from] DecryptError),
}

/// The only failure the dispatcher reports upward.  Everything else is a
/// dropped payload.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Store conflict while applying payload: {0}")]
    StoreConflict(#[from] StoreError),
}
