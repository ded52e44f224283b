/// ChaCha20-Poly1305 key size in bytes
pub const MEDIA_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce size in bytes
pub const MEDIA_NONCE_SIZE: usize = 12;

/// Bytes of the bundle nonce kept as the per-file prefix of every chunk nonce;
/// the remaining 4 bytes carry the chunk index (big-endian)
pub const MEDIA_NONCE_PREFIX: usize = 8;

/// Poly1305 tag size in bytes
pub const MEDIA_TAG_SIZE: usize = 16;

/// Maximum file transfer size in bytes (50 MiB)
pub const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Upper bound on the chunk count a single file may declare
pub const MAX_TOTAL_CHUNKS: u32 = 4096;

/// Maximum number of files reassembling at the same time
pub const MAX_OPEN_FILES: usize = 256;

/// How many completed file ids are remembered to reject late replays
pub const COMPLETED_TOMBSTONES: usize = 4096;

/// Payload discriminants (`type` field)
pub const TYPE_PLAIN_MESSAGE: &str = "msg";
pub const TYPE_SYNC_ECHO: &str = "sync_msg";
pub const TYPE_BLOCK_SYNC: &str = "block_sync";
pub const TYPE_CHUNKED_FILE_INIT: &str = "file_chunked_v1";
pub const TYPE_FILE_CHUNK: &str = "file_chunk";

/// Display content prefix for a completed attachment message
pub const FILE_CONTENT_PREFIX: &str = "File: ";

/// Display content prefix while an attachment is still arriving
pub const RECEIVING_CONTENT_PREFIX: &str = "Receiving file: ";
