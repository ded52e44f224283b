//! Inbound core configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the core can run with zero
//! configuration in tests and local development.

use std::path::PathBuf;

use entropy_shared::constants::{
    COMPLETED_TOMBSTONES, MAX_FILE_SIZE, MAX_OPEN_FILES, MAX_TOTAL_CHUNKS,
};

/// Inbound core configuration.
#[derive(Debug, Clone)]
pub struct InboxConfig {
    /// Directory where reassembled attachments are written.
    /// Env: `BLOB_STORAGE_PATH`
    /// Default: `./attachments`
    pub blob_storage_path: PathBuf,

    /// Largest attachment (declared `fileSize`) accepted, in bytes.
    /// Env: `MAX_FILE_SIZE`
    /// Default: 50 MiB
    pub max_file_size: u64,

    /// Largest `totalChunks` a single file may declare.
    /// Env: `MAX_TOTAL_CHUNKS`
    /// Default: `4096`
    pub max_total_chunks: u32,

    /// Files allowed to reassemble at the same time.
    /// Env: `MAX_OPEN_FILES`
    /// Default: `256`
    pub max_open_files: usize,

    /// Completed file ids remembered so late replays are ignored.
    /// Env: `COMPLETED_TOMBSTONES`
    /// Default: `4096`
    pub completed_tombstones: usize,

    /// Accept sync echoes whose sender is not the local identity.
    /// Env: `ACCEPT_FOREIGN_SYNC` (true/false)
    /// Default: `false`
    pub accept_foreign_sync: bool,

    /// Drop messages and attachments from blocked peers.
    /// Env: `DROP_BLOCKED_SENDERS` (true/false)
    /// Default: `true`
    pub drop_blocked_senders: bool,

    /// Envelopes processed concurrently by [`Dispatcher::run`](crate::Dispatcher::run).
    /// Env: `MAX_IN_FLIGHT`
    /// Default: `64`
    pub max_in_flight: usize,

    /// Identity hash of the local user (used by the replay binary).
    /// Env: `LOCAL_IDENTITY`
    /// Default: none
    pub local_identity: Option<String>,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            blob_storage_path: PathBuf::from("./attachments"),
            max_file_size: MAX_FILE_SIZE,
            max_total_chunks: MAX_TOTAL_CHUNKS,
            max_open_files: MAX_OPEN_FILES,
            completed_tombstones: COMPLETED_TOMBSTONES,
            accept_foreign_sync: false,
            drop_blocked_senders: true,
            max_in_flight: 64,
            local_identity: None,
        }
    }
}

impl InboxConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("BLOB_STORAGE_PATH") {
            config.blob_storage_path = PathBuf::from(path);
        }

        parse_into(&lookup, "MAX_FILE_SIZE", &mut config.max_file_size);
        parse_into(&lookup, "MAX_TOTAL_CHUNKS", &mut config.max_total_chunks);
        parse_into(&lookup, "MAX_OPEN_FILES", &mut config.max_open_files);
        parse_into(&lookup, "COMPLETED_TOMBSTONES", &mut config.completed_tombstones);
        parse_into(&lookup, "MAX_IN_FLIGHT", &mut config.max_in_flight);

        if let Some(val) = lookup("ACCEPT_FOREIGN_SYNC") {
            config.accept_foreign_sync = val == "true" || val == "1";
        }

        if let Some(val) = lookup("DROP_BLOCKED_SENDERS") {
            config.drop_blocked_senders = val != "false" && val != "0";
        }

        if let Some(id) = lookup("LOCAL_IDENTITY") {
            if !id.is_empty() {
                config.local_identity = Some(id);
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_into<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "Invalid numeric setting, using default");
            }
        }
    }
}
