//! # entropy-replay
//!
//! Feeds a captured transcript of decrypted envelopes through the inbound
//! core and prints the resulting conversation state.
//!
//! Each line of the transcript is a JSON object:
//!
//! ```text
//! {"sender": "<identity hash>", "body": "<decrypted payload text>"}
//! ```
//!
//! Envelopes are dispatched concurrently, `MAX_IN_FLIGHT` at a time, the way
//! live delivery would interleave them.  Set `MAX_IN_FLIGHT=1` to replay in
//! strict transcript order.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use entropy_client::{init_tracing, ChunkCipherService, Dispatcher, InboundEnvelope, InboxConfig};
use entropy_shared::types::IdentityHash;
use entropy_store::{ConversationStore, FsBlobStore};

#[derive(Debug, Deserialize)]
struct TranscriptLine {
    sender: IdentityHash,
    body: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let Some(path) = std::env::args().nth(1).map(PathBuf::from) else {
        bail!("usage: entropy-replay <transcript.jsonl>");
    };

    let config = InboxConfig::from_env();
    info!(?config, "Loaded configuration");

    let local = IdentityHash::new(
        config
            .local_identity
            .clone()
            .unwrap_or_else(|| "local".to_string()),
    );
    let store = Arc::new(ConversationStore::new(local));

    let max_blob = usize::try_from(config.max_file_size).unwrap_or(usize::MAX);
    let blobs = Arc::new(
        FsBlobStore::new(config.blob_storage_path.clone(), max_blob)
            .await
            .context("Failed to open attachment directory")?,
    );

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        Arc::new(ChunkCipherService),
        blobs,
        &config,
    ));

    let transcript = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let (tx, rx) = mpsc::channel(config.max_in_flight.max(1));
    let worker = tokio::spawn(dispatcher.run(rx));

    let mut queued = 0usize;
    for (lineno, line) in transcript.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: TranscriptLine = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(e) => {
                warn!(line = lineno + 1, error = %e, "Skipping unreadable transcript line");
                continue;
            }
        };

        let envelope = InboundEnvelope {
            sender: entry.sender,
            body: entry.body.into_bytes(),
        };
        if tx.send(envelope).await.is_err() {
            bail!("Dispatcher stopped before the transcript was drained");
        }
        queued += 1;
    }
    drop(tx);

    worker.await.context("Dispatcher task failed")?;
    info!(envelopes = queued, revision = store.revision(), "Replay finished");

    let snapshot = store.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    Ok(())
}
