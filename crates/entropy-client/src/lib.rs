pub mod config;
pub mod decryption;
pub mod dispatcher;
pub mod error;
pub mod reassembler;

use tracing_subscriber::{fmt, EnvFilter};

pub use config::InboxConfig;
pub use decryption::{ChunkCipherService, DecryptionService};
pub use dispatcher::{Disposition, DispatchPolicy, Dispatcher, DropReason, InboundEnvelope};
pub use error::{DecryptError, DispatchError, ReassemblyError};
pub use reassembler::{ChunkOutcome, CompletedFile, OpenOutcome, Reassembler, ReassemblyLimits};

/// Install the global tracing subscriber.  `RUST_LOG` overrides the default
/// filter.  Calling this more than once is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("entropy_client=debug,entropy_store=info,warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
