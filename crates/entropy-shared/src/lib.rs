// Types, wire codec and media cipher shared by the Entropy crates.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{CodecError, CryptoError};
pub use protocol::{MediaBundle, Payload};
pub use types::{FileId, IdentityHash};
