//! Boundary to the decryption service.
//!
//! Session decryption (ratchets, sealed sender, key management) lives outside
//! this crate.  The core only needs two calls, both asynchronous and allowed
//! to fail independently per call.

use async_trait::async_trait;

use entropy_shared::crypto;
use entropy_shared::protocol::MediaBundle;
use entropy_shared::types::IdentityHash;

use crate::error::DecryptError;

#[async_trait]
pub trait DecryptionService: Send + Sync {
    /// Decrypt one envelope from `sender` into payload text.
    async fn decrypt(&self, sender: &IdentityHash, raw: &[u8]) -> Result<String, DecryptError>;

    /// Decrypt chunk `index` of an attachment sealed under `bundle`.
    async fn decrypt_media_chunk(
        &self,
        bundle: &MediaBundle,
        index: u32,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, DecryptError>;
}

/// Treats envelope bodies as already-decrypted UTF-8 text and opens chunks
/// with the media chunk cipher.  Backs the replay tool, where the transcript
/// was captured after session decryption.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChunkCipherService;

#[async_trait]
impl DecryptionService for ChunkCipherService {
    async fn decrypt(&self, _sender: &IdentityHash, raw: &[u8]) -> Result<String, DecryptError> {
        String::from_utf8(raw.to_vec()).map_err(|e| DecryptError::Envelope(e.to_string()))
    }

    async fn decrypt_media_chunk(
        &self,
        bundle: &MediaBundle,
        index: u32,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, DecryptError> {
        let bundle = bundle.clone();
        let ciphertext = ciphertext.to_vec();

        // AEAD over a large chunk is CPU-bound; keep it off the async workers
        tokio::task::spawn_blocking(move || {
            let (key, nonce) = crypto::open_bundle(&bundle)?;
            crypto::decrypt_media_chunk(&key, &nonce, index, &ciphertext)
        })
        .await
        .map_err(|e| DecryptError::Task(e.to_string()))?
        .map_err(DecryptError::from)
    }
}
