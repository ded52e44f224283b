use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

use crate::constants::{MEDIA_KEY_SIZE, MEDIA_NONCE_PREFIX, MEDIA_NONCE_SIZE};
use crate::error::CryptoError;
use crate::protocol::MediaBundle;

pub type MediaKey = [u8; MEDIA_KEY_SIZE];

pub fn generate_media_key() -> MediaKey {
    let mut key = [0u8; MEDIA_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_base_nonce() -> [u8; MEDIA_NONCE_SIZE] {
    let mut nonce = [0u8; MEDIA_NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Fresh bundle for an outgoing chunked attachment.
pub fn generate_bundle() -> MediaBundle {
    MediaBundle {
        key_b64: STANDARD.encode(generate_media_key()),
        nonce_b64: STANDARD.encode(generate_base_nonce()),
    }
}

/// Decode the base64 key and nonce carried by a bundle.
pub fn open_bundle(bundle: &MediaBundle) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let key = STANDARD
        .decode(bundle.key_b64.as_bytes())
        .map_err(|_| CryptoError::InvalidEncoding)?;
    let nonce = STANDARD
        .decode(bundle.nonce_b64.as_bytes())
        .map_err(|_| CryptoError::InvalidEncoding)?;
    if key.len() != MEDIA_KEY_SIZE {
        return Err(CryptoError::InvalidKeyLength);
    }
    if nonce.len() < MEDIA_NONCE_PREFIX {
        return Err(CryptoError::InvalidNonceLength);
    }
    Ok((key, nonce))
}

// base_nonce[..8] || chunk_index (big-endian u32)
fn chunk_nonce(base_nonce: &[u8], chunk_index: u32) -> Result<[u8; MEDIA_NONCE_SIZE], CryptoError> {
    if base_nonce.len() < MEDIA_NONCE_PREFIX {
        return Err(CryptoError::InvalidNonceLength);
    }
    let mut nonce = [0u8; MEDIA_NONCE_SIZE];
    nonce[..MEDIA_NONCE_PREFIX].copy_from_slice(&base_nonce[..MEDIA_NONCE_PREFIX]);
    nonce[MEDIA_NONCE_PREFIX..].copy_from_slice(&chunk_index.to_be_bytes());
    Ok(nonce)
}

pub fn encrypt_media_chunk(
    key: &[u8],
    base_nonce: &[u8],
    chunk_index: u32,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    let nonce_bytes = chunk_nonce(base_nonce, chunk_index)?;

    cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)
}

pub fn decrypt_media_chunk(
    key: &[u8],
    base_nonce: &[u8],
    chunk_index: u32,
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    let nonce_bytes = chunk_nonce(base_nonce, chunk_index)?;

    cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}
