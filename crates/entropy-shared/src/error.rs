use thiserror::Error;

/// Why a decrypted envelope could not be turned into a [`Payload`](crate::protocol::Payload).
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Payload is not a JSON object: {0}")]
    Malformed(String),

    #[error("Payload has no `type` discriminant")]
    MissingType,

    #[error("Unrecognized payload type: {0}")]
    UnknownType(String),

    #[error("Invalid `{kind}` payload: {reason}")]
    InvalidField { kind: &'static str, reason: String },

    #[error("File declares zero chunks")]
    ZeroChunks,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid nonce length")]
    InvalidNonceLength,

    #[error("Key material is not valid base64")]
    InvalidEncoding,
}
