use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] mm_crypto::CryptoError),
}
