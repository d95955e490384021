//! Typed engine errors. Decrypt failure is an ordinary value to the chat
//! layer; user-facing wording is its responsibility, not this crate's.

use thiserror::Error;

use crate::directory::DirectoryError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Identity not yet created — encrypt/decrypt before `initialize`.
    #[error("Identity not initialised")]
    NotInitialized,

    /// A non-X3DH envelope arrived with no cached or stored session.
    #[error("No session for this conversation")]
    NoSession,

    /// AEAD authentication failed, too many skipped messages, or the
    /// envelope is malformed. No persisted state was mutated.
    #[error("Envelope could not be decrypted")]
    Undecryptable,

    /// The directory has no identity or signed prekey for the remote user.
    #[error("No prekey bundle available for the remote user")]
    BundleUnavailable,

    /// The remote signed-prekey signature did not verify. Security
    /// relevant; logged at the call site.
    #[error("Remote prekey bundle failed verification")]
    BundleInvalid,

    #[error("Storage error: {0}")]
    Storage(#[from] mm_store::StoreError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] mm_crypto::CryptoError),

    #[error("Wire serialisation error: {0}")]
    Proto(#[from] mm_proto::ProtoError),
}
