//! Database row models — these map to/from SQL rows.
//!
//! Key columns hold exported JWK JSON; counters use SQLite's i64 and are
//! narrowed by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdentityRow {
    pub user_id: String,
    /// Private JWK of the long-term DH (agreement) key pair.
    pub dh_keypair: String,
    /// Private JWK of the signing (ECDSA) key pair.
    pub signing_keypair: String,
    /// 14-bit registration identifier.
    pub registration_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SignedPreKeyRow {
    pub user_id: String,
    pub key_id: i64,
    /// Private JWK of the prekey pair.
    pub keypair: String,
    /// Base64 signature over the canonical JSON of the public half.
    pub signature: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OneTimePreKeyRow {
    pub user_id: String,
    pub key_id: i64,
    pub keypair: String,
    pub used: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionRow {
    pub conversation_id: String,
    pub remote_user_id: String,
    /// Serialized ratchet snapshot JSON.
    pub ratchet: String,
    pub x3dh_completed: bool,
    /// Initiator's ephemeral public JWK, kept for idempotent re-completion
    /// when the first envelope is delivered more than once.
    pub initiator_ephemeral: Option<String>,
    pub one_time_prekey_id: Option<i64>,
    /// X3DH preamble JSON not yet attached to an outgoing envelope
    /// (initiator side only; cleared after the first send).
    pub pending_preamble: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
