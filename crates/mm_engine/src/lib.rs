//! mm_engine — Murmur messaging engine protocol orchestrator
//!
//! The facade the chat layer uses:
//!
//! - [`Engine::initialize`] — create/publish identity and prekeys, rotate
//!   the signed prekey weekly, refill the one-time pool below threshold
//! - [`Engine::encrypt`] — load or X3DH-create a session, ratchet-encrypt,
//!   wrap as a v=2 envelope (with the X3DH preamble on a session's first
//!   outbound message)
//! - [`Engine::decrypt`] — pass through non-protocol input, complete a
//!   session from an inbound preamble, ratchet-decrypt
//! - [`Engine::safety_number`] — out-of-band identity fingerprint
//! - [`Engine::has_session`], [`Engine::clear_all`],
//!   [`Engine::is_signal_envelope`]
//!
//! External collaborators arrive through narrow interfaces: the
//! [`directory::KeyDirectory`] trait for published prekey material and
//! `mm_store::Store` for durable local key material.

pub mod directory;
pub mod engine;
pub mod error;

pub use directory::{DirectoryError, HttpDirectory, KeyDirectory, MemoryDirectory};
pub use engine::{Decrypted, Engine};
pub use error::EngineError;
