//! mm_proto — Wire types and serialisation for the Murmur messaging engine
//!
//! Everything that crosses a process boundary lives here: the encrypted
//! message envelope (what the transport sees), the X3DH preamble carried on
//! a session's first message, and the public prekey material exchanged with
//! the key directory. All of it is versioned JSON with keys serialized as
//! JWK maps.
//!
//! # Modules
//! - `envelope` — v=2 ciphertext envelope + X3DH preamble
//! - `bundle`   — directory records: identity, signed prekey, one-time
//!               prekeys, fetched prekey bundles
//! - `error`    — unified error type

pub mod bundle;
pub mod envelope;
pub mod error;

pub use bundle::{IdentityRecord, OneTimePreKeyRecord, PrekeyBundle, SignedPreKeyRecord};
pub use envelope::{Envelope, X3dhPreamble, ENVELOPE_VERSION};
pub use error::ProtoError;
