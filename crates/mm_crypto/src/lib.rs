//! mm_crypto — Murmur messaging engine cryptographic core
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited RustCrypto crates.
//! - Zeroize all secret material on drop.
//! - Typed key handles everywhere; raw bytes only inside this crate.
//! - Pure synchronous code — no I/O, no async.
//!
//! # Module layout
//! - `keys`        — P-256 handles (ECDH + ECDSA) with canonical JWK wire form
//! - `kdf`         — HKDF-SHA-256, HMAC, root/chain ratchet KDFs
//! - `aead`        — per-message AES-256-GCM with key-derived nonce
//! - `x3dh`        — asynchronous key agreement (prekey bundles, 4-DH)
//! - `ratchet`     — Double Ratchet state machine + snapshot serialization
//! - `fingerprint` — safety numbers for out-of-band identity verification
//! - `error`       — unified error type

pub mod aead;
pub mod error;
pub mod fingerprint;
pub mod kdf;
pub mod keys;
pub mod ratchet;
pub mod x3dh;

pub use error::CryptoError;
