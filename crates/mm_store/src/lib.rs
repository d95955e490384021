//! mm_store — Durable local key store for the Murmur messaging engine
//!
//! Five logical collections over SQLite: the local identity (by user id),
//! signed prekeys (by user id + key id), one-time prekeys (by user id +
//! key id), per-conversation session records, and small metadata scalars
//! (prekey id counters, last rotation timestamp).
//!
//! The store performs no cryptographic transformations: key material goes
//! in and comes out as exported JWK strings, and the layers above rehydrate
//! it into typed handles. Every operation is a single-record read or write;
//! writes are durable once the call returns (WAL journal mode). Clearing
//! all records is supported for sign-out and leaves no secret bytes
//! readable through this interface.
//!
//! Migrations in `migrations/` run automatically on open.

pub mod db;
pub mod error;
pub mod models;

pub use db::Store;
pub use error::StoreError;
