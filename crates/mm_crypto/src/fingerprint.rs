//! Safety numbers: a short, human-comparable fingerprint over two identity
//! public keys, compared out-of-band to detect man-in-the-middle attacks.
//!
//! Derivation: canonical JWK JSON of each identity key, ordered
//! lexicographically (so both parties compute the same string regardless of
//! which side is "local"), concatenated, hashed with SHA-256 five times.
//! Six 4-byte big-endian groups are read at byte offsets 0, 5, 10, 15, 20,
//! 25, each reduced mod 100000 and zero-padded to five digits, joined with
//! single spaces — a 35-character string.

use sha2::{Digest, Sha256};

use crate::keys::DhPublicKey;

const HASH_ROUNDS: usize = 5;
const GROUP_STRIDE: usize = 5;
const GROUP_BYTES: usize = 4;

/// Compute the safety number for an identity pair. Commutative.
pub fn safety_number(a: &DhPublicKey, b: &DhPublicKey) -> String {
    let mut first = a.canonical_json().into_bytes();
    let mut second = b.canonical_json().into_bytes();
    if first > second {
        std::mem::swap(&mut first, &mut second);
    }

    let mut digest = {
        let mut hasher = Sha256::new();
        hasher.update(&first);
        hasher.update(&second);
        hasher.finalize()
    };
    for _ in 1..HASH_ROUNDS {
        digest = Sha256::digest(digest);
    }

    let mut groups = Vec::with_capacity(6);
    let mut offset = 0;
    while offset + GROUP_BYTES <= 30 {
        let word = u32::from_be_bytes([
            digest[offset],
            digest[offset + 1],
            digest[offset + 2],
            digest[offset + 3],
        ]);
        groups.push(format!("{:05}", word % 100_000));
        offset += GROUP_STRIDE;
    }
    groups.join(" ")
}
