//! Key derivation: HKDF-SHA-256 and the two ratchet KDFs.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// An all-zero 32-byte salt is a legal HKDF salt and is used by both the
/// X3DH shared-secret derivation and the message-key expansion.
pub const ZERO_SALT: [u8; 32] = [0u8; 32];

const ROOT_CHAIN_INFO: &[u8] = b"signal-root-chain";

/// Expand `ikm` into `out.len()` bytes of key material.
pub fn hkdf(ikm: &[u8], salt: &[u8], info: &[u8], out: &mut [u8]) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    hk.expand(info, out)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Root-key step: mix a DH output into the root key.
/// Returns `(new_root_key, chain_key)`.
pub fn kdf_root(rk: &[u8; 32], dh_out: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let mut okm = [0u8; 64];
    hkdf(dh_out, rk, ROOT_CHAIN_INFO, &mut okm)?;
    let mut new_rk = [0u8; 32];
    let mut ck = [0u8; 32];
    new_rk.copy_from_slice(&okm[..32]);
    ck.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((new_rk, ck))
}

/// Chain-key step: one symmetric ratchet advance.
/// Returns `(next_chain_key, message_key)`; the message key is single-use.
pub fn kdf_chain(ck: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let mk = hmac_sha256(ck, &[0x01]);
    let next_ck = hmac_sha256(ck, &[0x02]);
    (next_ck, mk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hkdf_is_deterministic() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        hkdf(b"ikm", &ZERO_SALT, b"info", &mut a).unwrap();
        hkdf(b"ikm", &ZERO_SALT, b"info", &mut b).unwrap();
        assert_eq!(a, b);

        let mut c = [0u8; 32];
        hkdf(b"ikm", &ZERO_SALT, b"other", &mut c).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn root_step_splits_distinct_halves() {
        let (rk, ck) = kdf_root(&[1u8; 32], &[2u8; 32]).unwrap();
        assert_ne!(rk, ck);
        assert_ne!(rk, [1u8; 32]);
    }

    #[test]
    fn chain_step_separates_message_key_from_next_chain_key() {
        let (ck1, mk1) = kdf_chain(&[7u8; 32]);
        assert_ne!(ck1, mk1);
        // Advancing again yields fresh material.
        let (_, mk2) = kdf_chain(&ck1);
        assert_ne!(mk1, mk2);
    }
}
