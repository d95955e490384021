//! Message-key AEAD: AES-256-GCM keyed per message.
//!
//! Each 32-byte message key is expanded to 44 bytes with HKDF (zero salt,
//! fixed label); the first 32 bytes become the AES-256 key, the last 12 the
//! GCM nonce. The nonce is therefore deterministic in the message key —
//! sound only because every message key is derived exactly once by the
//! ratchet and deleted after use. Message keys must never be reused.

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use zeroize::{Zeroize, Zeroizing};

use crate::{error::CryptoError, kdf};

const MSG_ENCRYPT_INFO: &[u8] = b"signal-msg-encrypt";

fn derive(mk: &[u8; 32]) -> Result<(Zeroizing<[u8; 32]>, [u8; 12]), CryptoError> {
    let mut okm = [0u8; 44];
    kdf::hkdf(mk, &kdf::ZERO_SALT, MSG_ENCRYPT_INFO, &mut okm)?;
    let mut key = Zeroizing::new([0u8; 32]);
    let mut nonce = [0u8; 12];
    key.copy_from_slice(&okm[..32]);
    nonce.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((key, nonce))
}

/// Encrypt one payload under a single-use message key.
pub fn encrypt(mk: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (key, nonce) = derive(mk)?;
    let cipher = Aes256Gcm::new_from_slice(&*key).map_err(|_| CryptoError::AeadEncrypt)?;
    cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::AeadEncrypt)
}

/// Decrypt; fails with an authentication error on any tampering.
pub fn decrypt(mk: &[u8; 32], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let (key, nonce) = derive(mk)?;
    let cipher = Aes256Gcm::new_from_slice(&*key).map_err(|_| CryptoError::AeadDecrypt)?;
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::AeadDecrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mk = [9u8; 32];
        let ct = encrypt(&mk, b"hello").unwrap();
        assert_eq!(&*decrypt(&mk, &ct).unwrap(), b"hello");
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let mk = [9u8; 32];
        let mut ct = encrypt(&mk, b"hello").unwrap();
        ct[0] ^= 0x01;
        assert!(matches!(decrypt(&mk, &ct), Err(CryptoError::AeadDecrypt)));
    }

    #[test]
    fn wrong_key_fails_auth() {
        let ct = encrypt(&[1u8; 32], b"hello").unwrap();
        assert!(decrypt(&[2u8; 32], &ct).is_err());
    }

    #[test]
    fn empty_plaintext_is_valid() {
        let mk = [3u8; 32];
        let ct = encrypt(&mk, b"").unwrap();
        assert_eq!(decrypt(&mk, &ct).unwrap().len(), 0);
    }
}
