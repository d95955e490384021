//! Public prekey material exchanged with the key directory.
//!
//! Users publish an identity record, a current signed prekey, and a batch of
//! one-time prekeys. Session initiators fetch them back as a `PrekeyBundle`
//! (with at most one one-time prekey, atomically claimed by the directory).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use mm_crypto::{
    keys::{DhPublicKey, Jwk, SigningPublicKey},
    x3dh::RemoteBundle,
};

use crate::error::ProtoError;

/// A user's published identity: agreement key, signing key, registration id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub user_id: String,
    pub identity_key: Jwk,
    pub signing_key: Jwk,
    pub registration_id: u32,
}

/// Published signed prekey. The signature covers the UTF-8 bytes of the
/// canonical JSON of `public_key` and verifies under the publisher's
/// signing key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    pub key_id: u32,
    pub public_key: Jwk,
    /// Base64 ECDSA signature.
    pub signature: String,
}

/// Published one-time prekey (public half only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePreKeyRecord {
    pub key_id: u32,
    pub public_key: Jwk,
}

/// What a session initiator fetches: the peer's identity, current signed
/// prekey, and — if the pool was not exhausted — one claimed one-time
/// prekey. Request-scoped; never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyBundle {
    pub identity: IdentityRecord,
    pub signed_prekey: SignedPreKeyRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_time_prekey: Option<OneTimePreKeyRecord>,
}

impl PrekeyBundle {
    /// Import the wire bundle into typed handles for X3DH. Fails on any
    /// malformed or off-curve key.
    pub fn to_remote(&self) -> Result<RemoteBundle, ProtoError> {
        let one_time_prekey = match &self.one_time_prekey {
            Some(rec) => Some((rec.key_id, DhPublicKey::from_jwk(&rec.public_key)?)),
            None => None,
        };
        Ok(RemoteBundle {
            identity: DhPublicKey::from_jwk(&self.identity.identity_key)?,
            signing: SigningPublicKey::from_jwk(&self.identity.signing_key)?,
            signed_prekey: DhPublicKey::from_jwk(&self.signed_prekey.public_key)?,
            signed_prekey_signature: URL_SAFE_NO_PAD.decode(&self.signed_prekey.signature)?,
            one_time_prekey,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mm_crypto::{
        keys::{DhKeyPair, SigningKeyPair},
        x3dh,
    };

    fn published_bundle(with_otp: bool) -> PrekeyBundle {
        let identity = DhKeyPair::generate();
        let signing = SigningKeyPair::generate();
        let (spk, sig) = x3dh::generate_signed_prekey(&signing);

        PrekeyBundle {
            identity: IdentityRecord {
                user_id: "bob".into(),
                identity_key: identity.public().to_jwk(),
                signing_key: signing.public().to_jwk(),
                registration_id: 1234,
            },
            signed_prekey: SignedPreKeyRecord {
                key_id: 1,
                public_key: spk.public().to_jwk(),
                signature: URL_SAFE_NO_PAD.encode(&sig),
            },
            one_time_prekey: with_otp.then(|| OneTimePreKeyRecord {
                key_id: 5,
                public_key: DhKeyPair::generate().public().to_jwk(),
            }),
        }
    }

    #[test]
    fn bundle_converts_to_typed_handles() {
        let bundle = published_bundle(true);
        let remote = bundle.to_remote().unwrap();
        assert_eq!(remote.one_time_prekey.as_ref().map(|(id, _)| *id), Some(5));
        assert!(x3dh::verify_signed_prekey(
            &remote.signing,
            &remote.signed_prekey,
            &remote.signed_prekey_signature
        )
        .is_ok());
    }

    #[test]
    fn bundle_without_one_time_prekey_omits_the_field() {
        let bundle = published_bundle(false);
        let json = serde_json::to_string(&bundle).unwrap();
        assert!(!json.contains("one_time_prekey"));
        let back: PrekeyBundle = serde_json::from_str(&json).unwrap();
        assert!(back.to_remote().unwrap().one_time_prekey.is_none());
    }

    #[test]
    fn signed_prekey_record_wire_fields() {
        let bundle = published_bundle(false);
        let json = serde_json::to_string(&bundle.signed_prekey).unwrap();
        assert!(json.contains("\"key_id\":1"));
        assert!(json.contains("\"public_key\""));
        assert!(json.contains("\"signature\""));
    }

    #[test]
    fn corrupt_signature_base64_is_rejected() {
        let mut bundle = published_bundle(false);
        bundle.signed_prekey.signature = "!!!not-base64!!!".into();
        assert!(bundle.to_remote().is_err());
    }
}
