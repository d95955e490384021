//! Encrypted message envelope — what the transport sees.
//!
//! The transport is a dumb relay: it observes only the protocol version,
//! the ratchet header (sender's current ratchet public key + counters), the
//! opaque ciphertext, and — on the very first message of a session from the
//! initiator — the X3DH preamble the responder needs to bootstrap.
//!
//! Wire shape (field names are fixed):
//!
//! ```json
//! {
//!   "v": 2,
//!   "header": { "dh": { ...JWK... }, "pn": 0, "n": 3 },
//!   "ciphertext": "<base64>",
//!   "x3dh": {
//!     "identityKey": { ...JWK... },
//!     "ephemeralKey": { ...JWK... },
//!     "oneTimePreKeyId": 12
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};

use mm_crypto::{keys::Jwk, ratchet::RatchetHeader};

use crate::error::ProtoError;

pub const ENVELOPE_VERSION: u8 = 2;

/// X3DH bootstrap data, present only on a session's first outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct X3dhPreamble {
    #[serde(rename = "identityKey")]
    pub identity_key: Jwk,
    #[serde(rename = "ephemeralKey")]
    pub ephemeral_key: Jwk,
    #[serde(rename = "oneTimePreKeyId", skip_serializing_if = "Option::is_none")]
    pub one_time_prekey_id: Option<u32>,
}

/// On-wire ciphertext envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u8,
    pub header: RatchetHeader,
    /// AEAD ciphertext, base64-encoded.
    pub ciphertext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x3dh: Option<X3dhPreamble>,
}

impl Envelope {
    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and version-check an envelope.
    pub fn parse(s: &str) -> Result<Envelope, ProtoError> {
        let env: Envelope = serde_json::from_str(s)
            .map_err(|e| ProtoError::MalformedEnvelope(e.to_string()))?;
        if env.v != ENVELOPE_VERSION {
            return Err(ProtoError::MalformedEnvelope(format!(
                "unsupported version {}",
                env.v
            )));
        }
        Ok(env)
    }

    /// Pure predicate: does `s` parse as JSON with `v == 2` and both a
    /// `header` and a `ciphertext` field? Does not validate the contents.
    pub fn is_signal_envelope(s: &str) -> bool {
        match serde_json::from_str::<serde_json::Value>(s) {
            Ok(value) => {
                value.get("v").and_then(|v| v.as_u64()) == Some(ENVELOPE_VERSION as u64)
                    && value.get("header").is_some()
                    && value.get("ciphertext").is_some()
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mm_crypto::keys::DhKeyPair;

    fn sample_header() -> RatchetHeader {
        RatchetHeader {
            dh: DhKeyPair::generate().public().to_jwk(),
            pn: 0,
            n: 3,
        }
    }

    #[test]
    fn roundtrip_without_preamble() {
        let env = Envelope {
            v: ENVELOPE_VERSION,
            header: sample_header(),
            ciphertext: "YWJj".into(),
            x3dh: None,
        };
        let json = env.to_json().unwrap();
        assert!(!json.contains("x3dh"));
        let back = Envelope::parse(&json).unwrap();
        assert_eq!(back.header.n, 3);
        assert!(back.x3dh.is_none());
    }

    #[test]
    fn preamble_uses_wire_field_names() {
        let identity = DhKeyPair::generate();
        let ephemeral = DhKeyPair::generate();
        let env = Envelope {
            v: ENVELOPE_VERSION,
            header: sample_header(),
            ciphertext: "YWJj".into(),
            x3dh: Some(X3dhPreamble {
                identity_key: identity.public().to_jwk(),
                ephemeral_key: ephemeral.public().to_jwk(),
                one_time_prekey_id: Some(12),
            }),
        };
        let json = env.to_json().unwrap();
        assert!(json.contains("\"identityKey\""));
        assert!(json.contains("\"ephemeralKey\""));
        assert!(json.contains("\"oneTimePreKeyId\":12"));

        let back = Envelope::parse(&json).unwrap();
        assert_eq!(back.x3dh.unwrap().one_time_prekey_id, Some(12));
    }

    #[test]
    fn envelope_predicate() {
        let env = Envelope {
            v: ENVELOPE_VERSION,
            header: sample_header(),
            ciphertext: "YWJj".into(),
            x3dh: None,
        };
        assert!(Envelope::is_signal_envelope(&env.to_json().unwrap()));

        assert!(!Envelope::is_signal_envelope("just a plain text message"));
        assert!(!Envelope::is_signal_envelope("{\"v\":1,\"header\":{},\"ciphertext\":\"x\"}"));
        assert!(!Envelope::is_signal_envelope("{\"v\":2,\"ciphertext\":\"x\"}"));
        assert!(!Envelope::is_signal_envelope("{\"v\":2,\"header\":{}}"));
        // Predicate is shape-only: contents are not validated.
        assert!(Envelope::is_signal_envelope("{\"v\":2,\"header\":{},\"ciphertext\":\"x\"}"));
    }

    #[test]
    fn wrong_version_is_rejected_by_parse() {
        assert!(Envelope::parse("{\"v\":3,\"header\":{},\"ciphertext\":\"x\"}").is_err());
    }
}
