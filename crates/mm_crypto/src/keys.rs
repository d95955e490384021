//! Typed key handles over P-256.
//!
//! Two independent key families per user:
//!   - DH keys (ECDH) — identity agreement key, signed prekeys, one-time
//!     prekeys, ratchet keys.
//!   - Signing keys (ECDSA) — sign signed-prekey publications.
//!
//! All keys cross process boundaries (storage, wire) as JSON Web Keys:
//! `kty="EC"`, `crv="P-256"`, base64url `x`/`y` and, for private keys, `d`.
//! The JWK struct emits its fields in a fixed order so the serialized form
//! is canonical — signatures and fingerprints are computed over these exact
//! bytes and must be stable across implementations.
//!
//! Every other module in this crate (and the crates above it) goes through
//! these handles; nothing else touches `p256` directly.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use p256::{
    ecdh,
    ecdsa::{
        signature::{Signer, Verifier},
        Signature, SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint},
    EncodedPoint, FieldBytes, PublicKey, SecretKey,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub(crate) fn b64e(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub(crate) fn b64d(s: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD.decode(s).map_err(CryptoError::Base64Decode)
}

fn coord(s: &str) -> Result<[u8; 32], CryptoError> {
    b64d(s)?
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("JWK coordinate must be 32 bytes".into()))
}

// ── JWK ──────────────────────────────────────────────────────────────────────

/// P-256 key in JSON Web Key form. Field order is canonical: `crv`, `kty`,
/// `x`, `y`, then `d` (private keys only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub crv: String,
    pub kty: String,
    pub x: String,
    pub y: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
}

impl Jwk {
    /// The public half (drops `d`).
    pub fn to_public(&self) -> Jwk {
        Jwk { d: None, ..self.clone() }
    }

    /// Canonical JSON of the public half. This is the byte string that
    /// signed-prekey signatures and safety numbers commit to.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(&self.to_public())
            .expect("JWK with string fields always serialises")
    }

    fn check_shape(&self) -> Result<(), CryptoError> {
        if self.kty != "EC" || self.crv != "P-256" {
            return Err(CryptoError::InvalidKey(format!(
                "expected EC/P-256 JWK, got {}/{}",
                self.kty, self.crv
            )));
        }
        Ok(())
    }
}

fn jwk_from_point(point: &EncodedPoint, d: Option<String>) -> Jwk {
    let x = point.x().expect("uncompressed point has x coordinate");
    let y = point.y().expect("uncompressed point has y coordinate");
    Jwk {
        crv: "P-256".into(),
        kty: "EC".into(),
        x: b64e(x.as_slice()),
        y: b64e(y.as_slice()),
        d,
    }
}

fn point_from_jwk(jwk: &Jwk) -> Result<EncodedPoint, CryptoError> {
    jwk.check_shape()?;
    let x = coord(&jwk.x)?;
    let y = coord(&jwk.y)?;
    Ok(EncodedPoint::from_affine_coordinates(
        FieldBytes::from_slice(&x),
        FieldBytes::from_slice(&y),
        false,
    ))
}

// ── DH keys (ECDH) ───────────────────────────────────────────────────────────

/// P-256 public key used for Diffie–Hellman agreement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhPublicKey(PublicKey);

impl DhPublicKey {
    /// Import from a JWK map. Rejects coordinates that do not name a point
    /// on the curve.
    pub fn from_jwk(jwk: &Jwk) -> Result<Self, CryptoError> {
        let point = point_from_jwk(jwk)?;
        Option::from(PublicKey::from_encoded_point(&point))
            .map(DhPublicKey)
            .ok_or_else(|| CryptoError::InvalidKey("point is not on P-256".into()))
    }

    pub fn to_jwk(&self) -> Jwk {
        jwk_from_point(&self.0.to_encoded_point(false), None)
    }

    /// Canonical JSON of the public JWK (signature / fingerprint input).
    pub fn canonical_json(&self) -> String {
        self.to_jwk().canonical_json()
    }

    /// Base64url of the SEC1 uncompressed encoding. Stable identifier for
    /// map keys (the skipped-message-key cache is indexed by this).
    pub fn sec1_b64(&self) -> String {
        b64e(self.0.to_encoded_point(false).as_bytes())
    }
}

/// P-256 DH key pair. The secret scalar is zeroized when the inner
/// `SecretKey` drops.
#[derive(Clone)]
pub struct DhKeyPair {
    secret: SecretKey,
    public: DhPublicKey,
}

impl DhKeyPair {
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let public = DhPublicKey(secret.public_key());
        Self { secret, public }
    }

    pub fn public(&self) -> &DhPublicKey {
        &self.public
    }

    /// ECDH: returns the 32-byte x-coordinate of the shared point.
    pub fn agree(&self, remote: &DhPublicKey) -> Zeroizing<[u8; 32]> {
        let shared = ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), remote.0.as_affine());
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        out
    }

    /// Export including the private scalar `d`.
    pub fn to_jwk(&self) -> Jwk {
        let point = self.secret.public_key().to_encoded_point(false);
        jwk_from_point(&point, Some(b64e(self.secret.to_bytes().as_slice())))
    }

    pub fn from_jwk(jwk: &Jwk) -> Result<Self, CryptoError> {
        jwk.check_shape()?;
        let d = jwk
            .d
            .as_deref()
            .ok_or_else(|| CryptoError::InvalidKey("private JWK missing 'd'".into()))?;
        let d = Zeroizing::new(b64d(d)?);
        let secret = SecretKey::from_slice(&d)
            .map_err(|_| CryptoError::InvalidKey("invalid P-256 secret scalar".into()))?;
        let public = DhPublicKey(secret.public_key());
        Ok(Self { secret, public })
    }
}

// ── Signing keys (ECDSA) ─────────────────────────────────────────────────────

/// P-256 ECDSA verifying key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningPublicKey(VerifyingKey);

impl SigningPublicKey {
    pub fn from_jwk(jwk: &Jwk) -> Result<Self, CryptoError> {
        let point = point_from_jwk(jwk)?;
        VerifyingKey::from_encoded_point(&point)
            .map(SigningPublicKey)
            .map_err(|_| CryptoError::InvalidKey("point is not on P-256".into()))
    }

    pub fn to_jwk(&self) -> Jwk {
        jwk_from_point(&self.0.to_encoded_point(false), None)
    }

    /// Verify a 64-byte fixed-width ECDSA signature.
    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        match Signature::from_slice(sig) {
            Ok(sig) => self.0.verify(msg, &sig).is_ok(),
            Err(_) => false,
        }
    }
}

/// P-256 ECDSA signing key pair.
#[derive(Clone)]
pub struct SigningKeyPair {
    secret: SigningKey,
    public: SigningPublicKey,
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        let secret = SigningKey::random(&mut OsRng);
        let public = SigningPublicKey(*secret.verifying_key());
        Self { secret, public }
    }

    pub fn public(&self) -> &SigningPublicKey {
        &self.public
    }

    /// Sign arbitrary bytes; returns the 64-byte fixed-width signature.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        let sig: Signature = self.secret.sign(msg);
        sig.to_bytes().as_slice().to_vec()
    }

    pub fn to_jwk(&self) -> Jwk {
        let point = self.secret.verifying_key().to_encoded_point(false);
        jwk_from_point(&point, Some(b64e(self.secret.to_bytes().as_slice())))
    }

    pub fn from_jwk(jwk: &Jwk) -> Result<Self, CryptoError> {
        jwk.check_shape()?;
        let d = jwk
            .d
            .as_deref()
            .ok_or_else(|| CryptoError::InvalidKey("private JWK missing 'd'".into()))?;
        let d = Zeroizing::new(b64d(d)?);
        let secret = SigningKey::from_slice(&d)
            .map_err(|_| CryptoError::InvalidKey("invalid P-256 secret scalar".into()))?;
        let public = SigningPublicKey(*secret.verifying_key());
        Ok(Self { secret, public })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_agreement_is_symmetric() {
        let a = DhKeyPair::generate();
        let b = DhKeyPair::generate();
        assert_eq!(*a.agree(b.public()), *b.agree(a.public()));
    }

    #[test]
    fn dh_jwk_roundtrip_preserves_agreement() {
        let a = DhKeyPair::generate();
        let b = DhKeyPair::generate();
        let a2 = DhKeyPair::from_jwk(&a.to_jwk()).unwrap();
        let b_pub = DhPublicKey::from_jwk(&b.public().to_jwk()).unwrap();
        assert_eq!(*a.agree(b.public()), *a2.agree(&b_pub));
    }

    #[test]
    fn public_jwk_has_no_private_scalar() {
        let pair = DhKeyPair::generate();
        assert!(pair.to_jwk().d.is_some());
        assert!(pair.public().to_jwk().d.is_none());
        assert!(!pair.public().canonical_json().contains("\"d\""));
    }

    #[test]
    fn canonical_json_field_order_is_stable() {
        let pair = DhKeyPair::generate();
        let json = pair.public().canonical_json();
        let crv = json.find("\"crv\"").unwrap();
        let kty = json.find("\"kty\"").unwrap();
        let x = json.find("\"x\"").unwrap();
        let y = json.find("\"y\"").unwrap();
        assert!(crv < kty && kty < x && x < y);
    }

    #[test]
    fn sign_verify_roundtrip_and_tamper() {
        let signer = SigningKeyPair::generate();
        let sig = signer.sign(b"prekey bytes");
        assert!(signer.public().verify(b"prekey bytes", &sig));
        assert!(!signer.public().verify(b"prekey bytez", &sig));

        let mut bad = sig.clone();
        bad[10] ^= 0x01;
        assert!(!signer.public().verify(b"prekey bytes", &bad));
    }

    #[test]
    fn signing_jwk_roundtrip() {
        let signer = SigningKeyPair::generate();
        let restored = SigningKeyPair::from_jwk(&signer.to_jwk()).unwrap();
        let sig = signer.sign(b"msg");
        assert!(restored.public().verify(b"msg", &sig));
    }

    #[test]
    fn off_curve_point_is_rejected() {
        let mut jwk = DhKeyPair::generate().public().to_jwk();
        jwk.y = b64e(&[0x42u8; 32]);
        assert!(DhPublicKey::from_jwk(&jwk).is_err());
    }
}
