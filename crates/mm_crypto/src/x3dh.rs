//! X3DH asynchronous key agreement.
//!
//! Reference: Signal X3DH spec <https://signal.org/docs/specifications/x3dh/>
//!
//! Alice (initiator) fetches Bob's published bundle: identity DH key IK_B,
//! signed prekey SPK_B (+ signature under Bob's signing key), and optionally
//! a claimed one-time prekey OPK_B. She generates one ephemeral pair EK_A
//! and computes, in this exact order:
//!
//!   DH1 = DH(IK_A, SPK_B)
//!   DH2 = DH(EK_A, IK_B)
//!   DH3 = DH(EK_A, SPK_B)
//!   DH4 = DH(EK_A, OPK_B)        [only if the bundle carried one]
//!
//!   SK = HKDF(ikm = DH1 ‖ DH2 ‖ DH3 [‖ DH4], salt = 32 zero bytes,
//!             info = "signal-x3dh-shared-secret", len = 32)
//!
//! Any deviation in the ordering desynchronises both sides permanently.
//! Alice MUST verify the SPK signature before computing any DH.

use zeroize::{Zeroize, Zeroizing};

use crate::{
    error::CryptoError,
    kdf,
    keys::{DhKeyPair, DhPublicKey, SigningKeyPair, SigningPublicKey},
};

const X3DH_INFO: &[u8] = b"signal-x3dh-shared-secret";

// ── Prekey material ──────────────────────────────────────────────────────────

/// Generate a signed prekey: a DH pair whose public half (canonical JWK
/// JSON, UTF-8) is signed by the user's signing key.
pub fn generate_signed_prekey(signing: &SigningKeyPair) -> (DhKeyPair, Vec<u8>) {
    let pair = DhKeyPair::generate();
    let sig = signing.sign(pair.public().canonical_json().as_bytes());
    (pair, sig)
}

/// Generate a batch of one-time prekeys.
pub fn generate_one_time_prekeys(count: usize) -> Vec<DhKeyPair> {
    (0..count).map(|_| DhKeyPair::generate()).collect()
}

/// Verify a signed-prekey signature against the publisher's signing key.
pub fn verify_signed_prekey(
    signing: &SigningPublicKey,
    prekey: &DhPublicKey,
    sig: &[u8],
) -> Result<(), CryptoError> {
    if signing.verify(prekey.canonical_json().as_bytes(), sig) {
        Ok(())
    } else {
        Err(CryptoError::SignatureVerification)
    }
}

// ── Remote bundle (typed view of a fetched prekey bundle) ────────────────────

/// A peer's published bundle, already imported into typed handles.
pub struct RemoteBundle {
    pub identity: DhPublicKey,
    pub signing: SigningPublicKey,
    pub signed_prekey: DhPublicKey,
    pub signed_prekey_signature: Vec<u8>,
    pub one_time_prekey: Option<(u32, DhPublicKey)>,
}

// ── Initiator output ─────────────────────────────────────────────────────────

pub struct InitiatorStart {
    /// 32-byte shared secret → the Double Ratchet's initial root key.
    pub shared_secret: Zeroizing<[u8; 32]>,
    /// EK_A public half; the responder needs it to mirror DH2..DH4.
    pub ephemeral: DhKeyPair,
    /// Which one-time prekey was consumed, if any.
    pub used_one_time_prekey_id: Option<u32>,
}

fn derive_shared(ikm: &mut Vec<u8>) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut sk = Zeroizing::new([0u8; 32]);
    kdf::hkdf(ikm, &kdf::ZERO_SALT, X3DH_INFO, &mut *sk)?;
    ikm.zeroize();
    Ok(sk)
}

// ── Initiator (Alice) ────────────────────────────────────────────────────────

pub fn initiate(identity: &DhKeyPair, bundle: &RemoteBundle) -> Result<InitiatorStart, CryptoError> {
    verify_signed_prekey(
        &bundle.signing,
        &bundle.signed_prekey,
        &bundle.signed_prekey_signature,
    )?;

    let ephemeral = DhKeyPair::generate();

    let dh1 = identity.agree(&bundle.signed_prekey);
    let dh2 = ephemeral.agree(&bundle.identity);
    let dh3 = ephemeral.agree(&bundle.signed_prekey);

    let mut ikm = Vec::with_capacity(128);
    ikm.extend_from_slice(&*dh1);
    ikm.extend_from_slice(&*dh2);
    ikm.extend_from_slice(&*dh3);

    let mut used_id = None;
    if let Some((id, ref opk)) = bundle.one_time_prekey {
        let dh4 = ephemeral.agree(opk);
        ikm.extend_from_slice(&*dh4);
        used_id = Some(id);
    }

    let shared_secret = derive_shared(&mut ikm)?;

    Ok(InitiatorStart {
        shared_secret,
        ephemeral,
        used_one_time_prekey_id: used_id,
    })
}

// ── Responder (Bob) ──────────────────────────────────────────────────────────

/// Reconstruct the shared secret from the initiator's first-message
/// preamble. Mirrors Alice's DH order exactly (ECDH is commutative):
///   DH1 = SPK_B × IK_A, DH2 = IK_B × EK_A, DH3 = SPK_B × EK_A,
///   DH4 = OPK_B × EK_A.
pub fn respond(
    identity: &DhKeyPair,
    signed_prekey: &DhKeyPair,
    one_time_prekey: Option<&DhKeyPair>,
    initiator_identity: &DhPublicKey,
    initiator_ephemeral: &DhPublicKey,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let dh1 = signed_prekey.agree(initiator_identity);
    let dh2 = identity.agree(initiator_ephemeral);
    let dh3 = signed_prekey.agree(initiator_ephemeral);

    let mut ikm = Vec::with_capacity(128);
    ikm.extend_from_slice(&*dh1);
    ikm.extend_from_slice(&*dh2);
    ikm.extend_from_slice(&*dh3);

    if let Some(opk) = one_time_prekey {
        let dh4 = opk.agree(initiator_ephemeral);
        ikm.extend_from_slice(&*dh4);
    }

    derive_shared(&mut ikm)
}
