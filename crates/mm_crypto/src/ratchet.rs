//! Double Ratchet with DH ratchet steps.
//!
//! Reference: Signal Double Ratchet spec
//! <https://signal.org/docs/specifications/doubleratchet/>
//!
//! State separation:
//!   RK  — root key, updated on every DH ratchet step
//!   CKs — sending chain key, advanced per outgoing message
//!   CKr — receiving chain key, advanced per incoming message
//!   MK  — message key, derived from a chain key, used once, then deleted
//!
//! A DH ratchet step fires whenever an inbound header carries a ratchet
//! public key we have not seen. Out-of-order delivery is tolerated by
//! caching skipped message keys, bounded by `MAX_SKIP` per receiving chain.
//!
//! Mutation discipline on decrypt: skip bounds are validated before any
//! state changes, so an over-gap message leaves the state untouched. The
//! DH-ratchet step itself commits eagerly (it is derived from the header
//! alone), while the symmetric advance runs on temporaries and commits only
//! after the AEAD tag verifies — a forged payload never moves the counters.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::{
    aead,
    error::CryptoError,
    kdf,
    keys::{b64d, b64e, DhKeyPair, DhPublicKey, Jwk},
};

/// Maximum number of message keys skipped (and cached) within one receiving
/// chain. Bounds memory and stops counter-jump DoS.
pub const MAX_SKIP: u32 = 256;

// ── Header (sent in clear with every ciphertext) ─────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current ratchet public key.
    pub dh: Jwk,
    /// Length of the sender's previous sending chain.
    pub pn: u32,
    /// Message number within the current sending chain.
    pub n: u32,
}

// ── State ────────────────────────────────────────────────────────────────────

type SkipId = (String, u32);

/// Live per-session ratchet state. Serialize via [`RatchetSnapshot`].
pub struct RatchetState {
    dhs: DhKeyPair,
    dhr: Option<DhPublicKey>,
    root_key: [u8; 32],
    ck_send: Option<[u8; 32]>,
    ck_recv: Option<[u8; 32]>,
    ns: u32,
    nr: u32,
    pn: u32,
    /// (remote ratchet public, message number) → message key. The id
    /// includes the full remote public key so keys from a superseded chain
    /// are never confused with the current chain's.
    skipped: HashMap<SkipId, [u8; 32]>,
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        if let Some(ref mut ck) = self.ck_send {
            ck.zeroize();
        }
        if let Some(ref mut ck) = self.ck_recv {
            ck.zeroize();
        }
        for (_, mk) in self.skipped.iter_mut() {
            mk.zeroize();
        }
    }
}

impl RatchetState {
    /// Session initiator (Alice) after X3DH: the remote signed prekey plays
    /// the first remote ratchet key, and the sending chain is derived
    /// immediately so the first message can be encrypted without a round
    /// trip.
    pub fn init_alice(
        shared_secret: &[u8; 32],
        remote_signed_prekey: DhPublicKey,
    ) -> Result<Self, CryptoError> {
        let dhs = DhKeyPair::generate();
        let dh_out = dhs.agree(&remote_signed_prekey);
        let (root_key, ck_send) = kdf::kdf_root(shared_secret, &dh_out)?;

        Ok(Self {
            dhs,
            dhr: Some(remote_signed_prekey),
            root_key,
            ck_send: Some(ck_send),
            ck_recv: None,
            ns: 0,
            nr: 0,
            pn: 0,
            skipped: HashMap::new(),
        })
    }

    /// Session responder (Bob) after X3DH: his signed prekey pair is the
    /// initial ratchet key; no chain exists until Alice's first message
    /// triggers the first DH ratchet step.
    pub fn init_bob(shared_secret: &[u8; 32], signed_prekey: DhKeyPair) -> Self {
        Self {
            dhs: signed_prekey,
            dhr: None,
            root_key: *shared_secret,
            ck_send: None,
            ck_recv: None,
            ns: 0,
            nr: 0,
            pn: 0,
            skipped: HashMap::new(),
        }
    }

    /// Our current ratchet public key (what peers see in headers).
    pub fn local_public(&self) -> &DhPublicKey {
        self.dhs.public()
    }

    /// True once the sending chain exists (always for Alice; for Bob after
    /// the first inbound message).
    pub fn can_encrypt(&self) -> bool {
        self.ck_send.is_some()
    }

    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    pub fn counters(&self) -> (u32, u32, u32) {
        (self.ns, self.nr, self.pn)
    }

    // ── Encrypt ──────────────────────────────────────────────────────────

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(RatchetHeader, Vec<u8>), CryptoError> {
        let ck = self.ck_send.ok_or(CryptoError::NotInitialized)?;
        let (next_ck, mut mk) = kdf::kdf_chain(&ck);

        let ciphertext = aead::encrypt(&mk, plaintext)?;
        mk.zeroize();

        let header = RatchetHeader {
            dh: self.dhs.public().to_jwk(),
            pn: self.pn,
            n: self.ns,
        };

        self.ck_send = Some(next_ck);
        self.ns += 1;
        Ok((header, ciphertext))
    }

    // ── Decrypt ──────────────────────────────────────────────────────────

    pub fn decrypt(
        &mut self,
        header: &RatchetHeader,
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let remote = DhPublicKey::from_jwk(&header.dh)?;
        let skip_id: SkipId = (remote.sec1_b64(), header.n);

        // 1. Out-of-order message whose key was cached earlier.
        if let Some(mut mk) = self.skipped.remove(&skip_id) {
            return match aead::decrypt(&mk, ciphertext) {
                Ok(pt) => {
                    mk.zeroize();
                    Ok(pt)
                }
                Err(e) => {
                    // Forged payload: put the key back, nothing changed.
                    self.skipped.insert(skip_id, mk);
                    Err(e)
                }
            };
        }

        let ratchet_needed = match self.dhr {
            Some(ref current) => *current != remote,
            None => true,
        };

        // 2. Validate skip bounds before touching any state.
        if ratchet_needed {
            if self.ck_recv.is_some() {
                check_skip_bound(self.nr, header.pn)?;
            }
            check_skip_bound(0, header.n)?;
        } else {
            check_skip_bound(self.nr, header.n)?;
        }

        // 3. DH ratchet step on a new remote key. Committed eagerly: the
        //    step depends only on the header's ratchet key.
        if ratchet_needed {
            if self.ck_recv.is_some() {
                self.close_receiving_chain(header.pn);
            }

            self.pn = self.ns;
            self.ns = 0;
            self.nr = 0;
            self.dhr = Some(remote.clone());

            let dh_recv = self.dhs.agree(&remote);
            let (rk, ck_recv) = kdf::kdf_root(&self.root_key, &dh_recv)?;
            self.root_key = rk;
            self.ck_recv = Some(ck_recv);

            let new_dhs = DhKeyPair::generate();
            let dh_send = new_dhs.agree(&remote);
            let (rk, ck_send) = kdf::kdf_root(&self.root_key, &dh_send)?;
            self.root_key = rk;
            self.ck_send = Some(ck_send);
            self.dhs = new_dhs;
        }

        // 4. Symmetric advance on temporaries; committed only if the
        //    ciphertext authenticates.
        let mut ck = self.ck_recv.ok_or(CryptoError::NotInitialized)?;
        let chain = remote.sec1_b64();
        let mut nr = self.nr;
        let mut pending: Vec<(SkipId, [u8; 32])> = Vec::new();
        while nr < header.n {
            let (next, mk) = kdf::kdf_chain(&ck);
            pending.push(((chain.clone(), nr), mk));
            ck = next;
            nr += 1;
        }
        let (next_ck, mut mk) = kdf::kdf_chain(&ck);

        match aead::decrypt(&mk, ciphertext) {
            Ok(pt) => {
                mk.zeroize();
                for (id, pending_mk) in pending {
                    self.skipped.insert(id, pending_mk);
                }
                self.ck_recv = Some(next_ck);
                self.nr = nr + 1;
                self.enforce_cache_cap();
                Ok(pt)
            }
            Err(e) => {
                mk.zeroize();
                ck.zeroize();
                for (_, pending_mk) in pending.iter_mut() {
                    pending_mk.zeroize();
                }
                Err(e)
            }
        }
    }

    // ── Internal ─────────────────────────────────────────────────────────

    /// Cache the unseen tail of the old receiving chain before a DH ratchet
    /// step abandons it. Bounds were validated by the caller.
    fn close_receiving_chain(&mut self, until: u32) {
        let Some(mut ck) = self.ck_recv else { return };
        let chain = match self.dhr {
            Some(ref k) => k.sec1_b64(),
            None => return,
        };
        while self.nr < until {
            let (next, mk) = kdf::kdf_chain(&ck);
            self.skipped.insert((chain.clone(), self.nr), mk);
            ck = next;
            self.nr += 1;
        }
        self.ck_recv = Some(ck);
        self.enforce_cache_cap();
    }

    /// Keep the cache bounded; oldest entries across superseded chains go
    /// first only incidentally (eviction order is unspecified).
    fn enforce_cache_cap(&mut self) {
        while self.skipped.len() > MAX_SKIP as usize {
            if let Some(id) = self.skipped.keys().next().cloned() {
                if let Some(mut mk) = self.skipped.remove(&id) {
                    mk.zeroize();
                }
            }
        }
    }

    // ── Serialization ────────────────────────────────────────────────────

    pub fn snapshot(&self) -> RatchetSnapshot {
        RatchetSnapshot {
            dhs: self.dhs.to_jwk(),
            dhr: self.dhr.as_ref().map(|k| k.to_jwk()),
            root_key: b64e(&self.root_key),
            ck_send: self.ck_send.as_ref().map(|ck| b64e(ck)),
            ck_recv: self.ck_recv.as_ref().map(|ck| b64e(ck)),
            ns: self.ns,
            nr: self.nr,
            pn: self.pn,
            skipped: self
                .skipped
                .iter()
                .map(|((dh, n), mk)| SkippedKey {
                    dh: dh.clone(),
                    n: *n,
                    mk: b64e(mk),
                })
                .collect(),
        }
    }

    pub fn from_snapshot(snap: &RatchetSnapshot) -> Result<Self, CryptoError> {
        let mut skipped = HashMap::with_capacity(snap.skipped.len());
        for entry in &snap.skipped {
            skipped.insert((entry.dh.clone(), entry.n), to_key32(&entry.mk)?);
        }
        Ok(Self {
            dhs: DhKeyPair::from_jwk(&snap.dhs)?,
            dhr: snap.dhr.as_ref().map(DhPublicKey::from_jwk).transpose()?,
            root_key: to_key32(&snap.root_key)?,
            ck_send: snap.ck_send.as_deref().map(to_key32).transpose()?,
            ck_recv: snap.ck_recv.as_deref().map(to_key32).transpose()?,
            ns: snap.ns,
            nr: snap.nr,
            pn: snap.pn,
            skipped,
        })
    }
}

fn check_skip_bound(from: u32, until: u32) -> Result<(), CryptoError> {
    if until > from && until - from > MAX_SKIP {
        return Err(CryptoError::TooManySkipped {
            gap: until - from,
            max: MAX_SKIP,
        });
    }
    Ok(())
}

fn to_key32(s: &str) -> Result<[u8; 32], CryptoError> {
    b64d(s)?
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("expected 32-byte chain key".into()))
}

// ── Snapshot (stored form) ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedKey {
    pub dh: String,
    pub n: u32,
    pub mk: String,
}

/// Serialized ratchet state: keys in JWK form, secrets base64. Rehydration
/// re-imports all key material through the typed handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetSnapshot {
    pub dhs: Jwk,
    pub dhr: Option<Jwk>,
    pub root_key: String,
    pub ck_send: Option<String>,
    pub ck_recv: Option<String>,
    pub ns: u32,
    pub nr: u32,
    pub pn: u32,
    pub skipped: Vec<SkippedKey>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (RatchetState, RatchetState) {
        let shared = [42u8; 32];
        let bob_spk = DhKeyPair::generate();
        let alice = RatchetState::init_alice(&shared, bob_spk.public().clone()).unwrap();
        let bob = RatchetState::init_bob(&shared, bob_spk);
        (alice, bob)
    }

    #[test]
    fn conversation_with_ratchet_turns() {
        let (mut alice, mut bob) = pair();
        assert!(!bob.can_encrypt());

        for i in 0..3u32 {
            let msg = format!("alice {i}");
            let (h, ct) = alice.encrypt(msg.as_bytes()).unwrap();
            assert_eq!(&*bob.decrypt(&h, &ct).unwrap(), msg.as_bytes());
        }
        assert!(bob.can_encrypt());

        for i in 0..2u32 {
            let msg = format!("bob {i}");
            let (h, ct) = bob.encrypt(msg.as_bytes()).unwrap();
            assert_eq!(&*alice.decrypt(&h, &ct).unwrap(), msg.as_bytes());
        }

        let (h, ct) = alice.encrypt(b"again").unwrap();
        assert_eq!(&*bob.decrypt(&h, &ct).unwrap(), b"again");
    }

    #[test]
    fn encrypt_before_first_inbound_fails_for_responder() {
        let (_, mut bob) = pair();
        assert!(matches!(
            bob.encrypt(b"too early"),
            Err(CryptoError::NotInitialized)
        ));
    }

    #[test]
    fn out_of_order_within_one_chain() {
        let (mut alice, mut bob) = pair();

        let sent: Vec<_> = (0..4)
            .map(|i| {
                let msg = format!("m{i}");
                let (h, ct) = alice.encrypt(msg.as_bytes()).unwrap();
                (msg, h, ct)
            })
            .collect();

        // Deliver in order 2, 0, 3, 1.
        for idx in [2usize, 0, 3, 1] {
            let (msg, h, ct) = &sent[idx];
            assert_eq!(&*bob.decrypt(h, ct).unwrap(), msg.as_bytes());
        }
        assert_eq!(bob.skipped_len(), 0);
    }

    #[test]
    fn skipped_keys_survive_a_ratchet_turn() {
        let (mut alice, mut bob) = pair();

        let (h0, ct0) = alice.encrypt(b"first").unwrap();
        let (h1, ct1) = alice.encrypt(b"second").unwrap();

        // Bob only sees the second message, replies, and Alice ratchets.
        assert_eq!(&*bob.decrypt(&h1, &ct1).unwrap(), b"second");
        assert_eq!(bob.skipped_len(), 1);

        let (hb, ctb) = bob.encrypt(b"reply").unwrap();
        assert_eq!(&*alice.decrypt(&hb, &ctb).unwrap(), b"reply");

        let (h2, ct2) = alice.encrypt(b"third").unwrap();
        assert_eq!(&*bob.decrypt(&h2, &ct2).unwrap(), b"third");

        // The old chain's cached key still decrypts the straggler.
        assert_eq!(&*bob.decrypt(&h0, &ct0).unwrap(), b"first");
        assert_eq!(bob.skipped_len(), 0);
    }

    #[test]
    fn gap_over_max_skip_is_refused_without_state_change() {
        let (mut alice, mut bob) = pair();

        let mut last = None;
        for i in 0..=(MAX_SKIP + 44) {
            let (h, ct) = alice.encrypt(format!("m{i}").as_bytes()).unwrap();
            last = Some((h, ct));
        }
        let (h, ct) = last.unwrap();

        let before = serde_json::to_string(&bob.snapshot()).unwrap();
        assert!(matches!(
            bob.decrypt(&h, &ct),
            Err(CryptoError::TooManySkipped { .. })
        ));
        let after = serde_json::to_string(&bob.snapshot()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn gap_of_exactly_max_skip_is_accepted() {
        let (mut alice, mut bob) = pair();

        let mut last = None;
        for i in 0..=MAX_SKIP {
            let (h, ct) = alice.encrypt(format!("m{i}").as_bytes()).unwrap();
            last = Some((h, ct));
        }
        let (h, ct) = last.unwrap();
        assert_eq!(h.n, MAX_SKIP);
        assert!(bob.decrypt(&h, &ct).is_ok());
        assert_eq!(bob.skipped_len(), MAX_SKIP as usize);
    }

    #[test]
    fn forged_payload_does_not_advance_counters() {
        let (mut alice, mut bob) = pair();

        let (h0, ct0) = alice.encrypt(b"ok").unwrap();
        assert!(bob.decrypt(&h0, &ct0).is_ok());

        let (h1, mut ct1) = alice.encrypt(b"tampered").unwrap();
        ct1[0] ^= 0xFF;
        let (_, nr_before, _) = bob.counters();
        assert!(matches!(
            bob.decrypt(&h1, &ct1),
            Err(CryptoError::AeadDecrypt)
        ));
        let (_, nr_after, _) = bob.counters();
        assert_eq!(nr_before, nr_after);
        assert_eq!(bob.skipped_len(), 0);

        // The genuine ciphertext still decrypts afterwards.
        let (h1b, ct1b) = alice.encrypt(b"recovered").unwrap();
        assert!(matches!(
            bob.decrypt(&h1, &[0u8; 16]),
            Err(CryptoError::AeadDecrypt)
        ));
        assert_eq!(&*bob.decrypt(&h1b, &ct1b).unwrap(), b"recovered");
    }

    #[test]
    fn replayed_message_is_not_served_by_rewinding() {
        let (mut alice, mut bob) = pair();
        let (h, ct) = alice.encrypt(b"once").unwrap();
        assert!(bob.decrypt(&h, &ct).is_ok());
        // Same envelope again: the key is gone and the chain will not rewind.
        assert!(bob.decrypt(&h, &ct).is_err());
    }

    #[test]
    fn snapshot_roundtrip_mid_conversation() {
        let (mut alice, mut bob) = pair();

        let (h0, ct0) = alice.encrypt(b"before").unwrap();
        let (h1, ct1) = alice.encrypt(b"skipped").unwrap();
        let (h2, ct2) = alice.encrypt(b"after").unwrap();
        assert!(bob.decrypt(&h0, &ct0).is_ok());
        assert_eq!(&*bob.decrypt(&h2, &ct2).unwrap(), b"after");

        // Serialize Bob with a pending skipped key, rehydrate, keep going.
        let json = serde_json::to_string(&bob.snapshot()).unwrap();
        let snap: RatchetSnapshot = serde_json::from_str(&json).unwrap();
        let mut bob2 = RatchetState::from_snapshot(&snap).unwrap();
        assert_eq!(bob2.skipped_len(), 1);
        assert_eq!(&*bob2.decrypt(&h1, &ct1).unwrap(), b"skipped");

        let (hb, ctb) = bob2.encrypt(b"reply from the restored state").unwrap();
        assert_eq!(
            &*alice.decrypt(&hb, &ctb).unwrap(),
            b"reply from the restored state"
        );
    }

    #[test]
    fn local_ratchet_key_changes_after_a_turn() {
        let (mut alice, mut bob) = pair();
        let initial = alice.local_public().clone();

        let (h, ct) = alice.encrypt(b"hi").unwrap();
        bob.decrypt(&h, &ct).unwrap();
        let (hb, ctb) = bob.encrypt(b"yo").unwrap();
        alice.decrypt(&hb, &ctb).unwrap();

        assert_ne!(initial, *alice.local_public());
    }
}
