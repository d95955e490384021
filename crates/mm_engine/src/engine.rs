//! Protocol orchestrator — the facade the chat layer talks to.
//!
//! Owns the local identity, the prekey lifecycle (publication, weekly
//! rotation, pool refill), the per-conversation session cache, and the
//! encrypt/decrypt paths that tie X3DH and the Double Ratchet together.
//!
//! Concurrency: each conversation has one `Mutex`-guarded slot; the
//! (load session, advance ratchet, persist session) sequence runs entirely
//! under that guard, so two operations on the same conversation observe
//! strictly ordered ratchet states. Operations on different conversations
//! proceed in parallel. Rotation and refill writes serialise on a per-user
//! maintenance guard and never block conversation traffic.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tokio::sync::{Mutex, RwLock};

use mm_crypto::{
    fingerprint,
    keys::{DhKeyPair, DhPublicKey, Jwk, SigningKeyPair},
    ratchet::{RatchetSnapshot, RatchetState},
    x3dh, CryptoError,
};
use mm_proto::{
    Envelope, IdentityRecord, OneTimePreKeyRecord, PrekeyBundle, SignedPreKeyRecord,
    X3dhPreamble, ENVELOPE_VERSION,
};
use mm_store::{
    models::{IdentityRow, OneTimePreKeyRow, SessionRow, SignedPreKeyRow},
    Store,
};

use crate::{directory::KeyDirectory, error::EngineError};

const ROTATION_DAYS: i64 = 7;
const ONE_TIME_POOL_TARGET: u32 = 20;
const ONE_TIME_REFILL_THRESHOLD: u32 = 10;
const REGISTRATION_ID_BOUND: u32 = 1 << 14;

const META_NEXT_SIGNED: &str = "next_signed_prekey_id";
const META_NEXT_ONE_TIME: &str = "next_one_time_prekey_id";
const META_LAST_ROTATION: &str = "last_rotation";

/// Outcome of a successful decrypt call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decrypted {
    Plaintext(String),
    /// The input was not a protocol envelope; passed through unchanged.
    NotEncrypted(String),
}

struct LocalIdentity {
    dh: DhKeyPair,
    signing: SigningKeyPair,
    registration_id: u32,
}

struct LiveSession {
    ratchet: RatchetState,
    remote_user_id: String,
    x3dh_completed: bool,
    initiator_ephemeral: Option<Jwk>,
    one_time_prekey_id: Option<u32>,
    /// Preamble waiting to ride on the next outgoing envelope (initiator
    /// side, first message only).
    pending_preamble: Option<X3dhPreamble>,
    created_at: DateTime<Utc>,
}

type SessionSlot = Arc<Mutex<Option<LiveSession>>>;

/// One engine per signed-in user.
pub struct Engine<D: KeyDirectory> {
    user_id: String,
    store: Store,
    directory: D,
    identity: RwLock<Option<Arc<LocalIdentity>>>,
    sessions: RwLock<HashMap<String, SessionSlot>>,
    maintenance: Mutex<()>,
}

impl<D: KeyDirectory> Engine<D> {
    pub fn new(user_id: impl Into<String>, store: Store, directory: D) -> Self {
        Self {
            user_id: user_id.into(),
            store,
            directory,
            identity: RwLock::new(None),
            sessions: RwLock::new(HashMap::new()),
            maintenance: Mutex::new(()),
        }
    }

    /// Pure predicate over a candidate envelope string.
    pub fn is_signal_envelope(s: &str) -> bool {
        Envelope::is_signal_envelope(s)
    }

    // ── Initialization & prekey lifecycle ────────────────────────────────

    /// First use: generate and publish identity, signed prekey #1 and
    /// one-time prekeys 1..=20. Subsequent uses: re-publish if the
    /// directory lost our record (the directory, not local state, is what
    /// peers fetch from), then run the rotation and refill checks.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        let identity = self.ensure_identity().await?;

        if self.directory.fetch_identity(&self.user_id).await?.is_none() {
            tracing::info!(
                target: "mm_engine",
                event = "republish_public_material",
                user_id = %self.user_id
            );
            self.publish_public_material(&identity).await?;
        }

        let _guard = self.maintenance.lock().await;
        if let Err(e) = self.rotate_signed_prekey_if_due(&identity).await {
            tracing::warn!(target: "mm_engine", event = "rotation_failed", error = %e);
        }
        if let Err(e) = self.refill_one_time_prekeys().await {
            tracing::warn!(target: "mm_engine", event = "refill_failed", error = %e);
        }
        Ok(())
    }

    async fn ensure_identity(&self) -> Result<Arc<LocalIdentity>, EngineError> {
        if let Some(identity) = self.identity.read().await.clone() {
            return Ok(identity);
        }
        let mut slot = self.identity.write().await;
        if let Some(identity) = slot.clone() {
            return Ok(identity);
        }

        let identity = match self.store.get_identity(&self.user_id).await? {
            Some(row) => Arc::new(identity_from_row(&row)?),
            None => Arc::new(self.create_identity().await?),
        };
        *slot = Some(identity.clone());
        Ok(identity)
    }

    /// Identity already initialised, or `NotInitialized` — never creates.
    async fn require_identity(&self) -> Result<Arc<LocalIdentity>, EngineError> {
        if let Some(identity) = self.identity.read().await.clone() {
            return Ok(identity);
        }
        let mut slot = self.identity.write().await;
        if let Some(identity) = slot.clone() {
            return Ok(identity);
        }
        let row = self
            .store
            .get_identity(&self.user_id)
            .await?
            .ok_or(EngineError::NotInitialized)?;
        let identity = Arc::new(identity_from_row(&row)?);
        *slot = Some(identity.clone());
        Ok(identity)
    }

    async fn create_identity(&self) -> Result<LocalIdentity, EngineError> {
        let now = Utc::now();
        let identity = LocalIdentity {
            dh: DhKeyPair::generate(),
            signing: SigningKeyPair::generate(),
            registration_id: rand::thread_rng().gen_range(0..REGISTRATION_ID_BOUND),
        };

        self.store
            .put_identity(&IdentityRow {
                user_id: self.user_id.clone(),
                dh_keypair: jwk_string(&identity.dh.to_jwk()),
                signing_keypair: jwk_string(&identity.signing.to_jwk()),
                registration_id: identity.registration_id as i64,
                created_at: now,
            })
            .await?;

        let (spk, sig) = x3dh::generate_signed_prekey(&identity.signing);
        self.store
            .put_signed_prekey(&SignedPreKeyRow {
                user_id: self.user_id.clone(),
                key_id: 1,
                keypair: jwk_string(&spk.to_jwk()),
                signature: URL_SAFE_NO_PAD.encode(&sig),
                created_at: now,
            })
            .await?;

        let one_time = x3dh::generate_one_time_prekeys(ONE_TIME_POOL_TARGET as usize);
        for (offset, pair) in one_time.iter().enumerate() {
            self.store
                .put_one_time_prekey(&OneTimePreKeyRow {
                    user_id: self.user_id.clone(),
                    key_id: offset as i64 + 1,
                    keypair: jwk_string(&pair.to_jwk()),
                    used: false,
                })
                .await?;
        }

        self.store
            .put_meta(&self.user_id, META_NEXT_SIGNED, "2")
            .await?;
        self.store
            .put_meta(
                &self.user_id,
                META_NEXT_ONE_TIME,
                &(ONE_TIME_POOL_TARGET + 1).to_string(),
            )
            .await?;
        self.store
            .put_meta(&self.user_id, META_LAST_ROTATION, &now.to_rfc3339())
            .await?;

        self.directory
            .upsert_identity(&IdentityRecord {
                user_id: self.user_id.clone(),
                identity_key: identity.dh.public().to_jwk(),
                signing_key: identity.signing.public().to_jwk(),
                registration_id: identity.registration_id,
            })
            .await?;
        self.directory
            .upsert_signed_prekey(
                &self.user_id,
                &SignedPreKeyRecord {
                    key_id: 1,
                    public_key: spk.public().to_jwk(),
                    signature: URL_SAFE_NO_PAD.encode(sig),
                },
            )
            .await?;
        let batch: Vec<OneTimePreKeyRecord> = one_time
            .iter()
            .enumerate()
            .map(|(offset, pair)| OneTimePreKeyRecord {
                key_id: offset as u32 + 1,
                public_key: pair.public().to_jwk(),
            })
            .collect();
        self.directory
            .publish_one_time_prekeys(&self.user_id, &batch)
            .await?;

        tracing::info!(
            target: "mm_engine",
            event = "identity_initialized",
            user_id = %self.user_id,
            registration_id = identity.registration_id
        );
        Ok(identity)
    }

    /// Re-publish everything a peer needs to reach us, from local state.
    async fn publish_public_material(
        &self,
        identity: &LocalIdentity,
    ) -> Result<(), EngineError> {
        self.directory
            .upsert_identity(&IdentityRecord {
                user_id: self.user_id.clone(),
                identity_key: identity.dh.public().to_jwk(),
                signing_key: identity.signing.public().to_jwk(),
                registration_id: identity.registration_id,
            })
            .await?;

        if let Some(row) = self.store.latest_signed_prekey(&self.user_id).await? {
            let pair = dh_pair_from_stored(&row.keypair)?;
            self.directory
                .upsert_signed_prekey(
                    &self.user_id,
                    &SignedPreKeyRecord {
                        key_id: row.key_id as u32,
                        public_key: pair.public().to_jwk(),
                        signature: row.signature.clone(),
                    },
                )
                .await?;
        }

        let unused = self.store.list_unused_one_time_prekeys(&self.user_id).await?;
        if !unused.is_empty() {
            let batch: Vec<OneTimePreKeyRecord> = unused
                .iter()
                .map(|row| {
                    dh_pair_from_stored(&row.keypair).map(|pair| OneTimePreKeyRecord {
                        key_id: row.key_id as u32,
                        public_key: pair.public().to_jwk(),
                    })
                })
                .collect::<Result<_, _>>()?;
            self.directory
                .publish_one_time_prekeys(&self.user_id, &batch)
                .await?;
        }
        Ok(())
    }

    async fn rotate_signed_prekey_if_due(
        &self,
        identity: &LocalIdentity,
    ) -> Result<(), EngineError> {
        let due = match self.store.get_meta(&self.user_id, META_LAST_ROTATION).await? {
            Some(s) => match DateTime::parse_from_rfc3339(&s) {
                Ok(t) => Utc::now() - t.with_timezone(&Utc) >= Duration::days(ROTATION_DAYS),
                Err(_) => true,
            },
            None => true,
        };
        if !due {
            return Ok(());
        }

        let key_id: u32 = self
            .store
            .get_meta(&self.user_id, META_NEXT_SIGNED)
            .await?
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        let (pair, sig) = x3dh::generate_signed_prekey(&identity.signing);
        let now = Utc::now();
        // Older signed prekeys stay in the store so in-flight X3DH against
        // them can still complete.
        self.store
            .put_signed_prekey(&SignedPreKeyRow {
                user_id: self.user_id.clone(),
                key_id: key_id as i64,
                keypair: jwk_string(&pair.to_jwk()),
                signature: URL_SAFE_NO_PAD.encode(&sig),
                created_at: now,
            })
            .await?;
        self.directory
            .upsert_signed_prekey(
                &self.user_id,
                &SignedPreKeyRecord {
                    key_id,
                    public_key: pair.public().to_jwk(),
                    signature: URL_SAFE_NO_PAD.encode(&sig),
                },
            )
            .await?;
        self.store
            .put_meta(&self.user_id, META_NEXT_SIGNED, &(key_id + 1).to_string())
            .await?;
        self.store
            .put_meta(&self.user_id, META_LAST_ROTATION, &now.to_rfc3339())
            .await?;

        tracing::info!(
            target: "mm_engine",
            event = "signed_prekey_rotated",
            user_id = %self.user_id,
            key_id
        );
        Ok(())
    }

    async fn refill_one_time_prekeys(&self) -> Result<(), EngineError> {
        let count = self
            .directory
            .unused_one_time_prekey_count(&self.user_id)
            .await?;
        if count >= ONE_TIME_REFILL_THRESHOLD {
            return Ok(());
        }

        let need = ONE_TIME_POOL_TARGET - count;
        let start: u32 = self
            .store
            .get_meta(&self.user_id, META_NEXT_ONE_TIME)
            .await?
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        let fresh = x3dh::generate_one_time_prekeys(need as usize);
        let mut batch = Vec::with_capacity(fresh.len());
        for (offset, pair) in fresh.iter().enumerate() {
            let key_id = start + offset as u32;
            self.store
                .put_one_time_prekey(&OneTimePreKeyRow {
                    user_id: self.user_id.clone(),
                    key_id: key_id as i64,
                    keypair: jwk_string(&pair.to_jwk()),
                    used: false,
                })
                .await?;
            batch.push(OneTimePreKeyRecord {
                key_id,
                public_key: pair.public().to_jwk(),
            });
        }
        self.directory
            .publish_one_time_prekeys(&self.user_id, &batch)
            .await?;
        self.store
            .put_meta(
                &self.user_id,
                META_NEXT_ONE_TIME,
                &(start + need).to_string(),
            )
            .await?;

        tracing::info!(
            target: "mm_engine",
            event = "one_time_prekeys_refilled",
            user_id = %self.user_id,
            published = need,
            remote_unused = count
        );
        Ok(())
    }

    // ── Encrypt ──────────────────────────────────────────────────────────

    /// Encrypt one message for a conversation, creating the session (with a
    /// fresh X3DH run against the remote user's bundle) if none exists.
    /// Returns the serialized envelope.
    pub async fn encrypt(
        &self,
        conversation_id: &str,
        remote_user_id: &str,
        plaintext: &str,
    ) -> Result<String, EngineError> {
        let identity = self.require_identity().await?;

        let slot = self.session_slot(conversation_id).await;
        let mut guard = slot.lock().await;

        if guard.is_none() {
            *guard = self.load_session(conversation_id).await?;
        }
        if guard.is_none() {
            *guard = Some(self.start_session(&identity, remote_user_id).await?);
            tracing::info!(
                target: "mm_engine",
                event = "session_initiated",
                conversation_id = %conversation_id,
                remote_user_id = %remote_user_id
            );
        }

        let live = guard.as_mut().expect("session slot filled above");
        let (header, ciphertext) = live.ratchet.encrypt(plaintext.as_bytes())?;
        let envelope = Envelope {
            v: ENVELOPE_VERSION,
            header,
            ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
            x3dh: live.pending_preamble.take(),
        };
        let json = envelope.to_json()?;

        if let Err(e) = self.persist_session(conversation_id, live).await {
            // Drop the advanced in-memory state: the next operation reloads
            // the last persisted snapshot, so the caller sees a clean abort.
            *guard = None;
            return Err(e);
        }
        Ok(json)
    }

    async fn start_session(
        &self,
        identity: &LocalIdentity,
        remote_user_id: &str,
    ) -> Result<LiveSession, EngineError> {
        let remote_identity = self
            .directory
            .fetch_identity(remote_user_id)
            .await?
            .ok_or(EngineError::BundleUnavailable)?;
        let signed_prekey = self
            .directory
            .fetch_signed_prekey(remote_user_id)
            .await?
            .ok_or(EngineError::BundleUnavailable)?;
        let one_time_prekey = self.directory.claim_one_time_prekey(remote_user_id).await?;

        let bundle = PrekeyBundle {
            identity: remote_identity,
            signed_prekey,
            one_time_prekey,
        };
        let remote = bundle.to_remote().map_err(|e| {
            tracing::warn!(
                target: "mm_engine",
                event = "bundle_malformed",
                remote_user_id = %remote_user_id,
                error = %e
            );
            EngineError::BundleInvalid
        })?;

        let start = x3dh::initiate(&identity.dh, &remote).map_err(|e| match e {
            CryptoError::SignatureVerification => {
                tracing::warn!(
                    target: "mm_engine",
                    event = "bundle_signature_invalid",
                    remote_user_id = %remote_user_id
                );
                EngineError::BundleInvalid
            }
            other => EngineError::Crypto(other),
        })?;

        let ratchet = RatchetState::init_alice(&start.shared_secret, remote.signed_prekey.clone())?;
        let ephemeral_jwk = start.ephemeral.public().to_jwk();
        Ok(LiveSession {
            ratchet,
            remote_user_id: remote_user_id.to_string(),
            x3dh_completed: true,
            initiator_ephemeral: Some(ephemeral_jwk.clone()),
            one_time_prekey_id: start.used_one_time_prekey_id,
            pending_preamble: Some(X3dhPreamble {
                identity_key: identity.dh.public().to_jwk(),
                ephemeral_key: ephemeral_jwk,
                one_time_prekey_id: start.used_one_time_prekey_id,
            }),
            created_at: Utc::now(),
        })
    }

    // ── Decrypt ──────────────────────────────────────────────────────────

    /// Decrypt one envelope for a conversation. Non-protocol input passes
    /// through unchanged; a session is completed from the X3DH preamble if
    /// this is the initiator's first message.
    pub async fn decrypt(
        &self,
        conversation_id: &str,
        remote_user_id: &str,
        envelope: &str,
    ) -> Result<Decrypted, EngineError> {
        if !Envelope::is_signal_envelope(envelope) {
            return Ok(Decrypted::NotEncrypted(envelope.to_string()));
        }
        let identity = self.require_identity().await?;

        let env = Envelope::parse(envelope).map_err(|_| EngineError::Undecryptable)?;
        let ciphertext = URL_SAFE_NO_PAD
            .decode(&env.ciphertext)
            .map_err(|_| EngineError::Undecryptable)?;

        let slot = self.session_slot(conversation_id).await;
        let mut guard = slot.lock().await;

        if guard.is_none() {
            *guard = self.load_session(conversation_id).await?;
        }
        let mut consumed_one_time_prekey = None;
        if guard.is_none() {
            let preamble = env.x3dh.as_ref().ok_or(EngineError::NoSession)?;
            *guard = Some(
                self.complete_session(&identity, remote_user_id, preamble)
                    .await?,
            );
            consumed_one_time_prekey = preamble.one_time_prekey_id;
            tracing::info!(
                target: "mm_engine",
                event = "session_completed",
                conversation_id = %conversation_id,
                remote_user_id = %remote_user_id,
                one_time_prekey_id = ?preamble.one_time_prekey_id
            );
        }

        let live = guard.as_mut().expect("session slot filled above");
        let plaintext = match live.ratchet.decrypt(&env.header, &ciphertext) {
            Ok(pt) => pt,
            Err(e) => {
                tracing::debug!(
                    target: "mm_engine",
                    event = "decrypt_failed",
                    conversation_id = %conversation_id,
                    error = %e
                );
                return Err(EngineError::Undecryptable);
            }
        };
        let plaintext = String::from_utf8(plaintext.to_vec())
            .map_err(|_| EngineError::Undecryptable)?;

        if let Err(e) = self.persist_session(conversation_id, live).await {
            *guard = None;
            return Err(e);
        }

        // The consumed one-time prekey is gone for good only once the
        // completed session is durably recorded; until then a redelivered
        // first envelope can still re-complete.
        if let Some(key_id) = consumed_one_time_prekey {
            if let Err(e) = self
                .store
                .delete_one_time_prekey(&self.user_id, key_id as i64)
                .await
            {
                tracing::warn!(
                    target: "mm_engine",
                    event = "one_time_prekey_delete_failed",
                    key_id,
                    error = %e
                );
            }
        }

        Ok(Decrypted::Plaintext(plaintext))
    }

    async fn complete_session(
        &self,
        identity: &LocalIdentity,
        remote_user_id: &str,
        preamble: &X3dhPreamble,
    ) -> Result<LiveSession, EngineError> {
        // The preamble carries no signed-prekey id, so the latest local one
        // is used — matching the published bundle peers fetch. Rotated
        // prekeys are retained and indexed by id should the wire format
        // ever reference one explicitly.
        let spk_row = self
            .store
            .latest_signed_prekey(&self.user_id)
            .await?
            .ok_or(EngineError::Undecryptable)?;
        let signed_prekey =
            dh_pair_from_stored(&spk_row.keypair).map_err(|_| EngineError::Undecryptable)?;

        let one_time_prekey = match preamble.one_time_prekey_id {
            Some(key_id) => {
                let row = self
                    .store
                    .get_one_time_prekey(&self.user_id, key_id as i64)
                    .await?
                    .ok_or(EngineError::Undecryptable)?;
                Some(dh_pair_from_stored(&row.keypair).map_err(|_| EngineError::Undecryptable)?)
            }
            None => None,
        };

        let initiator_identity = DhPublicKey::from_jwk(&preamble.identity_key)
            .map_err(|_| EngineError::Undecryptable)?;
        let initiator_ephemeral = DhPublicKey::from_jwk(&preamble.ephemeral_key)
            .map_err(|_| EngineError::Undecryptable)?;

        let shared_secret = x3dh::respond(
            &identity.dh,
            &signed_prekey,
            one_time_prekey.as_ref(),
            &initiator_identity,
            &initiator_ephemeral,
        )
        .map_err(|_| EngineError::Undecryptable)?;

        Ok(LiveSession {
            ratchet: RatchetState::init_bob(&shared_secret, signed_prekey),
            remote_user_id: remote_user_id.to_string(),
            x3dh_completed: true,
            initiator_ephemeral: Some(preamble.ephemeral_key.clone()),
            one_time_prekey_id: preamble.one_time_prekey_id,
            pending_preamble: None,
            created_at: Utc::now(),
        })
    }

    // ── Session cache & persistence ──────────────────────────────────────

    async fn session_slot(&self, conversation_id: &str) -> SessionSlot {
        if let Some(slot) = self.sessions.read().await.get(conversation_id) {
            return slot.clone();
        }
        let mut map = self.sessions.write().await;
        map.entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    async fn load_session(
        &self,
        conversation_id: &str,
    ) -> Result<Option<LiveSession>, EngineError> {
        let Some(row) = self.store.get_session(conversation_id).await? else {
            return Ok(None);
        };
        let snapshot: RatchetSnapshot =
            serde_json::from_str(&row.ratchet).map_err(CryptoError::from)?;
        let ratchet = RatchetState::from_snapshot(&snapshot)?;
        let pending_preamble = row
            .pending_preamble
            .as_deref()
            .map(serde_json::from_str::<X3dhPreamble>)
            .transpose()
            .map_err(CryptoError::from)?;
        let initiator_ephemeral = row
            .initiator_ephemeral
            .as_deref()
            .map(serde_json::from_str::<Jwk>)
            .transpose()
            .map_err(CryptoError::from)?;

        Ok(Some(LiveSession {
            ratchet,
            remote_user_id: row.remote_user_id,
            x3dh_completed: row.x3dh_completed,
            initiator_ephemeral,
            one_time_prekey_id: row.one_time_prekey_id.map(|v| v as u32),
            pending_preamble,
            created_at: row.created_at,
        }))
    }

    async fn persist_session(
        &self,
        conversation_id: &str,
        live: &LiveSession,
    ) -> Result<(), EngineError> {
        let row = SessionRow {
            conversation_id: conversation_id.to_string(),
            remote_user_id: live.remote_user_id.clone(),
            ratchet: serde_json::to_string(&live.ratchet.snapshot())
                .map_err(CryptoError::from)?,
            x3dh_completed: live.x3dh_completed,
            initiator_ephemeral: live
                .initiator_ephemeral
                .as_ref()
                .map(|jwk| serde_json::to_string(jwk))
                .transpose()
                .map_err(CryptoError::from)?,
            one_time_prekey_id: live.one_time_prekey_id.map(|v| v as i64),
            pending_preamble: live
                .pending_preamble
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(CryptoError::from)?,
            created_at: live.created_at,
            updated_at: Utc::now(),
        };
        self.store.upsert_session(&row).await?;
        Ok(())
    }

    // ── Queries & sign-out ───────────────────────────────────────────────

    pub async fn has_session(&self, conversation_id: &str) -> Result<bool, EngineError> {
        if let Some(slot) = self.sessions.read().await.get(conversation_id) {
            if slot.lock().await.is_some() {
                return Ok(true);
            }
        }
        Ok(self.store.get_session(conversation_id).await?.is_some())
    }

    /// Safety number for us and a remote user, for out-of-band comparison.
    /// Both parties compute the identical string.
    pub async fn safety_number(&self, remote_user_id: &str) -> Result<String, EngineError> {
        let identity = self.require_identity().await?;
        let remote = self
            .directory
            .fetch_identity(remote_user_id)
            .await?
            .ok_or(EngineError::BundleUnavailable)?;
        let remote_key = DhPublicKey::from_jwk(&remote.identity_key)
            .map_err(|_| EngineError::BundleInvalid)?;
        Ok(fingerprint::safety_number(identity.dh.public(), &remote_key))
    }

    /// Sign-out: wipe local key material and the in-memory caches.
    pub async fn clear_all(&self) -> Result<(), EngineError> {
        self.sessions.write().await.clear();
        *self.identity.write().await = None;
        self.store.clear_all().await?;
        tracing::info!(target: "mm_engine", event = "engine_cleared", user_id = %self.user_id);
        Ok(())
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn jwk_string(jwk: &Jwk) -> String {
    serde_json::to_string(jwk).expect("JWK with string fields always serialises")
}

fn dh_pair_from_stored(s: &str) -> Result<DhKeyPair, CryptoError> {
    let jwk: Jwk = serde_json::from_str(s)?;
    DhKeyPair::from_jwk(&jwk)
}

fn identity_from_row(row: &IdentityRow) -> Result<LocalIdentity, EngineError> {
    let dh_jwk: Jwk = serde_json::from_str(&row.dh_keypair).map_err(CryptoError::from)?;
    let signing_jwk: Jwk = serde_json::from_str(&row.signing_keypair).map_err(CryptoError::from)?;
    Ok(LocalIdentity {
        dh: DhKeyPair::from_jwk(&dh_jwk)?,
        signing: SigningKeyPair::from_jwk(&signing_jwk)?,
        registration_id: row.registration_id as u32,
    })
}
