//! Key directory surface — the external service holding public prekey
//! material. The engine consumes it through this narrow interface; the
//! directory's internals (auth, persistence, replication) are not its
//! concern.
//!
//! The one multi-party critical section in the whole protocol lives here:
//! `claim_one_time_prekey` must atomically select an unused key, mark it
//! used, and return it, so concurrent initiators never draw the same key
//! (SELECT-FOR-UPDATE SKIP LOCKED semantics on a SQL directory). When the
//! pool is exhausted the claim returns `None` and X3DH proceeds without
//! the optional fourth DH.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;

use mm_proto::{IdentityRecord, OneTimePreKeyRecord, SignedPreKeyRecord};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected directory response: {0}")]
    UnexpectedResponse(String),
}

#[allow(async_fn_in_trait)]
pub trait KeyDirectory {
    async fn upsert_identity(&self, record: &IdentityRecord) -> Result<(), DirectoryError>;

    async fn upsert_signed_prekey(
        &self,
        user_id: &str,
        record: &SignedPreKeyRecord,
    ) -> Result<(), DirectoryError>;

    async fn publish_one_time_prekeys(
        &self,
        user_id: &str,
        records: &[OneTimePreKeyRecord],
    ) -> Result<(), DirectoryError>;

    async fn unused_one_time_prekey_count(&self, user_id: &str) -> Result<u32, DirectoryError>;

    async fn fetch_identity(&self, user_id: &str)
        -> Result<Option<IdentityRecord>, DirectoryError>;

    /// The user's latest published signed prekey.
    async fn fetch_signed_prekey(
        &self,
        user_id: &str,
    ) -> Result<Option<SignedPreKeyRecord>, DirectoryError>;

    /// Atomically claim one unused one-time prekey, or `None` if exhausted.
    /// A given (user, key id) is handed to at most one caller, ever.
    async fn claim_one_time_prekey(
        &self,
        user_id: &str,
    ) -> Result<Option<OneTimePreKeyRecord>, DirectoryError>;
}

// ── In-process directory ─────────────────────────────────────────────────────

#[derive(Default)]
struct DirectoryUser {
    identity: Option<IdentityRecord>,
    signed_prekeys: Vec<SignedPreKeyRecord>,
    one_time: Vec<(OneTimePreKeyRecord, bool)>,
}

/// In-memory directory for tests and single-process deployments. All state
/// sits behind one async mutex, so a claim selects and marks its row before
/// any other claimant can observe it.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    users: Arc<Mutex<HashMap<String, DirectoryUser>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyDirectory for MemoryDirectory {
    async fn upsert_identity(&self, record: &IdentityRecord) -> Result<(), DirectoryError> {
        let mut users = self.users.lock().await;
        users
            .entry(record.user_id.clone())
            .or_default()
            .identity = Some(record.clone());
        Ok(())
    }

    async fn upsert_signed_prekey(
        &self,
        user_id: &str,
        record: &SignedPreKeyRecord,
    ) -> Result<(), DirectoryError> {
        let mut users = self.users.lock().await;
        let user = users.entry(user_id.to_string()).or_default();
        user.signed_prekeys.retain(|r| r.key_id != record.key_id);
        user.signed_prekeys.push(record.clone());
        Ok(())
    }

    async fn publish_one_time_prekeys(
        &self,
        user_id: &str,
        records: &[OneTimePreKeyRecord],
    ) -> Result<(), DirectoryError> {
        let mut users = self.users.lock().await;
        let user = users.entry(user_id.to_string()).or_default();
        for record in records {
            user.one_time.push((record.clone(), false));
        }
        Ok(())
    }

    async fn unused_one_time_prekey_count(&self, user_id: &str) -> Result<u32, DirectoryError> {
        let users = self.users.lock().await;
        Ok(users
            .get(user_id)
            .map(|u| u.one_time.iter().filter(|(_, used)| !used).count() as u32)
            .unwrap_or(0))
    }

    async fn fetch_identity(
        &self,
        user_id: &str,
    ) -> Result<Option<IdentityRecord>, DirectoryError> {
        let users = self.users.lock().await;
        Ok(users.get(user_id).and_then(|u| u.identity.clone()))
    }

    async fn fetch_signed_prekey(
        &self,
        user_id: &str,
    ) -> Result<Option<SignedPreKeyRecord>, DirectoryError> {
        let users = self.users.lock().await;
        Ok(users
            .get(user_id)
            .and_then(|u| u.signed_prekeys.iter().max_by_key(|r| r.key_id).cloned()))
    }

    async fn claim_one_time_prekey(
        &self,
        user_id: &str,
    ) -> Result<Option<OneTimePreKeyRecord>, DirectoryError> {
        let mut users = self.users.lock().await;
        let Some(user) = users.get_mut(user_id) else {
            return Ok(None);
        };
        // Select-and-mark under the lock: no two claimants see the same row.
        for (record, used) in user.one_time.iter_mut() {
            if !*used {
                *used = true;
                return Ok(Some(record.clone()));
            }
        }
        Ok(None)
    }
}

// ── HTTP directory client ────────────────────────────────────────────────────

/// JSON/REST client for a remote key directory.
pub struct HttpDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDirectory {
    pub fn new(base_url: impl Into<String>) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }
}

impl KeyDirectory for HttpDirectory {
    async fn upsert_identity(&self, record: &IdentityRecord) -> Result<(), DirectoryError> {
        let resp = self
            .client
            .put(self.url(&format!("/users/{}/identity", record.user_id)))
            .json(record)
            .send()
            .await?;
        ensure_success(resp).await.map(|_| ())
    }

    async fn upsert_signed_prekey(
        &self,
        user_id: &str,
        record: &SignedPreKeyRecord,
    ) -> Result<(), DirectoryError> {
        let resp = self
            .client
            .put(self.url(&format!(
                "/users/{user_id}/signed-prekeys/{}",
                record.key_id
            )))
            .json(record)
            .send()
            .await?;
        ensure_success(resp).await.map(|_| ())
    }

    async fn publish_one_time_prekeys(
        &self,
        user_id: &str,
        records: &[OneTimePreKeyRecord],
    ) -> Result<(), DirectoryError> {
        let resp = self
            .client
            .post(self.url(&format!("/users/{user_id}/one-time-prekeys")))
            .json(&records)
            .send()
            .await?;
        ensure_success(resp).await.map(|_| ())
    }

    async fn unused_one_time_prekey_count(&self, user_id: &str) -> Result<u32, DirectoryError> {
        #[derive(serde::Deserialize)]
        struct Count {
            count: u32,
        }
        let resp = self
            .client
            .get(self.url(&format!("/users/{user_id}/one-time-prekeys/count")))
            .send()
            .await?;
        let resp = ensure_success(resp).await?;
        Ok(resp.json::<Count>().await?.count)
    }

    async fn fetch_identity(
        &self,
        user_id: &str,
    ) -> Result<Option<IdentityRecord>, DirectoryError> {
        let resp = self
            .client
            .get(self.url(&format!("/users/{user_id}/identity")))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = ensure_success(resp).await?;
        Ok(Some(resp.json().await?))
    }

    async fn fetch_signed_prekey(
        &self,
        user_id: &str,
    ) -> Result<Option<SignedPreKeyRecord>, DirectoryError> {
        let resp = self
            .client
            .get(self.url(&format!("/users/{user_id}/signed-prekey")))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = ensure_success(resp).await?;
        Ok(Some(resp.json().await?))
    }

    async fn claim_one_time_prekey(
        &self,
        user_id: &str,
    ) -> Result<Option<OneTimePreKeyRecord>, DirectoryError> {
        let resp = self
            .client
            .post(self.url(&format!("/users/{user_id}/one-time-prekeys/claim")))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = ensure_success(resp).await?;
        Ok(Some(resp.json().await?))
    }
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, DirectoryError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        let body = resp.text().await.unwrap_or_default();
        Err(DirectoryError::UnexpectedResponse(format!(
            "{status}: {body}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mm_crypto::keys::DhKeyPair;

    fn otp(id: u32) -> OneTimePreKeyRecord {
        OneTimePreKeyRecord {
            key_id: id,
            public_key: DhKeyPair::generate().public().to_jwk(),
        }
    }

    #[tokio::test]
    async fn claim_hands_out_each_key_once() {
        let dir = MemoryDirectory::new();
        dir.publish_one_time_prekeys("bob", &[otp(1), otp(2)])
            .await
            .unwrap();

        let a = dir.claim_one_time_prekey("bob").await.unwrap().unwrap();
        let b = dir.claim_one_time_prekey("bob").await.unwrap().unwrap();
        assert_ne!(a.key_id, b.key_id);
        assert!(dir.claim_one_time_prekey("bob").await.unwrap().is_none());
        assert_eq!(dir.unused_one_time_prekey_count("bob").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_claims_never_collide() {
        let dir = MemoryDirectory::new();
        let records: Vec<_> = (1..=16).map(otp).collect();
        dir.publish_one_time_prekeys("bob", &records).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let dir = dir.clone();
            handles.push(tokio::spawn(async move {
                dir.claim_one_time_prekey("bob").await.unwrap()
            }));
        }

        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(rec) = handle.await.unwrap() {
                claimed.push(rec.key_id);
            }
        }
        claimed.sort_unstable();
        let before = claimed.len();
        claimed.dedup();
        assert_eq!(before, claimed.len(), "a key id was claimed twice");
        assert_eq!(claimed.len(), 16);
    }

    #[tokio::test]
    async fn latest_signed_prekey_wins() {
        let dir = MemoryDirectory::new();
        let make = |id: u32| SignedPreKeyRecord {
            key_id: id,
            public_key: DhKeyPair::generate().public().to_jwk(),
            signature: "sig".into(),
        };
        dir.upsert_signed_prekey("bob", &make(1)).await.unwrap();
        dir.upsert_signed_prekey("bob", &make(2)).await.unwrap();
        assert_eq!(
            dir.fetch_signed_prekey("bob").await.unwrap().unwrap().key_id,
            2
        );
    }
}
