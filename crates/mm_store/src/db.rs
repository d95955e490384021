//! Database abstraction over SQLite via sqlx.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};

use crate::{
    error::StoreError,
    models::{IdentityRow, OneTimePreKeyRow, SessionRow, SignedPreKeyRow},
};

/// Central store handle. Cheap to clone (the pool is an Arc internally).
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the SQLite database at `db_path` and run pending
    /// migrations. WAL mode is configured at connection time, not inside a
    /// migration — SQLite forbids changing `journal_mode` in a transaction
    /// and sqlx wraps every migration in one.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        Ok(Self { pool })
    }

    // ── Identity ─────────────────────────────────────────────────────────

    pub async fn put_identity(&self, row: &IdentityRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO identities \
             (user_id, dh_keypair, signing_keypair, registration_id, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&row.user_id)
        .bind(&row.dh_keypair)
        .bind(&row.signing_keypair)
        .bind(row.registration_id)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_identity(&self, user_id: &str) -> Result<Option<IdentityRow>, StoreError> {
        Ok(sqlx::query_as("SELECT * FROM identities WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn delete_identity(&self, user_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM identities WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Signed prekeys ───────────────────────────────────────────────────

    pub async fn put_signed_prekey(&self, row: &SignedPreKeyRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO signed_prekeys \
             (user_id, key_id, keypair, signature, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&row.user_id)
        .bind(row.key_id)
        .bind(&row.keypair)
        .bind(&row.signature)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_signed_prekey(
        &self,
        user_id: &str,
        key_id: i64,
    ) -> Result<Option<SignedPreKeyRow>, StoreError> {
        Ok(
            sqlx::query_as("SELECT * FROM signed_prekeys WHERE user_id = ? AND key_id = ?")
                .bind(user_id)
                .bind(key_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// The current signed prekey: highest id wins (ids are assigned
    /// monotonically).
    pub async fn latest_signed_prekey(
        &self,
        user_id: &str,
    ) -> Result<Option<SignedPreKeyRow>, StoreError> {
        Ok(sqlx::query_as(
            "SELECT * FROM signed_prekeys WHERE user_id = ? ORDER BY key_id DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    // ── One-time prekeys ─────────────────────────────────────────────────

    pub async fn put_one_time_prekey(&self, row: &OneTimePreKeyRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO one_time_prekeys (user_id, key_id, keypair, used) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&row.user_id)
        .bind(row.key_id)
        .bind(&row.keypair)
        .bind(row.used)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_one_time_prekey(
        &self,
        user_id: &str,
        key_id: i64,
    ) -> Result<Option<OneTimePreKeyRow>, StoreError> {
        Ok(
            sqlx::query_as("SELECT * FROM one_time_prekeys WHERE user_id = ? AND key_id = ?")
                .bind(user_id)
                .bind(key_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn delete_one_time_prekey(
        &self,
        user_id: &str,
        key_id: i64,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM one_time_prekeys WHERE user_id = ? AND key_id = ?")
            .bind(user_id)
            .bind(key_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_unused_one_time_prekeys(
        &self,
        user_id: &str,
    ) -> Result<Vec<OneTimePreKeyRow>, StoreError> {
        Ok(sqlx::query_as(
            "SELECT * FROM one_time_prekeys WHERE user_id = ? AND used = 0 ORDER BY key_id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    /// Write a session snapshot atomically (single-row upsert).
    pub async fn upsert_session(&self, row: &SessionRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sessions \
             (conversation_id, remote_user_id, ratchet, x3dh_completed, \
              initiator_ephemeral, one_time_prekey_id, pending_preamble, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(conversation_id) DO UPDATE SET \
               remote_user_id = excluded.remote_user_id, \
               ratchet = excluded.ratchet, \
               x3dh_completed = excluded.x3dh_completed, \
               initiator_ephemeral = excluded.initiator_ephemeral, \
               one_time_prekey_id = excluded.one_time_prekey_id, \
               pending_preamble = excluded.pending_preamble, \
               updated_at = excluded.updated_at",
        )
        .bind(&row.conversation_id)
        .bind(&row.remote_user_id)
        .bind(&row.ratchet)
        .bind(row.x3dh_completed)
        .bind(&row.initiator_ephemeral)
        .bind(row.one_time_prekey_id)
        .bind(&row.pending_preamble)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_session(
        &self,
        conversation_id: &str,
    ) -> Result<Option<SessionRow>, StoreError> {
        Ok(
            sqlx::query_as("SELECT * FROM sessions WHERE conversation_id = ?")
                .bind(conversation_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn delete_session(&self, conversation_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Metadata scalars ─────────────────────────────────────────────────

    pub async fn put_meta(&self, user_id: &str, name: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO meta (user_id, name, value) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(name)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_meta(&self, user_id: &str, name: &str) -> Result<Option<String>, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT value FROM meta WHERE user_id = ? AND name = ?")
                .bind(user_id)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    // ── Sign-out ─────────────────────────────────────────────────────────

    /// Delete every record. Called on sign-out; afterwards no secret bytes
    /// are readable through this interface.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        for table in [
            "identities",
            "signed_prekeys",
            "one_time_prekeys",
            "sessions",
            "meta",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&self.pool)
                .await?;
        }
        tracing::info!(target: "mm_store", event = "store_cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn identity_row(user: &str) -> IdentityRow {
        IdentityRow {
            user_id: user.into(),
            dh_keypair: "{\"kty\":\"EC\"}".into(),
            signing_keypair: "{\"kty\":\"EC\"}".into(),
            registration_id: 777,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn identity_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.db");

        {
            let store = Store::open(&path).await.unwrap();
            store.put_identity(&identity_row("alice")).await.unwrap();
        }

        let store = Store::open(&path).await.unwrap();
        let row = store.get_identity("alice").await.unwrap().unwrap();
        assert_eq!(row.registration_id, 777);
        assert!(store.get_identity("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_signed_prekey_picks_highest_id() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("keys.db")).await.unwrap();

        for key_id in [1i64, 3, 2] {
            store
                .put_signed_prekey(&SignedPreKeyRow {
                    user_id: "alice".into(),
                    key_id,
                    keypair: "{}".into(),
                    signature: "sig".into(),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let latest = store.latest_signed_prekey("alice").await.unwrap().unwrap();
        assert_eq!(latest.key_id, 3);
        // Older ones stay addressable by id.
        assert!(store.get_signed_prekey("alice", 1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn one_time_prekeys_delete_and_unused_listing() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("keys.db")).await.unwrap();

        for key_id in 1i64..=3 {
            store
                .put_one_time_prekey(&OneTimePreKeyRow {
                    user_id: "bob".into(),
                    key_id,
                    keypair: "{}".into(),
                    used: false,
                })
                .await
                .unwrap();
        }

        store.delete_one_time_prekey("bob", 2).await.unwrap();
        let unused = store.list_unused_one_time_prekeys("bob").await.unwrap();
        assert_eq!(
            unused.iter().map(|r| r.key_id).collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert!(store.get_one_time_prekey("bob", 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn session_upsert_overwrites_in_place() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("keys.db")).await.unwrap();

        let mut row = SessionRow {
            conversation_id: "c1".into(),
            remote_user_id: "bob".into(),
            ratchet: "{\"ns\":0}".into(),
            x3dh_completed: false,
            initiator_ephemeral: None,
            one_time_prekey_id: Some(4),
            pending_preamble: Some("{\"identityKey\":{}}".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.upsert_session(&row).await.unwrap();

        row.ratchet = "{\"ns\":1}".into();
        row.pending_preamble = None;
        store.upsert_session(&row).await.unwrap();

        let back = store.get_session("c1").await.unwrap().unwrap();
        assert_eq!(back.ratchet, "{\"ns\":1}");
        assert!(back.pending_preamble.is_none());
        assert_eq!(back.one_time_prekey_id, Some(4));
    }

    #[tokio::test]
    async fn meta_scalars_roundtrip() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("keys.db")).await.unwrap();

        assert!(store.get_meta("alice", "last_rotation").await.unwrap().is_none());
        store.put_meta("alice", "last_rotation", "2026-01-01T00:00:00Z").await.unwrap();
        store.put_meta("alice", "last_rotation", "2026-02-01T00:00:00Z").await.unwrap();
        assert_eq!(
            store.get_meta("alice", "last_rotation").await.unwrap().as_deref(),
            Some("2026-02-01T00:00:00Z")
        );
    }

    #[tokio::test]
    async fn clear_all_leaves_nothing_readable() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("keys.db")).await.unwrap();

        store.put_identity(&identity_row("alice")).await.unwrap();
        store.put_meta("alice", "next_signed_prekey_id", "2").await.unwrap();
        store
            .put_one_time_prekey(&OneTimePreKeyRow {
                user_id: "alice".into(),
                key_id: 1,
                keypair: "{}".into(),
                used: false,
            })
            .await
            .unwrap();

        store.clear_all().await.unwrap();

        assert!(store.get_identity("alice").await.unwrap().is_none());
        assert!(store.get_meta("alice", "next_signed_prekey_id").await.unwrap().is_none());
        assert!(store.list_unused_one_time_prekeys("alice").await.unwrap().is_empty());
    }
}
