use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keys::{IdentityStore, PreKeyBatch, StoredIdentity};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Executor, Pool, Row, Sqlite, Transaction,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use tracing::info;

use shared::domain::{
    ContactAddress, ConversationId, DeviceOrdinal, GroupId, ParticipantRecord,
    ParticipantSessionRecord, RemoteSessionId, SenderAddress, SenderAddressError,
    SenderKeyRecord, SessionRecord, SyncFlags,
};

/// Job actions that carry session-addressed ciphertext.
pub const SESSION_JOB_ACTIONS: [&str; 2] = ["SEND_SESSION_MESSAGE", "SEND_SESSION_MESSAGES"];
pub const EXTENSION_SESSION_PREFERENCE: &str = "extension_session";

const KEYS_PROVISIONED_FLAG: &str = "keys_provisioned";
const SESSIONS_SYNCHRONIZED_FLAG: &str = "sessions_synchronized";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredJob {
    pub job_id: String,
    pub action: String,
    pub conversation_id: Option<ConversationId>,
    pub payload: Option<String>,
}

/// A sender-key row as read from disk. The `contact:ordinal` encoding is decoded here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderKeyRow {
    Parsed(SenderKeyRecord),
    Malformed {
        group_id: GroupId,
        error: SenderAddressError,
    },
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to `sqlite::memory:` opens a separate database.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn load_sync_flags(&self) -> Result<SyncFlags> {
        let rows = sqlx::query("SELECT flag, value FROM sync_state")
            .fetch_all(&self.pool)
            .await
            .context("failed to load sync flags")?;

        let mut flags = SyncFlags::default();
        for row in rows {
            let enabled = row.get::<i64, _>(1) != 0;
            match row.get::<String, _>(0).as_str() {
                KEYS_PROVISIONED_FLAG => flags.keys_provisioned = enabled,
                SESSIONS_SYNCHRONIZED_FLAG => flags.sessions_synchronized = enabled,
                _ => {}
            }
        }
        Ok(flags)
    }

    pub async fn mark_keys_provisioned(&self) -> Result<()> {
        set_flag(&self.pool, KEYS_PROVISIONED_FLAG)
            .await
            .context("failed to persist keys_provisioned flag")
    }

    /// Clears both bootstrap gates; called by the logout flow.
    pub async fn clear_sync_flags(&self) -> Result<()> {
        sqlx::query("DELETE FROM sync_state")
            .execute(&self.pool)
            .await
            .context("failed to clear sync flags")?;
        Ok(())
    }

    pub async fn upsert_session(&self, record: &SessionRecord) -> Result<()> {
        insert_session(&self.pool, record).await
    }

    pub async fn load_sessions(&self) -> Result<Vec<SessionRecord>> {
        fetch_sessions(&self.pool).await
    }

    pub async fn upsert_sender_key(&self, record: &SenderKeyRecord) -> Result<()> {
        insert_sender_key(&self.pool, record).await
    }

    pub async fn load_sender_keys(&self) -> Result<Vec<SenderKeyRow>> {
        fetch_sender_keys(&self.pool).await
    }

    pub async fn add_participant(
        &self,
        conversation_id: &ConversationId,
        contact: &ContactAddress,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO participants (conversation_id, user_id, created_at) VALUES (?, ?, ?)
             ON CONFLICT(conversation_id, user_id) DO NOTHING",
        )
        .bind(conversation_id.as_str())
        .bind(contact.as_str())
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_participants(&self) -> Result<Vec<ParticipantRecord>> {
        fetch_participants(&self.pool).await
    }

    pub async fn load_participant_sessions(&self) -> Result<Vec<ParticipantSessionRecord>> {
        let rows = sqlx::query(
            "SELECT conversation_id, user_id, session_id, sent_to_server, created_at
             FROM participant_sessions
             ORDER BY conversation_id ASC, user_id ASC, session_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ParticipantSessionRecord {
                conversation_id: ConversationId(r.get::<String, _>(0)),
                contact: ContactAddress(r.get::<String, _>(1)),
                session_id: RemoteSessionId(r.get::<String, _>(2)),
                delivery_ack: r.get::<Option<i64>, _>(3),
                created_at: r.get::<DateTime<Utc>, _>(4),
            })
            .collect())
    }

    pub async fn enqueue_job(
        &self,
        job_id: &str,
        action: &str,
        conversation_id: Option<&ConversationId>,
        payload: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs (job_id, action, conversation_id, payload) VALUES (?, ?, ?, ?)
             ON CONFLICT(job_id) DO UPDATE SET action = excluded.action, payload = excluded.payload",
        )
        .bind(job_id)
        .bind(action)
        .bind(conversation_id.map(|id| id.as_str()))
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_jobs(&self) -> Result<Vec<StoredJob>> {
        let rows = sqlx::query(
            "SELECT job_id, action, conversation_id, payload FROM jobs ORDER BY created_at ASC, job_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredJob {
                job_id: r.get::<String, _>(0),
                action: r.get::<String, _>(1),
                conversation_id: r.get::<Option<String>, _>(2).map(ConversationId),
                payload: r.get::<Option<String>, _>(3),
            })
            .collect())
    }

    /// Drops queued jobs that address ciphertext to specific sessions.
    pub async fn clear_session_jobs(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE action IN (?, ?)")
            .bind(SESSION_JOB_ACTIONS[0])
            .bind(SESSION_JOB_ACTIONS[1])
            .execute(&self.pool)
            .await
            .context("failed to clear session jobs")?;
        Ok(result.rows_affected())
    }

    pub async fn set_preference(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO preferences (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn preference(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM preferences WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn clear_preference(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM preferences WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_prekeys(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM prekeys")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Opens the transaction that carries one session synchronization run.
    pub async fn begin_sync(&self) -> Result<SyncTransaction> {
        let tx = self
            .pool
            .begin()
            .await
            .context("failed to begin session sync transaction")?;
        Ok(SyncTransaction { tx })
    }
}

/// Session-directory writes that must become visible together or not at all.
///
/// Dropping the value without calling [`SyncTransaction::commit`] rolls every
/// write back, including the `sessions_synchronized` flag.
pub struct SyncTransaction {
    tx: Transaction<'static, Sqlite>,
}

impl SyncTransaction {
    /// Replaces the whole session directory with `records`.
    pub async fn replace_sessions(&mut self, records: &[SessionRecord]) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM sessions")
            .execute(&mut *self.tx)
            .await
            .context("failed to clear sessions")?
            .rows_affected();
        for record in records {
            insert_session(&mut *self.tx, record).await?;
        }
        Ok(removed)
    }

    pub async fn load_sender_keys(&mut self) -> Result<Vec<SenderKeyRow>> {
        fetch_sender_keys(&mut *self.tx).await
    }

    /// Moves a sender key from `previous` to the address carried by `record`.
    pub async fn rewrite_sender_key(
        &mut self,
        previous: &SenderAddress,
        record: &SenderKeyRecord,
    ) -> Result<()> {
        self.delete_sender_key(&record.group_id, previous).await?;
        insert_sender_key(&mut *self.tx, record).await
    }

    pub async fn delete_sender_key(&mut self, group_id: &GroupId, sender: &SenderAddress) -> Result<()> {
        sqlx::query("DELETE FROM sender_keys WHERE group_id = ? AND sender_id = ?")
            .bind(group_id.as_str())
            .bind(sender.encode())
            .execute(&mut *self.tx)
            .await
            .with_context(|| format!("failed to remove sender key {group_id}/{sender}"))?;
        Ok(())
    }

    pub async fn load_participants(&mut self) -> Result<Vec<ParticipantRecord>> {
        fetch_participants(&mut *self.tx).await
    }

    pub async fn replace_participant_sessions(
        &mut self,
        records: &[ParticipantSessionRecord],
    ) -> Result<()> {
        sqlx::query("DELETE FROM participant_sessions")
            .execute(&mut *self.tx)
            .await
            .context("failed to clear participant sessions")?;
        for record in records {
            sqlx::query(
                "INSERT INTO participant_sessions (conversation_id, user_id, session_id, sent_to_server, created_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(conversation_id, user_id, session_id) DO UPDATE SET
                    sent_to_server = excluded.sent_to_server,
                    created_at = excluded.created_at",
            )
            .bind(record.conversation_id.as_str())
            .bind(record.contact.as_str())
            .bind(record.session_id.as_str())
            .bind(record.delivery_ack)
            .bind(record.created_at)
            .execute(&mut *self.tx)
            .await
            .context("failed to insert participant session")?;
        }
        Ok(())
    }

    pub async fn mark_sessions_synchronized(&mut self) -> Result<()> {
        set_flag(&mut *self.tx, SESSIONS_SYNCHRONIZED_FLAG)
            .await
            .context("failed to persist sessions_synchronized flag")
    }

    pub async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .context("failed to commit session sync transaction")
    }
}

async fn set_flag<'e, E>(executor: E, flag: &str) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO sync_state (flag, value) VALUES (?, 1)
         ON CONFLICT(flag) DO UPDATE SET value = 1",
    )
    .bind(flag)
    .execute(executor)
    .await?;
    Ok(())
}

async fn insert_session<'e, E>(executor: E, record: &SessionRecord) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO sessions (address, device, record, last_updated) VALUES (?, ?, ?, ?)
         ON CONFLICT(address, device) DO UPDATE SET record = excluded.record, last_updated = excluded.last_updated",
    )
    .bind(record.contact.as_str())
    .bind(record.device.0)
    .bind(record.cipher_state.as_slice())
    .bind(record.last_updated)
    .execute(executor)
    .await
    .with_context(|| {
        format!(
            "failed to write session {}:{}",
            record.contact, record.device
        )
    })?;
    Ok(())
}

async fn fetch_sessions<'e, E>(executor: E) -> Result<Vec<SessionRecord>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "SELECT address, device, record, last_updated FROM sessions ORDER BY address ASC, device ASC",
    )
    .fetch_all(executor)
    .await
    .context("failed to load sessions")?;

    Ok(rows
        .into_iter()
        .map(|r| SessionRecord {
            contact: ContactAddress(r.get::<String, _>(0)),
            device: DeviceOrdinal(r.get::<i32, _>(1)),
            cipher_state: r.get::<Vec<u8>, _>(2),
            last_updated: r.get::<DateTime<Utc>, _>(3),
        })
        .collect())
}

async fn insert_sender_key<'e, E>(executor: E, record: &SenderKeyRecord) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO sender_keys (group_id, sender_id, record) VALUES (?, ?, ?)
         ON CONFLICT(group_id, sender_id) DO UPDATE SET record = excluded.record",
    )
    .bind(record.group_id.as_str())
    .bind(record.sender.encode())
    .bind(record.cipher_state.as_slice())
    .execute(executor)
    .await
    .with_context(|| format!("failed to write sender key {}", record.sender))?;
    Ok(())
}

async fn fetch_sender_keys<'e, E>(executor: E) -> Result<Vec<SenderKeyRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "SELECT group_id, sender_id, record FROM sender_keys ORDER BY group_id ASC, sender_id ASC",
    )
    .fetch_all(executor)
    .await
    .context("failed to load sender keys")?;

    Ok(rows
        .into_iter()
        .map(|r| {
            let group_id = GroupId(r.get::<String, _>(0));
            match SenderAddress::parse(&r.get::<String, _>(1)) {
                Ok(sender) => SenderKeyRow::Parsed(SenderKeyRecord {
                    group_id,
                    sender,
                    cipher_state: r.get::<Vec<u8>, _>(2),
                }),
                Err(error) => SenderKeyRow::Malformed { group_id, error },
            }
        })
        .collect())
}

async fn fetch_participants<'e, E>(executor: E) -> Result<Vec<ParticipantRecord>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "SELECT conversation_id, user_id, created_at FROM participants
         ORDER BY conversation_id ASC, user_id ASC",
    )
    .fetch_all(executor)
    .await
    .context("failed to load participants")?;

    Ok(rows
        .into_iter()
        .map(|r| ParticipantRecord {
            conversation_id: ConversationId(r.get::<String, _>(0)),
            contact: ContactAddress(r.get::<String, _>(1)),
            created_at: r.get::<DateTime<Utc>, _>(2),
        })
        .collect())
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[async_trait]
impl IdentityStore for Storage {
    async fn save_local_identity(&self, identity: &StoredIdentity) -> Result<()> {
        sqlx::query(
            "INSERT INTO local_identity (id, registration_id, identity_private, signing_private)
             VALUES (1, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                registration_id = excluded.registration_id,
                identity_private = excluded.identity_private,
                signing_private = excluded.signing_private",
        )
        .bind(i64::from(identity.registration_id))
        .bind(identity.dh_private.as_slice())
        .bind(identity.signing_private.as_slice())
        .execute(&self.pool)
        .await
        .context("failed to save local identity")?;
        Ok(())
    }

    async fn load_local_identity(&self) -> Result<Option<StoredIdentity>> {
        let row = sqlx::query(
            "SELECT registration_id, identity_private, signing_private FROM local_identity WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("failed to load local identity")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let dh_private: [u8; 32] = row
            .get::<Vec<u8>, _>(1)
            .try_into()
            .map_err(|_| anyhow::anyhow!("stored identity key has an invalid length"))?;
        let signing_private: [u8; 32] = row
            .get::<Vec<u8>, _>(2)
            .try_into()
            .map_err(|_| anyhow::anyhow!("stored signing key has an invalid length"))?;
        Ok(Some(StoredIdentity {
            registration_id: u32::try_from(row.get::<i64, _>(0))
                .context("stored registration id out of range")?,
            dh_private,
            signing_private,
        }))
    }

    async fn save_prekeys(&self, batch: &PreKeyBatch) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let signed = &batch.signed_prekey;
        sqlx::query(
            "INSERT INTO signed_prekeys (prekey_id, public_key, private_key, signature) VALUES (?, ?, ?, ?)
             ON CONFLICT(prekey_id) DO UPDATE SET
                public_key = excluded.public_key,
                private_key = excluded.private_key,
                signature = excluded.signature",
        )
        .bind(i64::from(signed.id))
        .bind(signed.public.as_slice())
        .bind(signed.private.to_bytes().as_slice())
        .bind(signed.signature.as_slice())
        .execute(&mut *tx)
        .await
        .context("failed to save signed prekey")?;

        for prekey in &batch.one_time_prekeys {
            sqlx::query(
                "INSERT INTO prekeys (prekey_id, public_key, private_key) VALUES (?, ?, ?)
                 ON CONFLICT(prekey_id) DO UPDATE SET
                    public_key = excluded.public_key,
                    private_key = excluded.private_key",
            )
            .bind(i64::from(prekey.id))
            .bind(prekey.public.as_slice())
            .bind(prekey.private.to_bytes().as_slice())
            .execute(&mut *tx)
            .await
            .context("failed to save one-time prekey")?;
        }

        tx.commit().await?;
        info!(
            signed_prekey_id = signed.id,
            one_time_prekeys = batch.one_time_prekeys.len(),
            "signal: prekeys stored"
        );
        Ok(())
    }

    async fn last_prekey_id(&self) -> Result<Option<u32>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(prekey_id) FROM prekeys")
            .fetch_one(&self.pool)
            .await?;
        max.map(|id| u32::try_from(id).context("stored prekey id out of range"))
            .transpose()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
