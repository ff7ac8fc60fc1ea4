//! Sqlite-backed persistence for the relay, grounded on the teacher's
//! `native/server/src/sqlite_brongnal.rs`: a thin wrapper around a
//! `tokio_rusqlite::Connection` with one method per query, `CREATE TABLE IF
//! NOT EXISTS` run at construction, WAL + NORMAL pragmas for a single-writer
//! relay process.
//!
//! The schema sketch in §6 names `identities`, `devices`,
//! `pairing_requests(+ encryption_keys blob)`, `conversations`,
//! `conversation_members`, `messages(+ encrypted_sender_keys)`, plus a long
//! tail of CRUD tables (`reactions`, `invites`, `blocks`, ...) explicitly
//! called out as "not part of the crypto core" (§6) — only the tables this
//! relay's endpoints actually touch are created here.

use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::VerifyingKey;
use protocol::model::{Conversation, Message, PublishedIdentity};
use rand_core::{OsRng, RngCore};
use rusqlite::{params, OptionalExtension};
use std::collections::{HashMap, HashSet};
use tokio_rusqlite::Connection;

use crate::error::AppError;

pub struct Database {
    conn: Connection,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

fn random_id(prefix: &str) -> String {
    use base64::Engine as _;
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    format!("{prefix}_{}", base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

impl Database {
    pub async fn open(path: std::path::PathBuf) -> Result<Self, AppError> {
        let conn = Connection::open(path).await?;
        conn.call(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "normal")?;
            conn.pragma_update(None, "foreign_keys", "on")?;

            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS identities (
                    moltbot_id TEXT PRIMARY KEY,
                    identity_public BLOB NOT NULL,
                    signed_pre_key_public BLOB NOT NULL,
                    pre_key_signature BLOB NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS one_time_pre_keys (
                    rowid INTEGER PRIMARY KEY AUTOINCREMENT,
                    moltbot_id TEXT NOT NULL REFERENCES identities(moltbot_id),
                    public BLOB NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS conversations (
                    id TEXT PRIMARY KEY,
                    created_at INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS conversation_members (
                    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                    moltbot_id TEXT NOT NULL,
                    is_admin INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (conversation_id, moltbot_id)
                );
                CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                    from_id TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    reply_to TEXT,
                    expires_at INTEGER,
                    ciphertext TEXT NOT NULL,
                    sender_key_version INTEGER NOT NULL,
                    message_index INTEGER NOT NULL,
                    encrypted_sender_keys TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS pairing_requests (
                    token TEXT PRIMARY KEY,
                    owner_moltbot_id TEXT NOT NULL,
                    encryption_keys_blob TEXT,
                    created_at INTEGER NOT NULL,
                    expires_at INTEGER NOT NULL
                );",
            )?;
            Ok(())
        })
        .await?;
        Ok(Database { conn })
    }

    pub async fn register_identity(
        &self,
        identity_public: [u8; 32],
        signed_pre_key_public: [u8; 32],
        pre_key_signature: Vec<u8>,
        one_time_pre_keys: Vec<[u8; 32]>,
    ) -> Result<PublishedIdentity, AppError> {
        let moltbot_id = random_id("moltbot");
        let published = PublishedIdentity {
            moltbot_id: moltbot_id.clone(),
            identity_public,
            signed_pre_key_public,
            pre_key_signature,
            one_time_pre_key_count: one_time_pre_keys.len(),
        };
        protocol::identity::verify_published_identity(&published)?;

        let created_at = now_millis();
        let moltbot_id_for_task = moltbot_id.clone();
        let published_for_task = published.clone();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO identities (moltbot_id, identity_public, signed_pre_key_public, pre_key_signature, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        moltbot_id_for_task,
                        published_for_task.identity_public.to_vec(),
                        published_for_task.signed_pre_key_public.to_vec(),
                        published_for_task.pre_key_signature,
                        created_at,
                    ],
                )?;
                for key in one_time_pre_keys {
                    tx.execute(
                        "INSERT INTO one_time_pre_keys (moltbot_id, public, created_at) VALUES (?1, ?2, ?3)",
                        params![moltbot_id_for_task, key.to_vec(), created_at],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(published)
    }

    pub async fn fetch_identity(&self, moltbot_id: &str) -> Result<Option<PublishedIdentity>, AppError> {
        let id = moltbot_id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let result = conn
                    .query_row(
                        "SELECT identity_public, signed_pre_key_public, pre_key_signature FROM identities WHERE moltbot_id = ?1",
                        [&id],
                        |row| {
                            let identity_public: Vec<u8> = row.get(0)?;
                            let signed_pre_key_public: Vec<u8> = row.get(1)?;
                            let pre_key_signature: Vec<u8> = row.get(2)?;
                            Ok((identity_public, signed_pre_key_public, pre_key_signature))
                        },
                    )
                    .optional()?;
                let Some((identity_public, signed_pre_key_public, pre_key_signature)) = result else {
                    return Ok(None);
                };
                let count: usize = conn.query_row(
                    "SELECT COUNT(*) FROM one_time_pre_keys WHERE moltbot_id = ?1",
                    [&id],
                    |row| row.get(0),
                )?;
                Ok(Some((identity_public, signed_pre_key_public, pre_key_signature, count)))
            })
            .await?;

        let Some((identity_public, signed_pre_key_public, pre_key_signature, count)) = row else {
            return Ok(None);
        };
        Ok(Some(PublishedIdentity {
            moltbot_id: moltbot_id.to_string(),
            identity_public: identity_public
                .try_into()
                .map_err(|_| protocol::MoltdmError::Validation("stored identity key malformed".to_string()))?,
            signed_pre_key_public: signed_pre_key_public
                .try_into()
                .map_err(|_| protocol::MoltdmError::Validation("stored SPK malformed".to_string()))?,
            pre_key_signature,
            one_time_pre_key_count: count,
        }))
    }

    pub async fn verifying_key_for(&self, moltbot_id: &str) -> Result<Option<VerifyingKey>, AppError> {
        Ok(self
            .fetch_identity(moltbot_id)
            .await?
            .and_then(|i| VerifyingKey::from_bytes(&i.identity_public).ok()))
    }

    pub async fn replenish_one_time_pre_keys(&self, moltbot_id: &str, keys: Vec<[u8; 32]>) -> Result<(), AppError> {
        let id = moltbot_id.to_string();
        let created_at = now_millis();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for key in keys {
                    tx.execute(
                        "INSERT INTO one_time_pre_keys (moltbot_id, public, created_at) VALUES (?1, ?2, ?3)",
                        params![id, key.to_vec(), created_at],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn consume_one_time_pre_key(&self, moltbot_id: &str) -> Result<Option<[u8; 32]>, AppError> {
        let id = moltbot_id.to_string();
        let key: Option<Vec<u8>> = self
            .conn
            .call(move |conn| {
                let result = conn
                    .query_row(
                        "DELETE FROM one_time_pre_keys
                         WHERE rowid = (SELECT rowid FROM one_time_pre_keys WHERE moltbot_id = ?1 ORDER BY rowid LIMIT 1)
                         RETURNING public",
                        [&id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(result)
            })
            .await?;
        match key {
            None => Ok(None),
            Some(bytes) => {
                let array: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| AppError(protocol::MoltdmError::Validation("stored one-time key malformed".to_string())))?;
                Ok(Some(array))
            }
        }
    }

    pub async fn create_conversation(&self, id: String, members: HashSet<String>, admins: HashSet<String>) -> Result<(), AppError> {
        let created_at = now_millis();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("INSERT INTO conversations (id, created_at) VALUES (?1, ?2)", params![id, created_at])?;
                for member in &members {
                    tx.execute(
                        "INSERT INTO conversation_members (conversation_id, moltbot_id, is_admin) VALUES (?1, ?2, ?3)",
                        params![id, member, admins.contains(member) as i64],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError> {
        let id_owned = id.to_string();
        let rows: Option<Vec<(String, bool)>> = self
            .conn
            .call(move |conn| {
                let exists: bool = conn
                    .query_row("SELECT 1 FROM conversations WHERE id = ?1", [&id_owned], |_| Ok(true))
                    .optional()?
                    .unwrap_or(false);
                if !exists {
                    return Ok(None);
                }
                let mut stmt = conn.prepare("SELECT moltbot_id, is_admin FROM conversation_members WHERE conversation_id = ?1")?;
                let rows = stmt
                    .query_map([&id_owned], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? != 0)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(Some(rows))
            })
            .await?;
        let Some(rows) = rows else { return Ok(None) };
        let mut members = HashSet::new();
        let mut admins = HashSet::new();
        for (moltbot_id, is_admin) in rows {
            if is_admin {
                admins.insert(moltbot_id.clone());
            }
            members.insert(moltbot_id);
        }
        Ok(Some(Conversation {
            id: id.to_string(),
            members,
            admins,
            sender_key_version: 0,
        }))
    }

    pub async fn is_member(&self, conversation_id: &str, moltbot_id: &str) -> Result<bool, AppError> {
        let conversation_id = conversation_id.to_string();
        let moltbot_id = moltbot_id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT 1 FROM conversation_members WHERE conversation_id = ?1 AND moltbot_id = ?2",
                        params![conversation_id, moltbot_id],
                        |_| Ok(true),
                    )
                    .optional()?
                    .unwrap_or(false))
            })
            .await?)
    }

    pub async fn add_member(&self, conversation_id: &str, moltbot_id: &str) -> Result<(), AppError> {
        let conversation_id = conversation_id.to_string();
        let moltbot_id = moltbot_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO conversation_members (conversation_id, moltbot_id, is_admin) VALUES (?1, ?2, 0)",
                    params![conversation_id, moltbot_id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn remove_member(&self, conversation_id: &str, moltbot_id: &str) -> Result<(), AppError> {
        let conversation_id = conversation_id.to_string();
        let moltbot_id = moltbot_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM conversation_members WHERE conversation_id = ?1 AND moltbot_id = ?2",
                    params![conversation_id, moltbot_id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn insert_message(&self, message: &Message) -> Result<(), AppError> {
        let message = message.clone();
        let encrypted_sender_keys = serde_json::to_string(&message.encrypted_sender_keys)
            .map_err(|e| protocol::MoltdmError::Validation(format!("encrypted_sender_keys serialize: {e}")))?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO messages (id, conversation_id, from_id, created_at, reply_to, expires_at, ciphertext, sender_key_version, message_index, encrypted_sender_keys)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        message.id,
                        message.conversation_id,
                        message.from_id,
                        message.created_at,
                        message.reply_to,
                        message.expires_at,
                        message.ciphertext,
                        message.sender_key_version as i64,
                        message.message_index as i64,
                        encrypted_sender_keys,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Messages in `conversation_id` created after `since_millis` (exclusive),
    /// excluding any already past their `expiresAt` — §6 "Messages with
    /// `expiresAt` past the current time are filtered from reads".
    pub async fn poll_messages(&self, conversation_id: &str, since_millis: i64) -> Result<Vec<Message>, AppError> {
        let conversation_id = conversation_id.to_string();
        let now = now_millis();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, conversation_id, from_id, created_at, reply_to, expires_at, ciphertext, sender_key_version, message_index, encrypted_sender_keys
                     FROM messages
                     WHERE conversation_id = ?1 AND created_at > ?2 AND (expires_at IS NULL OR expires_at > ?3)
                     ORDER BY created_at ASC",
                )?;
                let rows = stmt
                    .query_map(params![conversation_id, since_millis, now], |row| {
                        let encrypted_sender_keys: String = row.get(9)?;
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, Option<i64>>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, i64>(7)?,
                            row.get::<_, i64>(8)?,
                            encrypted_sender_keys,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(
                |(id, conversation_id, from_id, created_at, reply_to, expires_at, ciphertext, sender_key_version, message_index, encrypted_sender_keys)|
                    -> Result<Message, protocol::MoltdmError> {
                    let encrypted_sender_keys: HashMap<String, String> = serde_json::from_str(&encrypted_sender_keys)
                        .map_err(|e| protocol::MoltdmError::Validation(format!("encrypted_sender_keys deserialize: {e}")))?;
                    Ok(Message {
                        id,
                        conversation_id,
                        from_id,
                        created_at,
                        reply_to,
                        expires_at,
                        ciphertext,
                        sender_key_version: sender_key_version as u64,
                        message_index: message_index as u64,
                        encrypted_sender_keys,
                    })
                },
            )
            .collect::<Result<Vec<_>, protocol::MoltdmError>>()
            .map_err(AppError::from)
    }

    pub async fn create_pairing_request(&self, owner_moltbot_id: &str) -> Result<String, AppError> {
        let token = random_id("pair");
        let owner = owner_moltbot_id.to_string();
        let created_at = now_millis();
        let expires_at = created_at + 5 * 60 * 1000;
        let token_for_task = token.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO pairing_requests (token, owner_moltbot_id, encryption_keys_blob, created_at, expires_at) VALUES (?1, ?2, NULL, ?3, ?4)",
                    params![token_for_task, owner, created_at, expires_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(token)
    }

    pub async fn submit_pairing_blob(&self, token: &str, blob: String) -> Result<(), AppError> {
        let token = token.to_string();
        let now = now_millis();
        let updated = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE pairing_requests SET encryption_keys_blob = ?1 WHERE token = ?2 AND expires_at > ?3 AND encryption_keys_blob IS NULL",
                    params![blob, token, now],
                )?)
            })
            .await?;
        if updated == 0 {
            return Err(protocol::MoltdmError::Validation("unknown, expired, or already-submitted pairing token".to_string()).into());
        }
        Ok(())
    }

    /// Returns and clears the blob for `token` once present, so each pairing
    /// handshake's secret material is retrievable exactly once.
    pub async fn take_pairing_blob(&self, token: &str) -> Result<Option<String>, AppError> {
        let token = token.to_string();
        let now = now_millis();
        Ok(self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "DELETE FROM pairing_requests WHERE token = ?1 AND expires_at > ?2 AND encryption_keys_blob IS NOT NULL RETURNING encryption_keys_blob",
                        params![token, now],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?)
    }
}
