use crate::{
    chat::{ChatMessage, NewMessage},
    entity::{Profile, ProfileSummary, Role},
    error::{ChatError, Result},
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    ConnectOptions, Row, SqlitePool,
};
use std::{collections::HashMap, path::Path, str::FromStr};
use tracing::debug;
use uuid::Uuid;

const MESSAGE_COLUMNS: &str = "id, sender_id, sender_model, receiver_id, receiver_model, \
                               message, is_read, created_at, updated_at";

/// Message log and participant directory, backed by SQLite.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database file at `db_path`.
    pub async fn new(db_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    /// A private in-memory database. Pinned to one connection, since every
    /// SQLite connection to `:memory:` sees its own database.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Create the schema if it does not exist yet.
    pub async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                sender_id TEXT NOT NULL,
                sender_model TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                receiver_model TEXT NOT NULL,
                message TEXT NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages(sender_id, receiver_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_messages_receiver ON messages(receiver_id, is_read);

            CREATE TABLE IF NOT EXISTS profiles (
                id TEXT PRIMARY KEY,
                role TEXT NOT NULL,
                name TEXT NOT NULL,
                image TEXT,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    /// Insert or update a directory record.
    pub async fn save_profile(&self, profile: &Profile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO profiles (id, role, name, image, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                role = excluded.role,
                name = excluded.name,
                image = excluded.image,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&profile.id)
        .bind(profile.role.as_str())
        .bind(&profile.name)
        .bind(&profile.image)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn profile(&self, id: &str) -> Result<Option<Profile>> {
        let row = sqlx::query("SELECT id, role, name, image FROM profiles WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(profile_from_row).transpose()
    }

    /// Like [`Store::profile`], but a missing record is a `NotFound`.
    pub async fn require_profile(&self, id: &str) -> Result<Profile> {
        self.profile(id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("participant {id}")))
    }

    /// Persist a new message and return the stored record with display
    /// fields resolved. Publishing is left to the caller.
    pub async fn send(&self, new: &NewMessage) -> Result<ChatMessage> {
        new.validate()?;

        let now = now_millis();
        let msg = ChatMessage {
            id: Uuid::new_v4().to_string(),
            sender_id: new.sender.id.clone(),
            sender_model: new.sender.role,
            receiver_id: new.receiver.id.clone(),
            receiver_model: new.receiver.role,
            message: new.text.clone(),
            is_read: false,
            created_at: from_millis(now)?,
            updated_at: Some(from_millis(now)?),
            sender: None,
            receiver: None,
        };

        sqlx::query(
            r#"
            INSERT INTO messages (id, sender_id, sender_model, receiver_id, receiver_model, message, is_read, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&msg.id)
        .bind(&msg.sender_id)
        .bind(msg.sender_model.as_str())
        .bind(&msg.receiver_id)
        .bind(msg.receiver_model.as_str())
        .bind(&msg.message)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(id = %msg.id, room = %msg.room(), "Stored message");

        let mut resolved = self.resolve(vec![msg]).await?;
        resolved
            .pop()
            .ok_or_else(|| ChatError::NotFound("stored message".into()))
    }

    /// Every message between `a` and `b` in either direction, oldest first.
    /// Does not touch read state.
    pub async fn history(&self, a: &str, b: &str) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE (sender_id = ? AND receiver_id = ?) OR (sender_id = ? AND receiver_id = ?)
            ORDER BY created_at ASC, seq ASC
            "#
        ))
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .fetch_all(&self.pool)
        .await?;

        let messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;

        self.resolve(messages).await
    }

    /// Flag as read everything `counterpart_id` sent to `owner_id`. Returns
    /// how many messages changed state; a repeated call returns 0.
    pub async fn mark_read(&self, owner_id: &str, counterpart_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET is_read = 1, updated_at = ?
            WHERE sender_id = ? AND receiver_id = ? AND is_read = 0
            "#,
        )
        .bind(now_millis())
        .bind(counterpart_id)
        .bind(owner_id)
        .execute(&self.pool)
        .await?;

        let flipped = result.rows_affected();
        if flipped > 0 {
            debug!(owner = owner_id, counterpart = counterpart_id, flipped, "Marked messages read");
        }
        Ok(flipped)
    }

    /// Look up one stored message, resolved.
    pub async fn message(&self, id: &str) -> Result<Option<ChatMessage>> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let msg = message_from_row(&row)?;
                Ok(self.resolve(vec![msg]).await?.pop())
            }
            None => Ok(None),
        }
    }

    /// Raw (unresolved) log of every message `id` sent or received, in
    /// creation order.
    pub async fn messages_involving(&self, id: &str) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE sender_id = ? OR receiver_id = ?
            ORDER BY created_at ASC, seq ASC
            "#
        ))
        .bind(id)
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    /// Attach sender/receiver display fields. Participants missing from the
    /// directory stay `None`.
    async fn resolve(&self, mut messages: Vec<ChatMessage>) -> Result<Vec<ChatMessage>> {
        let mut cache: HashMap<String, Option<ProfileSummary>> = HashMap::new();

        for msg in &mut messages {
            for id in [msg.sender_id.clone(), msg.receiver_id.clone()] {
                if !cache.contains_key(&id) {
                    let summary = self.profile(&id).await?.map(|p| p.summary());
                    cache.insert(id, summary);
                }
            }
            msg.sender = cache.get(&msg.sender_id).cloned().flatten();
            msg.receiver = cache.get(&msg.receiver_id).cloned().flatten();
        }

        Ok(messages)
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| ChatError::Storage(sqlx::Error::Decode(format!("bad timestamp {ms}").into())))
}

fn parse_role(value: &str) -> Result<Role> {
    Role::from_str(value).map_err(|e| ChatError::Storage(sqlx::Error::Decode(e.into())))
}

fn message_from_row(row: &SqliteRow) -> Result<ChatMessage> {
    let sender_model: String = row.try_get("sender_model")?;
    let receiver_model: String = row.try_get("receiver_model")?;
    let created_at: i64 = row.try_get("created_at")?;
    let updated_at: Option<i64> = row.try_get("updated_at")?;

    Ok(ChatMessage {
        id: row.try_get("id")?,
        sender_id: row.try_get("sender_id")?,
        sender_model: parse_role(&sender_model)?,
        receiver_id: row.try_get("receiver_id")?,
        receiver_model: parse_role(&receiver_model)?,
        message: row.try_get("message")?,
        is_read: row.try_get("is_read")?,
        created_at: from_millis(created_at)?,
        updated_at: updated_at.map(from_millis).transpose()?,
        sender: None,
        receiver: None,
    })
}

fn profile_from_row(row: &SqliteRow) -> Result<Profile> {
    let role: String = row.try_get("role")?;

    Ok(Profile {
        id: row.try_get("id")?,
        role: parse_role(&role)?,
        name: row.try_get("name")?,
        image: row.try_get("image")?,
    })
}
