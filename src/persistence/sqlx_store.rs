//! Postgres-backed `Persistence` implementation.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use super::{Persistence, PersistenceError};
use crate::models::{ChatId, Member, Message, MessageId, MessageKind, ReadMark, UserId, UserRecord};

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl DbConfig {
    pub fn from_url(database_url: String) -> Self {
        Self {
            database_url,
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(config: DbConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&config.database_url)
            .await
            .context("failed to connect to database")?;
        Ok(Self { pool })
    }

    fn storage_err(err: sqlx::Error) -> PersistenceError {
        PersistenceError::Storage(anyhow::Error::new(err))
    }
}

#[async_trait]
impl Persistence for PostgresStore {
    async fn is_member(&self, chat: ChatId, user: UserId) -> Result<bool, PersistenceError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM members WHERE chat_id = $1 AND user_id = $2 AND left_at IS NULL)",
        )
        .bind(chat)
        .bind(user)
        .fetch_one(&self.pool)
        .await
        .map_err(Self::storage_err)
    }

    async fn members_of(&self, chat: ChatId) -> Result<Vec<Member>, PersistenceError> {
        sqlx::query_as::<_, Member>(
            "SELECT chat_id, user_id, role, joined_at, left_at FROM members WHERE chat_id = $1",
        )
        .bind(chat)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::storage_err)
    }

    async fn get_user(&self, user: UserId) -> Result<Option<UserRecord>, PersistenceError> {
        sqlx::query_as::<_, UserRecord>(
            "SELECT user_id, username, avatar_url, is_online, last_seen FROM users WHERE user_id = $1",
        )
        .bind(user)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::storage_err)
    }

    async fn create_message(
        &self,
        chat: ChatId,
        sender: UserId,
        content: String,
        kind: MessageKind,
        media_url: Option<String>,
        reply_to: Option<MessageId>,
    ) -> Result<Message, PersistenceError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let message_type = format!("{:?}", kind).to_lowercase();

        sqlx::query_as::<_, Message>(
            r#"
            WITH inserted AS (
                INSERT INTO messages (id, chat_id, sender_id, content, message_type, media_url, reply_to_id, is_edited, is_deleted, status, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, false, false, 'sent', $8)
                RETURNING *
            )
            SELECT inserted.id, inserted.chat_id, inserted.sender_id,
                   users.username AS sender_name, users.avatar_url AS sender_avatar,
                   inserted.content, inserted.message_type, inserted.media_url,
                   inserted.reply_to_id, inserted.is_edited, inserted.is_deleted,
                   inserted.status, inserted.created_at
            FROM inserted JOIN users ON users.user_id = inserted.sender_id
            "#,
        )
        .bind(id)
        .bind(chat)
        .bind(sender)
        .bind(content)
        .bind(message_type)
        .bind(media_url)
        .bind(reply_to)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(Self::storage_err)
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, PersistenceError> {
        sqlx::query_as::<_, Message>(
            r#"
            SELECT m.id, m.chat_id, m.sender_id, u.username AS sender_name, u.avatar_url AS sender_avatar,
                   m.content, m.message_type, m.media_url, m.reply_to_id, m.is_edited, m.is_deleted,
                   m.status, m.created_at
            FROM messages m JOIN users u ON u.user_id = m.sender_id
            WHERE m.id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::storage_err)
    }

    async fn recent_messages(
        &self,
        chat: ChatId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>, PersistenceError> {
        sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM (
                SELECT m.id, m.chat_id, m.sender_id, u.username AS sender_name, u.avatar_url AS sender_avatar,
                       m.content, m.message_type, m.media_url, m.reply_to_id, m.is_edited, m.is_deleted,
                       m.status, m.created_at
                FROM messages m JOIN users u ON u.user_id = m.sender_id
                WHERE m.chat_id = $1 AND m.is_deleted = false
                ORDER BY m.created_at DESC
                LIMIT $2 OFFSET $3
            ) recent
            ORDER BY recent.created_at ASC
            "#,
        )
        .bind(chat)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::storage_err)
    }

    async fn mark_read(&self, message: MessageId, user: UserId) -> Result<ReadMark, PersistenceError> {
        sqlx::query_as::<_, ReadMark>(
            r#"
            INSERT INTO read_marks (message_id, user_id, read_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (message_id, user_id) DO UPDATE SET read_at = NOW()
            RETURNING message_id, user_id, read_at
            "#,
        )
        .bind(message)
        .bind(user)
        .fetch_one(&self.pool)
        .await
        .map_err(Self::storage_err)
    }

    async fn mark_chat_read(&self, chat: ChatId, user: UserId) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE members SET last_read_at = NOW() WHERE chat_id = $1 AND user_id = $2")
            .bind(chat)
            .bind(user)
            .execute(&self.pool)
            .await
            .map_err(Self::storage_err)?;
        Ok(())
    }

    async fn set_online(&self, user: UserId, online: bool) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE users SET is_online = $1, last_seen = NOW() WHERE user_id = $2")
            .bind(online)
            .bind(user)
            .execute(&self.pool)
            .await
            .map_err(Self::storage_err)?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), PersistenceError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(Self::storage_err)?;
        Ok(())
    }
}
