//! The persistence collaborator: everything the hub needs to know about
//! chats, membership, users, messages, and read state, without knowing how
//! any of it is stored.

pub mod memory;
pub mod sqlx_store;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{ChatId, Member, Message, MessageKind, MessageId, ReadMark, UserId, UserRecord};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("not found")]
    NotFound,
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn is_member(&self, chat: ChatId, user: UserId) -> Result<bool, PersistenceError>;
    async fn members_of(&self, chat: ChatId) -> Result<Vec<Member>, PersistenceError>;
    async fn get_user(&self, user: UserId) -> Result<Option<UserRecord>, PersistenceError>;

    async fn create_message(
        &self,
        chat: ChatId,
        sender: UserId,
        content: String,
        kind: MessageKind,
        media_url: Option<String>,
        reply_to: Option<MessageId>,
    ) -> Result<Message, PersistenceError>;

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, PersistenceError>;

    async fn recent_messages(
        &self,
        chat: ChatId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>, PersistenceError>;

    async fn mark_read(&self, message: MessageId, user: UserId) -> Result<ReadMark, PersistenceError>;
    async fn mark_chat_read(&self, chat: ChatId, user: UserId) -> Result<(), PersistenceError>;
    async fn set_online(&self, user: UserId, online: bool) -> Result<(), PersistenceError>;

    /// Liveness probe used by the `/health/ready` route.
    async fn ping(&self) -> Result<(), PersistenceError>;
}
