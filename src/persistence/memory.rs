//! In-memory `Persistence` fake used by tests and local/dev runs.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use super::{Persistence, PersistenceError};
use crate::models::{ChatId, Member, MemberRole, Message, MessageId, MessageKind, ReadMark, UserId, UserRecord};

#[derive(Default)]
struct State {
    members: HashMap<ChatId, Vec<Member>>,
    users: HashMap<UserId, UserRecord>,
    messages: HashMap<ChatId, Vec<Message>>,
    read_marks: Vec<ReadMark>,
}

/// Thread-safe in-memory store. Messages within a chat are kept in insertion
/// order, which is also their `created_at` order since the clock only moves
/// forward.
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    /// Test/seed helper: add `user` as a member of `chat`.
    pub fn seed_member(&self, chat: ChatId, user: UserId, username: &str) {
        let mut state = self.state.write();
        state.members.entry(chat).or_default().push(Member {
            chat_id: chat,
            user_id: user,
            role: format!("{:?}", MemberRole::Member).to_lowercase(),
            joined_at: Utc::now(),
            left_at: None,
        });
        state.users.entry(user).or_insert_with(|| UserRecord {
            user_id: user,
            username: username.to_string(),
            avatar_url: None,
            is_online: false,
            last_seen: None,
        });
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Persistence for InMemoryStore {
    async fn is_member(&self, chat: ChatId, user: UserId) -> Result<bool, PersistenceError> {
        let state = self.state.read();
        Ok(state
            .members
            .get(&chat)
            .map(|members| members.iter().any(|m| m.user_id == user && m.left_at.is_none()))
            .unwrap_or(false))
    }

    async fn members_of(&self, chat: ChatId) -> Result<Vec<Member>, PersistenceError> {
        let state = self.state.read();
        Ok(state.members.get(&chat).cloned().unwrap_or_default())
    }

    async fn get_user(&self, user: UserId) -> Result<Option<UserRecord>, PersistenceError> {
        Ok(self.state.read().users.get(&user).cloned())
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
        let mut state = self.state.write();
        let sender_name = state
            .users
            .get(&sender)
            .map(|u| u.username.clone())
            .unwrap_or_default();
        let message = Message {
            id: Uuid::new_v4(),
            chat_id: chat,
            sender_id: sender,
            sender_name,
            sender_avatar: state.users.get(&sender).and_then(|u| u.avatar_url.clone()),
            content,
            message_type: format!("{:?}", kind).to_lowercase(),
            media_url,
            reply_to_id: reply_to,
            is_edited: false,
            is_deleted: false,
            status: "sent".to_string(),
            created_at: Utc::now(),
        };
        state.messages.entry(chat).or_default().push(message.clone());
        Ok(message)
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, PersistenceError> {
        let state = self.state.read();
        Ok(state
            .messages
            .values()
            .flatten()
            .find(|m| m.id == id)
            .cloned())
    }

    async fn recent_messages(
        &self,
        chat: ChatId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>, PersistenceError> {
        let state = self.state.read();
        let all = state.messages.get(&chat).cloned().unwrap_or_default();
        // Window the tail of the chat (most recent `limit` messages, skipping
        // the most recent `offset` of them), then return it oldest-first.
        let offset = offset.max(0) as usize;
        let limit = limit.max(0) as usize;
        let end = all.len().saturating_sub(offset);
        let start = end.saturating_sub(limit);
        Ok(all[start..end].to_vec())
    }

    async fn mark_read(&self, message: MessageId, user: UserId) -> Result<ReadMark, PersistenceError> {
        let mark = ReadMark {
            message_id: message,
            user_id: user,
            read_at: Utc::now(),
        };
        self.state.write().read_marks.push(mark.clone());
        Ok(mark)
    }

    async fn mark_chat_read(&self, _chat: ChatId, _user: UserId) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn set_online(&self, user: UserId, online: bool) -> Result<(), PersistenceError> {
        let mut state = self.state.write();
        if let Some(record) = state.users.get_mut(&user) {
            record.is_online = online;
            if !online {
                record.last_seen = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), PersistenceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn membership_round_trips() {
        let store = InMemoryStore::new();
        let chat = Uuid::new_v4();
        let user = Uuid::new_v4();
        assert!(!store.is_member(chat, user).await.unwrap());
        store.seed_member(chat, user, "alice");
        assert!(store.is_member(chat, user).await.unwrap());
    }

    #[tokio::test]
    async fn messages_are_returned_in_insertion_order() {
        let store = InMemoryStore::new();
        let chat = Uuid::new_v4();
        let sender = Uuid::new_v4();
        store.seed_member(chat, sender, "alice");
        store
            .create_message(chat, sender, "first".into(), MessageKind::Text, None, None)
            .await
            .unwrap();
        store
            .create_message(chat, sender, "second".into(), MessageKind::Text, None, None)
            .await
            .unwrap();

        let messages = store.recent_messages(chat, 50, 0).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "first");
        assert_eq!(messages[1].content, "second");
    }

    #[tokio::test]
    async fn recent_messages_windows_the_tail_not_the_head() {
        let store = InMemoryStore::new();
        let chat = Uuid::new_v4();
        let sender = Uuid::new_v4();
        store.seed_member(chat, sender, "alice");
        for i in 0..60 {
            store
                .create_message(chat, sender, format!("m{i}"), MessageKind::Text, None, None)
                .await
                .unwrap();
        }

        let messages = store.recent_messages(chat, 50, 0).await.unwrap();
        assert_eq!(messages.len(), 50);
        assert_eq!(messages.first().unwrap().content, "m10");
        assert_eq!(messages.last().unwrap().content, "m59");
    }
}
