//! Intent handlers: the bridge from a decoded client frame to a persistence
//! call followed by a hub broadcast. These run inline on the reader task, so
//! they may block that one session on persistence I/O but must never touch
//! the hub's internal maps directly.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

use crate::codec::{ChatIdPayload, ClientFrame, MessageIdPayload, SendMessagePayload, ServerFrame};
use crate::config::Config;
use crate::hub::HubHandle;
use crate::models::{ChatId, MessageKind, UserId};
use crate::persistence::Persistence;
use crate::session::Session;

#[derive(Clone)]
pub struct IntentContext {
    pub hub: HubHandle,
    pub persistence: Arc<dyn Persistence>,
    pub config: Arc<Config>,
}

/// Per-(user, chat) typing-indicator generation counters, used to expire a
/// `typing_start` automatically if no further typing activity follows within
/// `Config::typing_timeout`. Mirrors the per-key atomic counter idiom used
/// for connection limiting elsewhere in this codebase.
static TYPING_GENERATIONS: Lazy<DashMap<(UserId, ChatId), Arc<AtomicU64>>> = Lazy::new(DashMap::new);

pub async fn dispatch(ctx: &IntentContext, session: &Session, frame: ClientFrame) {
    match frame {
        ClientFrame::SendMessage(payload) => send_message(ctx, session, payload).await,
        ClientFrame::ReadMessage(payload) => read_message(ctx, session, payload).await,
        ClientFrame::ReadChat(payload) => read_chat(ctx, session, payload).await,
        ClientFrame::TypingStart(payload) => typing(ctx, session, payload.chat_id, true).await,
        ClientFrame::TypingStop(payload) => typing(ctx, session, payload.chat_id, false).await,
        ClientFrame::SubscribeChat(payload) => subscribe_chat(ctx, session, payload).await,
        ClientFrame::UnsubscribeChat(payload) => unsubscribe_chat(ctx, session, payload).await,
        ClientFrame::Ping => {}
    }
}

fn send_error(session: &Session, code: &str, message: impl Into<String>) {
    let frame = ServerFrame::Error {
        code: code.to_string(),
        message: message.into(),
    };
    let _ = session.send(frame.encode());
}

async fn send_message(ctx: &IntentContext, session: &Session, payload: SendMessagePayload) {
    if payload.content.trim().is_empty() {
        send_error(session, "invalid_payload", "message content must not be empty");
        return;
    }

    match ctx.persistence.is_member(payload.chat_id, session.user_id()).await {
        Ok(true) => {}
        Ok(false) => {
            send_error(session, "not_member", "you are not a member of this chat");
            return;
        }
        Err(e) => {
            error!(error = %e, "membership check failed");
            send_error(session, "send_failed", "could not verify chat membership");
            return;
        }
    }

    let kind = payload.message_type.unwrap_or(MessageKind::Text);
    let message = match ctx
        .persistence
        .create_message(
            payload.chat_id,
            session.user_id(),
            payload.content,
            kind,
            payload.media_url,
            payload.reply_to_id,
        )
        .await
    {
        Ok(message) => message,
        Err(e) => {
            error!(error = %e, "failed to persist message");
            send_error(session, "send_failed", "failed to send message");
            return;
        }
    };

    crate::metrics::record_message_sent();
    let frame = ServerFrame::Message(message);
    let _ = session.send(frame.encode());
    ctx.hub
        .broadcast_to_chat(payload.chat_id, &frame, Some(session.user_id()))
        .await;
}

async fn read_message(ctx: &IntentContext, session: &Session, payload: MessageIdPayload) {
    let message = match ctx.persistence.get_message(payload.message_id).await {
        Ok(Some(message)) => message,
        Ok(None) => {
            send_error(session, "invalid_message_id", "message not found");
            return;
        }
        Err(e) => {
            error!(error = %e, "failed to fetch message for read receipt");
            send_error(session, "send_failed", "could not record read receipt");
            return;
        }
    };

    let mark = match ctx.persistence.mark_read(payload.message_id, session.user_id()).await {
        Ok(mark) => mark,
        Err(e) => {
            error!(error = %e, "failed to record read mark");
            send_error(session, "send_failed", "could not record read receipt");
            return;
        }
    };

    let frame = ServerFrame::MessageRead {
        message_id: mark.message_id,
        user_id: mark.user_id,
        read_at: mark.read_at,
    };
    ctx.hub.broadcast_to_chat(message.chat_id, &frame, None).await;
}

async fn read_chat(ctx: &IntentContext, session: &Session, payload: ChatIdPayload) {
    if let Err(e) = ctx.persistence.mark_chat_read(payload.chat_id, session.user_id()).await {
        error!(error = %e, "failed to mark chat read");
        send_error(session, "send_failed", "could not mark chat as read");
    }
}

async fn typing(ctx: &IntentContext, session: &Session, chat: ChatId, is_typing: bool) {
    session.set_typing(chat, is_typing);

    let frame = ServerFrame::Typing {
        chat_id: chat,
        user_id: session.user_id(),
        user_name: session.username().to_string(),
        is_typing,
    };
    ctx.hub.broadcast_to_chat(chat, &frame, Some(session.user_id())).await;

    if is_typing {
        schedule_typing_timeout(ctx.clone(), session.clone(), chat);
    }
}

/// Auto-expires a `typing_start` after `Config::typing_timeout` of silence.
/// Each new typing frame for the same (user, chat) bumps a generation counter;
/// when the timer fires it only emits `typing_stop` if it is still the most
/// recent timer for that key, so a rapid burst of keystrokes doesn't produce
/// a burst of spurious stop/start flicker.
fn schedule_typing_timeout(ctx: IntentContext, session: Session, chat: ChatId) {
    let key = (session.user_id(), chat);
    let generation = TYPING_GENERATIONS
        .entry(key)
        .or_insert_with(|| Arc::new(AtomicU64::new(0)))
        .clone();
    let this_generation = generation.fetch_add(1, Ordering::SeqCst) + 1;

    tokio::spawn(async move {
        tokio::time::sleep(ctx.config.typing_timeout).await;
        if generation.load(Ordering::SeqCst) != this_generation {
            return; // superseded by a newer typing frame
        }
        if !session.is_typing(chat) {
            return;
        }
        session.set_typing(chat, false);
        let frame = ServerFrame::Typing {
            chat_id: chat,
            user_id: session.user_id(),
            user_name: session.username().to_string(),
            is_typing: false,
        };
        ctx.hub.broadcast_to_chat(chat, &frame, Some(session.user_id())).await;
    });
}

async fn subscribe_chat(ctx: &IntentContext, session: &Session, payload: ChatIdPayload) {
    match ctx.persistence.is_member(payload.chat_id, session.user_id()).await {
        Ok(true) => {}
        Ok(false) => {
            send_error(session, "subscribe_failed", "you are not a member of this chat");
            return;
        }
        Err(e) => {
            error!(error = %e, "membership check failed during subscribe");
            send_error(session, "subscribe_failed", "could not verify chat membership");
            return;
        }
    }

    match ctx
        .persistence
        .recent_messages(payload.chat_id, ctx.config.replay_window, 0)
        .await
    {
        Ok(messages) => {
            for message in messages {
                let frame = ServerFrame::Message(message);
                if session.send(frame.encode()).is_err() {
                    warn!(user_id = %session.user_id(), "session closed mid-replay");
                    return;
                }
            }
        }
        Err(e) => {
            error!(error = %e, "failed to fetch replay window");
        }
    }

    ctx.hub.subscribe(session.clone(), payload.chat_id).await;
}

async fn unsubscribe_chat(ctx: &IntentContext, session: &Session, payload: ChatIdPayload) {
    ctx.hub.unsubscribe(session.clone(), payload.chat_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use crate::persistence::memory::InMemoryStore;
    use std::time::Duration;
    use uuid::Uuid;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            server_port: 0,
            database_url: String::new(),
            jwt_secret: String::new(),
            enable_metrics: false,
            session_queue_capacity: 8,
            hub_channel_capacity: 16,
            pong_wait: Duration::from_secs(60),
            ping_period: Duration::from_secs(54),
            write_wait: Duration::from_secs(10),
            max_frame_bytes: 1024,
            replay_window: 50,
            typing_timeout: Duration::from_millis(30),
        })
    }

    async fn test_ctx() -> (IntentContext, Arc<InMemoryStore>) {
        let persistence = Arc::new(InMemoryStore::new());
        let (hub, handle) = Hub::new(persistence.clone(), 16);
        tokio::spawn(hub.run());
        (
            IntentContext {
                hub: handle,
                persistence: persistence.clone(),
                config: test_config(),
            },
            persistence,
        )
    }

    #[tokio::test]
    async fn send_message_echoes_to_originator() {
        let (ctx, persistence) = test_ctx().await;
        let chat = Uuid::new_v4();
        let (alice, mut alice_rx) = Session::new(Uuid::new_v4(), "alice".into(), 8);
        persistence.seed_member(chat, alice.user_id(), "alice");
        ctx.hub.register(alice.clone()).await;

        send_message(
            &ctx,
            &alice,
            SendMessagePayload {
                chat_id: chat,
                content: "hi".into(),
                message_type: None,
                media_url: None,
                reply_to_id: None,
            },
        )
        .await;

        let bytes = alice_rx.try_recv().expect("expected an echo");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"content\":\"hi\""));
    }

    #[tokio::test]
    async fn send_message_rejects_non_members() {
        let (ctx, _persistence) = test_ctx().await;
        let chat = Uuid::new_v4();
        let (alice, mut alice_rx) = Session::new(Uuid::new_v4(), "alice".into(), 8);
        ctx.hub.register(alice.clone()).await;

        send_message(
            &ctx,
            &alice,
            SendMessagePayload {
                chat_id: chat,
                content: "hi".into(),
                message_type: None,
                media_url: None,
                reply_to_id: None,
            },
        )
        .await;

        let bytes = alice_rx.try_recv().expect("expected an error frame");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("not_member"));
    }

    #[tokio::test]
    async fn typing_auto_expires_after_timeout() {
        let (ctx, persistence) = test_ctx().await;
        let chat = Uuid::new_v4();
        let (alice, _alice_rx) = Session::new(Uuid::new_v4(), "alice".into(), 8);
        let (bob, mut bob_rx) = Session::new(Uuid::new_v4(), "bob".into(), 8);
        persistence.seed_member(chat, alice.user_id(), "alice");
        persistence.seed_member(chat, bob.user_id(), "bob");
        ctx.hub.register(alice.clone()).await;
        ctx.hub.register(bob.clone()).await;
        ctx.hub.subscribe(bob.clone(), chat).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        typing(&ctx, &alice, chat, true).await;
        let _start = bob_rx.try_recv().expect("expected typing_start fan-out");

        tokio::time::sleep(Duration::from_millis(80)).await;
        let stop = bob_rx.try_recv().expect("expected auto typing_stop");
        let text = String::from_utf8(stop).unwrap();
        assert!(text.contains("\"is_typing\":false"));
    }
}
