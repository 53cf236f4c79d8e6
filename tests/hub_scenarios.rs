//! End-to-end hub scenarios, driven directly against `Hub`/`Session`/`intents`
//! with `InMemoryStore` standing in for the database. These exercise the same
//! reader-task entry points (`intents::dispatch`) that a real socket would,
//! without going through an actual WebSocket upgrade.

use std::sync::Arc;
use std::time::Duration;

use chat_hub::codec::{ChatIdPayload, ClientFrame, SendMessagePayload, ServerFrame};
use chat_hub::config::Config;
use chat_hub::hub::Hub;
use chat_hub::intents::{self, IntentContext};
use chat_hub::persistence::memory::InMemoryStore;
use chat_hub::session::Session;
use uuid::Uuid;

fn test_config() -> Arc<Config> {
    Arc::new(Config {
        server_port: 0,
        database_url: String::new(),
        jwt_secret: String::new(),
        enable_metrics: false,
        session_queue_capacity: 8,
        hub_channel_capacity: 32,
        pong_wait: Duration::from_secs(60),
        ping_period: Duration::from_secs(54),
        write_wait: Duration::from_secs(10),
        max_frame_bytes: 1024 * 1024,
        replay_window: 50,
        typing_timeout: Duration::from_millis(50),
    })
}

async fn test_ctx() -> (IntentContext, Arc<InMemoryStore>) {
    let persistence = Arc::new(InMemoryStore::new());
    let (hub, handle) = Hub::new(persistence.clone(), 32);
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

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn echo_delivers_to_sender_and_other_subscribers() {
    let (ctx, persistence) = test_ctx().await;
    let chat = Uuid::new_v4();
    let (alice, mut alice_rx) = Session::new(Uuid::new_v4(), "alice".into(), 8);
    let (bob, mut bob_rx) = Session::new(Uuid::new_v4(), "bob".into(), 8);
    persistence.seed_member(chat, alice.user_id(), "alice");
    persistence.seed_member(chat, bob.user_id(), "bob");

    ctx.hub.register(alice.clone()).await;
    ctx.hub.register(bob.clone()).await;
    intents::dispatch(&ctx, &alice, ClientFrame::SubscribeChat(ChatIdPayload { chat_id: chat })).await;
    intents::dispatch(&ctx, &bob, ClientFrame::SubscribeChat(ChatIdPayload { chat_id: chat })).await;
    settle().await;
    // replay frames for an empty chat produce nothing; drain them anyway.
    while alice_rx.try_recv().is_ok() {}
    while bob_rx.try_recv().is_ok() {}

    intents::dispatch(
        &ctx,
        &alice,
        ClientFrame::SendMessage(SendMessagePayload {
            chat_id: chat,
            content: "hi".into(),
            message_type: None,
            media_url: None,
            reply_to_id: None,
        }),
    )
    .await;
    settle().await;

    let alice_frame = String::from_utf8(alice_rx.try_recv().expect("alice should see her own message")).unwrap();
    let bob_frame = String::from_utf8(bob_rx.try_recv().expect("bob should see alice's message")).unwrap();
    assert!(alice_frame.contains("\"content\":\"hi\""));
    assert!(bob_frame.contains("\"content\":\"hi\""));
    assert!(alice_frame.contains(&alice.user_id().to_string()));

    let stored = persistence.recent_messages(chat, 50, 0).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].content, "hi");
}

#[tokio::test]
async fn presence_events_exclude_the_originating_session() {
    let (ctx, _persistence) = test_ctx().await;
    let (alice, mut alice_rx) = Session::new(Uuid::new_v4(), "alice".into(), 8);
    let (bob, mut bob_rx) = Session::new(Uuid::new_v4(), "bob".into(), 8);

    ctx.hub.register(bob.clone()).await;
    settle().await;
    while bob_rx.try_recv().is_ok() {}

    ctx.hub.register(alice.clone()).await;
    settle().await;
    let online = String::from_utf8(bob_rx.try_recv().expect("bob should see alice come online")).unwrap();
    assert!(online.contains("user_online"));
    assert!(alice_rx.try_recv().is_err(), "alice must not observe her own presence event");

    ctx.hub.deregister(alice.clone());
    settle().await;
    let offline = String::from_utf8(bob_rx.try_recv().expect("bob should see alice go offline")).unwrap();
    assert!(offline.contains("user_offline"));
}

#[tokio::test]
async fn typing_fans_out_to_other_chat_subscribers_only() {
    let (ctx, persistence) = test_ctx().await;
    let chat = Uuid::new_v4();
    let (alice, _alice_rx) = Session::new(Uuid::new_v4(), "alice".into(), 8);
    let (bob, mut bob_rx) = Session::new(Uuid::new_v4(), "bob".into(), 8);
    let (carol, mut carol_rx) = Session::new(Uuid::new_v4(), "carol".into(), 8);
    for (user, name) in [(alice.user_id(), "alice"), (bob.user_id(), "bob"), (carol.user_id(), "carol")] {
        persistence.seed_member(chat, user, name);
    }

    ctx.hub.register(alice.clone()).await;
    ctx.hub.register(bob.clone()).await;
    ctx.hub.register(carol.clone()).await;
    intents::dispatch(&ctx, &bob, ClientFrame::SubscribeChat(ChatIdPayload { chat_id: chat })).await;
    intents::dispatch(&ctx, &carol, ClientFrame::SubscribeChat(ChatIdPayload { chat_id: chat })).await;
    settle().await;
    while bob_rx.try_recv().is_ok() {}
    while carol_rx.try_recv().is_ok() {}

    intents::dispatch(&ctx, &alice, ClientFrame::TypingStart(ChatIdPayload { chat_id: chat })).await;
    settle().await;

    let bob_frame = String::from_utf8(bob_rx.try_recv().expect("bob should see alice typing")).unwrap();
    let carol_frame = String::from_utf8(carol_rx.try_recv().expect("carol should see alice typing")).unwrap();
    assert!(bob_frame.contains("\"is_typing\":true"));
    assert!(carol_frame.contains("\"is_typing\":true"));
}

#[tokio::test]
async fn duplicate_login_closes_the_prior_session_and_keeps_the_new_one() {
    let (ctx, persistence) = test_ctx().await;
    let chat = Uuid::new_v4();
    let user = Uuid::new_v4();
    persistence.seed_member(chat, user, "alice");
    let (device1, _rx1) = Session::new(user, "alice".into(), 8);
    let (device2, _rx2) = Session::new(user, "alice".into(), 8);

    ctx.hub.register(device1.clone()).await;
    intents::dispatch(&ctx, &device1, ClientFrame::SubscribeChat(ChatIdPayload { chat_id: chat })).await;
    settle().await;

    ctx.hub.register(device2.clone()).await;
    settle().await;

    assert!(device1.is_closed(), "the first device's session should be evicted");
    assert!(!device2.is_closed());
    assert_eq!(ctx.hub.connected_sessions(), 1);
}

#[tokio::test]
async fn slow_subscriber_is_evicted_without_blocking_other_subscribers() {
    let (ctx, persistence) = test_ctx().await;
    let chat = Uuid::new_v4();
    let (slow, _slow_rx) = Session::new(Uuid::new_v4(), "slow".into(), 4);
    let (fast, mut fast_rx) = Session::new(Uuid::new_v4(), "fast".into(), 64);
    persistence.seed_member(chat, slow.user_id(), "slow");
    persistence.seed_member(chat, fast.user_id(), "fast");

    ctx.hub.register(slow.clone()).await;
    ctx.hub.register(fast.clone()).await;
    intents::dispatch(&ctx, &slow, ClientFrame::SubscribeChat(ChatIdPayload { chat_id: chat })).await;
    intents::dispatch(&ctx, &fast, ClientFrame::SubscribeChat(ChatIdPayload { chat_id: chat })).await;
    settle().await;

    // `slow`'s receiver is never drained, so its bounded queue fills up and
    // a subsequent broadcast evicts it; `fast` keeps receiving regardless.
    for i in 0..10 {
        let frame = ServerFrame::Typing {
            chat_id: chat,
            user_id: slow.user_id(),
            user_name: "slow".into(),
            is_typing: i % 2 == 0,
        };
        ctx.hub.broadcast_to_chat(chat, &frame, None).await;
    }
    settle().await;

    assert!(slow.is_closed(), "the slow session should have been evicted on overflow");
    let mut received = 0;
    while fast_rx.try_recv().is_ok() {
        received += 1;
    }
    assert!(received >= 1, "the fast session should still be receiving broadcasts");
}

#[tokio::test]
async fn subscribing_replays_recent_messages_in_order() {
    let (ctx, persistence) = test_ctx().await;
    let chat = Uuid::new_v4();
    let sender = Uuid::new_v4();
    persistence.seed_member(chat, sender, "alice");
    for content in ["first", "second", "third"] {
        persistence
            .create_message(chat, sender, content.into(), chat_hub::models::MessageKind::Text, None, None)
            .await
            .unwrap();
    }

    let (joiner, mut joiner_rx) = Session::new(Uuid::new_v4(), "bob".into(), 16);
    persistence.seed_member(chat, joiner.user_id(), "bob");
    ctx.hub.register(joiner.clone()).await;

    intents::dispatch(&ctx, &joiner, ClientFrame::SubscribeChat(ChatIdPayload { chat_id: chat })).await;
    settle().await;

    let mut seen = Vec::new();
    while let Ok(bytes) = joiner_rx.try_recv() {
        seen.push(String::from_utf8(bytes).unwrap());
    }
    assert_eq!(seen.len(), 3);
    assert!(seen[0].contains("\"content\":\"first\""));
    assert!(seen[1].contains("\"content\":\"second\""));
    assert!(seen[2].contains("\"content\":\"third\""));
}

#[tokio::test]
async fn subscribing_to_a_long_chat_replays_the_recent_window_not_the_oldest_messages() {
    let (ctx, persistence) = test_ctx().await;
    let chat = Uuid::new_v4();
    let sender = Uuid::new_v4();
    persistence.seed_member(chat, sender, "alice");
    for i in 0..(ctx.config.replay_window + 10) {
        persistence
            .create_message(chat, sender, format!("m{i}"), chat_hub::models::MessageKind::Text, None, None)
            .await
            .unwrap();
    }

    let (joiner, mut joiner_rx) = Session::new(Uuid::new_v4(), "bob".into(), 128);
    persistence.seed_member(chat, joiner.user_id(), "bob");
    ctx.hub.register(joiner.clone()).await;

    intents::dispatch(&ctx, &joiner, ClientFrame::SubscribeChat(ChatIdPayload { chat_id: chat })).await;
    settle().await;

    let mut seen = Vec::new();
    while let Ok(bytes) = joiner_rx.try_recv() {
        seen.push(String::from_utf8(bytes).unwrap());
    }
    assert_eq!(seen.len() as i64, ctx.config.replay_window);
    assert!(seen[0].contains("\"content\":\"m10\""), "replay should start at the oldest message still in the window");
    assert!(
        seen.last().unwrap().contains("\"content\":\"m59\""),
        "replay should end at the most recently sent message"
    );
}
