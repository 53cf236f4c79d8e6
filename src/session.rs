//! Per-connection state and the reader/writer task pair.
//!
//! A `Session` is a cheap, cloneable handle (an `Arc` around the real state)
//! shared between the hub loop, the reader task, and the writer task. The
//! hub loop is the only place that mutates `sessions_by_user` /
//! `subscribers_by_chat`; a `Session`'s own subscription/typing sets are
//! guarded by a plain mutex since they are touched from both the hub loop and
//! reader-dispatched intent handlers.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{decode_client_frame, CodecError};
use crate::config::Config;
use crate::hub::HubHandle;
use crate::intents::{self, IntentContext};
use crate::models::{ChatId, UserId};
use crate::persistence::Persistence;

#[derive(Debug)]
pub struct SendError;

struct SessionInner {
    session_id: Uuid,
    user_id: UserId,
    username: String,
    out_tx: mpsc::Sender<Vec<u8>>,
    close_notify: Notify,
    closed: AtomicBool,
    subscribed: Mutex<HashSet<ChatId>>,
    typing: Mutex<HashSet<ChatId>>,
}

/// Cheap, cloneable handle to a connected client's server-side state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(
        user_id: UserId,
        username: String,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (out_tx, out_rx) = mpsc::channel(queue_capacity);
        let session = Self {
            inner: Arc::new(SessionInner {
                session_id: Uuid::new_v4(),
                user_id,
                username,
                out_tx,
                close_notify: Notify::new(),
                closed: AtomicBool::new(false),
                subscribed: Mutex::new(HashSet::new()),
                typing: Mutex::new(HashSet::new()),
            }),
        };
        (session, out_rx)
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    pub fn user_id(&self) -> UserId {
        self.inner.user_id
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }

    /// Non-blocking enqueue onto the outbound queue. A full queue is fatal
    /// for this session: it is closed so its writer terminates, and the
    /// caller (hub fan-out or an intent handler) is expected to deregister
    /// it.
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), SendError> {
        match self.inner.out_tx.try_send(bytes) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(user_id = %self.inner.user_id, session_id = %self.inner.session_id, "outbound queue full, evicting session");
                self.close();
                Err(SendError)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError),
        }
    }

    /// Idempotent. Wakes the writer task so it can terminate.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.close_notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self, chat: ChatId) {
        self.inner.subscribed.lock().insert(chat);
    }

    pub fn unsubscribe(&self, chat: ChatId) {
        self.inner.subscribed.lock().remove(&chat);
    }

    pub fn subscribed_chats(&self) -> Vec<ChatId> {
        self.inner.subscribed.lock().iter().copied().collect()
    }

    pub fn set_typing(&self, chat: ChatId, typing: bool) {
        let mut set = self.inner.typing.lock();
        if typing {
            set.insert(chat);
        } else {
            set.remove(&chat);
        }
    }

    pub fn is_typing(&self, chat: ChatId) -> bool {
        self.inner.typing.lock().contains(&chat)
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.inner.session_id == other.inner.session_id
    }
}
impl Eq for Session {}

/// Writer loop: flushes the outbound queue to the wire, coalescing any
/// additional already-queued frames into the same transport message, and
/// emits a protocol ping on a fixed interval. Any write error or a
/// `Session::close()` call terminates the loop, which drops the sink and
/// closes the transport.
pub async fn run_writer(
    session: Session,
    mut sink: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Vec<u8>>,
    config: Arc<Config>,
) {
    let mut ping_ticker = interval(config.ping_period);
    ping_ticker.tick().await; // first tick fires immediately; consume it

    loop {
        tokio::select! {
            biased;
            _ = session.inner.close_notify.notified() => {
                debug!(session_id = %session.session_id(), "writer closing on session close");
                break;
            }
            maybe_bytes = out_rx.recv() => {
                match maybe_bytes {
                    Some(mut bytes) => {
                        while let Ok(more) = out_rx.try_recv() {
                            bytes.push(b'\n');
                            bytes.extend_from_slice(&more);
                        }
                        let write = timeout(config.write_wait, sink.send(Message::Binary(bytes)));
                        if write.await.is_err() {
                            warn!(session_id = %session.session_id(), "write failed or timed out");
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ping_ticker.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    session.close();
    let _ = sink.close().await;
}

/// Reader loop: decodes inbound frames and dispatches them to intent
/// handlers. A framing error is reported to the originator and does not
/// terminate the session; a transport-level error or close does.
pub async fn run_reader(
    session: Session,
    mut stream: SplitStream<WebSocket>,
    hub: HubHandle,
    persistence: Arc<dyn Persistence>,
    config: Arc<Config>,
) {
    let ctx = IntentContext {
        hub: hub.clone(),
        persistence,
        config: config.clone(),
    };

    loop {
        let next = timeout(config.pong_wait, stream.next()).await;
        let message = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!(session_id = %session.session_id(), error = %e, "transport error, closing");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                debug!(session_id = %session.session_id(), "pong timeout, closing");
                break;
            }
        };

        let bytes = match message {
            Message::Binary(b) => b,
            Message::Text(t) => t.into_bytes(),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => break,
        };

        if bytes.len() > config.max_frame_bytes {
            warn!(session_id = %session.session_id(), size = bytes.len(), "oversized frame, closing");
            break;
        }

        for frame_bytes in bytes.split(|b| *b == b'\n') {
            if frame_bytes.is_empty() {
                continue;
            }
            match decode_client_frame(frame_bytes) {
                Ok(frame) => intents::dispatch(&ctx, &session, frame).await,
                Err(e) => send_decode_error(&session, &e),
            }
        }
    }

    hub.deregister(session.clone());
}

fn send_decode_error(session: &Session, err: &CodecError) {
    let envelope = crate::codec::ServerFrame::Error {
        code: "invalid_payload".to_string(),
        message: err.to_string(),
    };
    let _ = session.send(envelope.encode());
}
