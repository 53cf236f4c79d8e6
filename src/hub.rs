//! The hub: the single task that owns connection and subscription state.
//!
//! `sessions_by_user` and `subscribers_by_chat` are mutated only inside
//! `Hub::run`'s loop. Every other task (reader tasks, intent handlers, the
//! upgrade handler) talks to the hub exclusively through `HubHandle`, whose
//! methods just enqueue a command and return — the actual bookkeeping always
//! happens on the hub loop, which is what keeps the state invariants
//! (at most one session per user; a chat's subscriber set is non-empty or
//! absent; a session's subscription set agrees with the subscriber maps)
//! true without locking the maps themselves.
//!
//! Authorization and history replay for `subscribe_chat` are performed by
//! the calling intent handler against the persistence layer *before* it
//! asks the hub to record the subscription — the hub loop itself never
//! blocks on persistence I/O, so one session's slow database round trip
//! can't stall fan-out to every other session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::codec::ServerFrame;
use crate::models::{ChatId, UserId};
use crate::persistence::Persistence;
use crate::session::Session;

enum ControlCommand {
    Subscribe { session: Session, chat: ChatId },
    Unsubscribe { session: Session, chat: ChatId },
}

/// Cheap, cloneable set of channel senders used to talk to the hub loop.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Session>,
    deregister_tx: mpsc::Sender<Session>,
    broadcast_tx: mpsc::Sender<(Vec<u8>, Option<UserId>)>,
    broadcast_to_chat_tx: mpsc::Sender<(ChatId, Vec<u8>, Option<UserId>)>,
    control_tx: mpsc::Sender<ControlCommand>,
    /// Live connection count, exposed for `/health` and metrics without a
    /// round trip through the hub loop.
    connection_count: Arc<AtomicUsize>,
}

impl HubHandle {
    pub async fn register(&self, session: Session) {
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        let _ = self.register_tx.send(session).await;
    }

    pub fn deregister(&self, session: Session) {
        self.connection_count.fetch_sub(1, Ordering::Relaxed);
        let tx = self.deregister_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(session).await;
        });
    }

    pub async fn subscribe(&self, session: Session, chat: ChatId) {
        let _ = self
            .control_tx
            .send(ControlCommand::Subscribe { session, chat })
            .await;
    }

    pub async fn unsubscribe(&self, session: Session, chat: ChatId) {
        let _ = self
            .control_tx
            .send(ControlCommand::Unsubscribe { session, chat })
            .await;
    }

    pub async fn broadcast(&self, frame: &ServerFrame, exclude: Option<UserId>) {
        let _ = self.broadcast_tx.send((frame.encode(), exclude)).await;
    }

    pub async fn broadcast_to_chat(&self, chat: ChatId, frame: &ServerFrame, exclude: Option<UserId>) {
        let _ = self
            .broadcast_to_chat_tx
            .send((chat, frame.encode(), exclude))
            .await;
    }

    pub fn connected_sessions(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }
}

pub struct Hub {
    sessions_by_user: HashMap<UserId, Session>,
    subscribers_by_chat: HashMap<ChatId, HashMap<UserId, Session>>,
    persistence: Arc<dyn Persistence>,

    register_rx: mpsc::Receiver<Session>,
    deregister_rx: mpsc::Receiver<Session>,
    broadcast_rx: mpsc::Receiver<(Vec<u8>, Option<UserId>)>,
    broadcast_to_chat_rx: mpsc::Receiver<(ChatId, Vec<u8>, Option<UserId>)>,
    control_rx: mpsc::Receiver<ControlCommand>,
}

impl Hub {
    pub fn new(persistence: Arc<dyn Persistence>, channel_capacity: usize) -> (Self, HubHandle) {
        let (register_tx, register_rx) = mpsc::channel(channel_capacity);
        let (deregister_tx, deregister_rx) = mpsc::channel(channel_capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(channel_capacity);
        let (broadcast_to_chat_tx, broadcast_to_chat_rx) = mpsc::channel(channel_capacity);
        let (control_tx, control_rx) = mpsc::channel(channel_capacity);

        let hub = Hub {
            sessions_by_user: HashMap::new(),
            subscribers_by_chat: HashMap::new(),
            persistence,
            register_rx,
            deregister_rx,
            broadcast_rx,
            broadcast_to_chat_rx,
            control_rx,
        };
        let handle = HubHandle {
            register_tx,
            deregister_tx,
            broadcast_tx,
            broadcast_to_chat_tx,
            control_tx,
            connection_count: Arc::new(AtomicUsize::new(0)),
        };
        (hub, handle)
    }

    /// Runs until every `HubHandle` clone has been dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                maybe_session = self.register_rx.recv() => {
                    match maybe_session {
                        Some(session) => self.handle_register(session).await,
                        None => break,
                    }
                }
                maybe_session = self.deregister_rx.recv() => {
                    match maybe_session {
                        Some(session) => self.handle_deregister(session).await,
                        None => break,
                    }
                }
                maybe_cmd = self.control_rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => self.handle_control(cmd),
                        None => break,
                    }
                }
                maybe_broadcast = self.broadcast_rx.recv() => {
                    match maybe_broadcast {
                        Some((envelope, exclude)) => self.handle_broadcast(envelope, exclude),
                        None => break,
                    }
                }
                maybe_broadcast = self.broadcast_to_chat_rx.recv() => {
                    match maybe_broadcast {
                        Some((chat, envelope, exclude)) => self.handle_broadcast_to_chat(chat, envelope, exclude),
                        None => break,
                    }
                }
            }
        }
        info!("hub loop exiting");
    }

    async fn handle_register(&mut self, session: Session) {
        let user_id = session.user_id();
        if let Some(prior) = self.sessions_by_user.remove(&user_id) {
            info!(user_id = %user_id, "evicting prior session on duplicate login");
            self.remove_from_chats(&prior);
            prior.close();
        }

        let persistence = self.persistence.clone();
        let set_online_user = user_id;
        tokio::spawn(async move {
            if let Err(e) = persistence.set_online(set_online_user, true).await {
                tracing::warn!(user_id = %set_online_user, error = %e, "failed to mark user online");
            }
        });

        info!(user_id = %user_id, username = session.username(), "session registered");
        self.sessions_by_user.insert(user_id, session.clone());

        self.handle_broadcast(
            ServerFrame::UserOnline {
                user_id,
                username: session.username().to_string(),
                is_online: true,
            }
            .encode(),
            Some(user_id),
        );
    }

    async fn handle_deregister(&mut self, session: Session) {
        let user_id = session.user_id();
        let still_current = self
            .sessions_by_user
            .get(&user_id)
            .map(|current| current.session_id() == session.session_id())
            .unwrap_or(false);

        if !still_current {
            // Already replaced by a newer session (duplicate login); nothing to do.
            return;
        }

        self.sessions_by_user.remove(&user_id);
        self.remove_from_chats(&session);
        session.close();

        let persistence = self.persistence.clone();
        tokio::spawn(async move {
            if let Err(e) = persistence.set_online(user_id, false).await {
                tracing::warn!(user_id = %user_id, error = %e, "failed to mark user offline");
            }
        });

        info!(user_id = %user_id, "session deregistered");
        self.handle_broadcast(
            ServerFrame::UserOffline {
                user_id,
                username: session.username().to_string(),
                is_online: false,
                last_seen: chrono::Utc::now(),
            }
            .encode(),
            Some(user_id),
        );
    }

    fn remove_from_chats(&mut self, session: &Session) {
        for chat in session.subscribed_chats() {
            if let Some(subscribers) = self.subscribers_by_chat.get_mut(&chat) {
                subscribers.remove(&session.user_id());
                if subscribers.is_empty() {
                    self.subscribers_by_chat.remove(&chat);
                }
            }
        }
    }

    fn handle_control(&mut self, cmd: ControlCommand) {
        match cmd {
            ControlCommand::Subscribe { session, chat } => {
                session.subscribe(chat);
                self.subscribers_by_chat
                    .entry(chat)
                    .or_default()
                    .insert(session.user_id(), session);
            }
            ControlCommand::Unsubscribe { session, chat } => {
                session.unsubscribe(chat);
                if let Some(subscribers) = self.subscribers_by_chat.get_mut(&chat) {
                    subscribers.remove(&session.user_id());
                    if subscribers.is_empty() {
                        self.subscribers_by_chat.remove(&chat);
                    }
                }
            }
        }
        crate::metrics::set_subscribed_chats(self.subscribers_by_chat.len());
    }

    fn handle_broadcast(&mut self, envelope: Vec<u8>, exclude: Option<UserId>) {
        crate::metrics::record_broadcast();
        let mut evicted = Vec::new();
        for (user_id, session) in self.sessions_by_user.iter() {
            if Some(*user_id) == exclude {
                continue;
            }
            if session.send(envelope.clone()).is_err() {
                evicted.push(session.clone());
            }
        }
        for session in evicted {
            crate::metrics::record_session_evicted();
            self.sessions_by_user.remove(&session.user_id());
            self.remove_from_chats(&session);
        }
        crate::metrics::set_connected_sessions(self.sessions_by_user.len());
    }

    fn handle_broadcast_to_chat(&mut self, chat: ChatId, envelope: Vec<u8>, exclude: Option<UserId>) {
        crate::metrics::record_broadcast();
        let Some(subscribers) = self.subscribers_by_chat.get(&chat) else {
            return;
        };
        let mut evicted = Vec::new();
        for (user_id, session) in subscribers.iter() {
            if Some(*user_id) == exclude {
                continue;
            }
            if session.send(envelope.clone()).is_err() {
                evicted.push(session.clone());
            }
        }
        for session in evicted {
            crate::metrics::record_session_evicted();
            self.sessions_by_user.remove(&session.user_id());
            self.remove_from_chats(&session);
        }
        debug!(chat_id = %chat, subscribers = self.subscribers_by_chat.get(&chat).map(|s| s.len()).unwrap_or(0), "broadcast to chat complete");
    }
}
