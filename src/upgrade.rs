//! The WebSocket upgrade endpoint: authenticate, build a `Session`, hand it
//! to the hub, then spawn the reader/writer tasks.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::auth::Authenticator;
use crate::config::Config;
use crate::hub::HubHandle;
use crate::persistence::Persistence;
use crate::session::{run_reader, run_writer, Session};

#[derive(Clone)]
pub struct UpgradeState {
    pub hub: HubHandle,
    pub authenticator: Arc<dyn Authenticator>,
    pub persistence: Arc<dyn Persistence>,
    pub config: Arc<Config>,
}

#[derive(Debug, Deserialize)]
pub struct UpgradeQuery {
    token: String,
}

pub async fn ws_upgrade(
    State(state): State<UpgradeState>,
    Query(query): Query<UpgradeQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = match state.authenticator.authenticate(&query.token).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    ws.on_upgrade(move |socket| async move {
        let (session, out_rx) = Session::new(
            identity.user_id,
            identity.username,
            state.config.session_queue_capacity,
        );
        info!(user_id = %session.user_id(), session_id = %session.session_id(), "connection upgraded");

        state.hub.register(session.clone()).await;

        let (sink, stream) = socket.split();
        let writer = tokio::spawn(run_writer(session.clone(), sink, out_rx, state.config.clone()));
        run_reader(session, stream, state.hub.clone(), state.persistence.clone(), state.config.clone()).await;
        let _ = writer.await;
    })
}
