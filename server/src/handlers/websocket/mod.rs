//! WebSocket entry points and the connection supervisor.
//!
//! Every accepted socket gets a connection id, a bounded outbound queue
//! with a single writer task, and a cancellation token the rest of the
//! server uses to force a close. Broadcast is best-effort: a full queue
//! disconnects the offending connection instead of blocking the sender.

pub mod admin_socket;
pub mod listener_socket;
pub mod router;

use axum::{
    extract::{ws::Message, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use serde::Deserialize;
use shared::{AudioCapabilities, LanguageCode, ServerMessage};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::AppState;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Listener,
}

/// Transient per-socket state; created on accept, destroyed on close.
pub struct ConnectionEntry {
    pub role: Role,
    tx: mpsc::Sender<Message>,
    pub admin_id: Option<String>,
    pub session_id: Option<String>,
    pub language: Option<LanguageCode>,
    pub capabilities: AudioCapabilities,
    pub close: CancellationToken,
}

#[derive(Default)]
pub struct ConnectionTable {
    entries: DashMap<ConnectionId, ConnectionEntry>,
    admin_conns: DashMap<String, HashSet<ConnectionId>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        conn_id: ConnectionId,
        role: Role,
        tx: mpsc::Sender<Message>,
        close: CancellationToken,
    ) {
        self.entries.insert(
            conn_id,
            ConnectionEntry {
                role,
                tx,
                admin_id: None,
                session_id: None,
                language: None,
                capabilities: AudioCapabilities::default(),
                close,
            },
        );
    }

    pub fn remove(&self, conn_id: &ConnectionId) -> Option<(Role, Option<String>, Option<String>)> {
        let (_, entry) = self.entries.remove(conn_id)?;
        if let Some(admin_id) = &entry.admin_id {
            if let Some(mut conns) = self.admin_conns.get_mut(admin_id) {
                conns.remove(conn_id);
            }
        }
        Some((entry.role, entry.admin_id, entry.session_id))
    }

    pub fn bind_admin(&self, conn_id: &ConnectionId, admin_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(conn_id) {
            entry.admin_id = Some(admin_id.to_string());
        }
        self.admin_conns
            .entry(admin_id.to_string())
            .or_default()
            .insert(*conn_id);
    }

    pub fn bind_session(&self, conn_id: &ConnectionId, session_id: Option<String>) {
        if let Some(mut entry) = self.entries.get_mut(conn_id) {
            entry.session_id = session_id;
        }
    }

    pub fn set_language(&self, conn_id: &ConnectionId, language: Option<LanguageCode>) {
        if let Some(mut entry) = self.entries.get_mut(conn_id) {
            entry.language = language;
        }
    }

    pub fn set_capabilities(&self, conn_id: &ConnectionId, capabilities: AudioCapabilities) {
        if let Some(mut entry) = self.entries.get_mut(conn_id) {
            entry.capabilities = capabilities;
        }
    }

    pub fn admin_id_of(&self, conn_id: &ConnectionId) -> Option<String> {
        self.entries.get(conn_id)?.admin_id.clone()
    }

    pub fn session_of(&self, conn_id: &ConnectionId) -> Option<String> {
        self.entries.get(conn_id)?.session_id.clone()
    }

    pub fn capabilities_of(&self, conn_id: &ConnectionId) -> AudioCapabilities {
        self.entries
            .get(conn_id)
            .map(|e| e.capabilities.clone())
            .unwrap_or_default()
    }

    /// Enqueues one frame. Overflow or a closed queue cancels the
    /// connection and reports failure; it never blocks the caller.
    pub fn send(&self, conn_id: &ConnectionId, msg: &ServerMessage) -> bool {
        let Some(entry) = self.entries.get(conn_id) else {
            return false;
        };
        let Ok(json) = serde_json::to_string(msg) else {
            return false;
        };
        match entry.tx.try_send(Message::Text(json)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("outbound queue overflow on {}, disconnecting", conn_id);
                entry.close.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => {
                entry.close.cancel();
                false
            }
        }
    }

    pub fn send_ping(&self, conn_id: &ConnectionId) {
        if let Some(entry) = self.entries.get(conn_id) {
            let _ = entry.tx.try_send(Message::Ping(Vec::new()));
        }
    }

    /// Sends to every live connection authenticated as this admin.
    pub fn send_to_admin(&self, admin_id: &str, msg: &ServerMessage) {
        for conn_id in self.admin_connections(admin_id) {
            self.send(&conn_id, msg);
        }
    }

    pub fn admin_connections(&self, admin_id: &str) -> Vec<ConnectionId> {
        self.admin_conns
            .get(admin_id)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_admin_connection(&self, admin_id: &str) -> bool {
        self.admin_conns
            .get(admin_id)
            .is_some_and(|conns| !conns.is_empty())
    }

    pub fn broadcast_all(&self, msg: &ServerMessage) {
        let targets: Vec<ConnectionId> = self.entries.iter().map(|e| *e.key()).collect();
        for conn_id in targets {
            self.send(&conn_id, msg);
        }
    }

    pub fn close(&self, conn_id: &ConnectionId) {
        if let Some(entry) = self.entries.get(conn_id) {
            entry.close.cancel();
        }
    }

    pub fn close_all(&self) {
        for entry in self.entries.iter() {
            entry.close.cancel();
        }
    }

    /// (admin count, listener count) for the health endpoint.
    pub fn counts(&self) -> (usize, usize) {
        let mut admins = 0;
        let mut listeners = 0;
        for entry in self.entries.iter() {
            match entry.role {
                Role::Admin => admins += 1,
                Role::Listener => listeners += 1,
            }
        }
        (admins, listeners)
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    role: String,
}

/// Single WebSocket route; the role comes from a query parameter and
/// decides which handshake the connection must complete.
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(app_state): State<Arc<AppState>>,
) -> Response {
    let (admins, listeners) = app_state.connections.counts();
    if admins + listeners >= app_state.config.max_connections {
        warn!(
            "refusing upgrade: {}",
            crate::error::ServerError::ConnectionLimitExceeded
        );
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    match query.role.as_str() {
        "admin" => ws
            .on_upgrade(move |socket| admin_socket::run(socket, app_state))
            .into_response(),
        "listener" => ws
            .on_upgrade(move |socket| listener_socket::run(socket, app_state))
            .into_response(),
        other => {
            info!("rejecting WebSocket upgrade with unknown role {:?}", other);
            StatusCode::BAD_REQUEST.into_response()
        }
    }
}
