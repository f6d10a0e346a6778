//! Listener connection lifecycle.
//!
//! A listener must complete the `join-session` handshake within the grace
//! window or the connection is dropped; a rejected join (unsupported
//! language, full session) leaves the connection open for another attempt
//! until the window runs out.

use super::{ConnectionId, Role};
use crate::error::ServerError;
use crate::AppState;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use shared::ClientMessage;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub async fn run(socket: WebSocket, app_state: Arc<AppState>) {
    let conn_id = ConnectionId::new_v4();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(app_state.config.outbound_queue_capacity);
    let close = CancellationToken::new();
    app_state
        .connections
        .register(conn_id, Role::Listener, tx, close.clone());
    info!("listener connection {} accepted", conn_id);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut joined = false;
    let mut last_seen = Instant::now();
    let join_deadline = tokio::time::sleep(app_state.config.auth_grace);
    tokio::pin!(join_deadline);
    let mut heartbeat = tokio::time::interval(app_state.config.heartbeat_interval);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = close.cancelled() => {
                info!("listener connection {} force-closed", conn_id);
                break;
            }
            _ = &mut join_deadline, if !joined => {
                warn!("listener connection {} never joined a session", conn_id);
                break;
            }
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > app_state.config.heartbeat_timeout {
                    warn!("listener connection {} silent past heartbeat timeout", conn_id);
                    break;
                }
                app_state.connections.send_ping(&conn_id);
            }
            msg = stream.next() => {
                let Some(msg) = msg else { break };
                match msg {
                    Ok(Message::Text(text)) => {
                        last_seen = Instant::now();
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(frame) => {
                                app_state.router.handle_listener_frame(conn_id, frame).await;
                                if !joined {
                                    // The join handshake is complete once the
                                    // router bound this connection to a session.
                                    joined =
                                        app_state.connections.session_of(&conn_id).is_some();
                                }
                            }
                            Err(e) => {
                                app_state.connections.send(
                                    &conn_id,
                                    &ServerError::MalformedFrame(e.to_string()).to_frame(),
                                );
                            }
                        }
                    }
                    Ok(Message::Pong(_)) | Ok(Message::Ping(_)) => {
                        last_seen = Instant::now();
                    }
                    Ok(Message::Close(_)) => {
                        info!("listener connection {} closed by peer", conn_id);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("listener connection {} errored: {}", conn_id, e);
                        break;
                    }
                }
            }
        }
    }

    app_state.router.handle_disconnect(conn_id).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), send_task).await;
}
