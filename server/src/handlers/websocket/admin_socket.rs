//! Admin connection lifecycle.
//!
//! The first frame must be `admin-auth` within the grace window; after
//! that, frames are handed to the router. A heartbeat ping goes out every
//! interval and a silent connection is closed once the timeout elapses.

use super::{ConnectionId, Role};
use crate::error::ServerError;
use crate::AppState;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
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
        .register(conn_id, Role::Admin, tx, close.clone());
    info!("admin connection {} accepted", conn_id);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "".into(),
            })))
            .await;
    });

    let mut authenticated = false;
    let mut last_seen = Instant::now();
    let auth_deadline = tokio::time::sleep(app_state.config.auth_grace);
    tokio::pin!(auth_deadline);
    let mut heartbeat = tokio::time::interval(app_state.config.heartbeat_interval);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = close.cancelled() => {
                info!("admin connection {} force-closed", conn_id);
                break;
            }
            _ = &mut auth_deadline, if !authenticated => {
                warn!("admin connection {} missed the auth grace window", conn_id);
                break;
            }
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > app_state.config.heartbeat_timeout {
                    warn!("admin connection {} silent past heartbeat timeout", conn_id);
                    break;
                }
                app_state.connections.send_ping(&conn_id);
            }
            msg = stream.next() => {
                let Some(msg) = msg else { break };
                match msg {
                    Ok(Message::Text(text)) => {
                        last_seen = Instant::now();
                        let frame = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                app_state.connections.send(
                                    &conn_id,
                                    &ServerError::MalformedFrame(e.to_string()).to_frame(),
                                );
                                continue;
                            }
                        };
                        if authenticated {
                            app_state.router.handle_admin_frame(conn_id, frame).await;
                        } else if matches!(frame, ClientMessage::AdminAuth { .. }) {
                            if app_state.router.authenticate_admin(conn_id, frame).await {
                                authenticated = true;
                            } else {
                                break;
                            }
                        } else {
                            app_state.connections.send(
                                &conn_id,
                                &ServerError::TokenInvalid(
                                    "authenticate before sending frames".to_string(),
                                )
                                .to_frame(),
                            );
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) | Ok(Message::Ping(_)) => {
                        last_seen = Instant::now();
                    }
                    Ok(Message::Close(_)) => {
                        info!("admin connection {} closed by peer", conn_id);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("admin connection {} errored: {}", conn_id, e);
                        break;
                    }
                }
            }
        }
    }

    // Removing the connection drops its sender, letting the writer flush
    // any queued frames (auth failures included) before exiting.
    app_state.router.handle_disconnect(conn_id).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), send_task).await;
}
