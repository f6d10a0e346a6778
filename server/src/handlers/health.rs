//! Health endpoint: active sessions, connection counts, cache usage.

use crate::AppState;
use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_sessions: usize,
    pub connections: ConnectionCounts,
    pub audio_cache: CacheUsage,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCounts {
    pub admins: usize,
    pub listeners: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheUsage {
    pub bytes_used: u64,
    pub byte_cap: u64,
    pub artifacts: usize,
}

pub async fn health(State(app_state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let (admins, listeners) = app_state.connections.counts();
    let (bytes_used, artifacts) = app_state.audio_cache.stats();
    Json(HealthResponse {
        status: "ok",
        active_sessions: app_state.registry.len(),
        connections: ConnectionCounts { admins, listeners },
        audio_cache: CacheUsage {
            bytes_used,
            byte_cap: app_state.audio_cache.max_bytes(),
            artifacts,
        },
    })
}
