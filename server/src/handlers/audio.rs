//! Serves cached audio artifacts over plain HTTP.
//!
//! URLs carry the fingerprint plus a short-lived token; anything expired,
//! forged, or unknown is rejected before touching the filesystem.

use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
pub struct AudioQuery {
    token: String,
    expires: i64,
}

pub async fn serve_audio(
    State(app_state): State<Arc<AppState>>,
    Path(file): Path<String>,
    Query(query): Query<AudioQuery>,
) -> Response {
    let Some((fingerprint, _ext)) = file.rsplit_once('.') else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if !app_state
        .audio_cache
        .verify_url_token(fingerprint, query.expires, &query.token)
    {
        warn!("rejected audio request for {} (bad or expired token)", file);
        return StatusCode::FORBIDDEN.into_response();
    }

    let Some((path, mime)) = app_state.audio_cache.file_for(&file) else {
        debug!("audio artifact {} not in cache", file);
        return StatusCode::NOT_FOUND.into_response();
    };

    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, mime),
                (header::CACHE_CONTROL, "private, max-age=300".to_string()),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => {
            warn!("failed to read audio artifact {}: {}", path.display(), e);
            StatusCode::NOT_FOUND.into_response()
        }
    }
}
