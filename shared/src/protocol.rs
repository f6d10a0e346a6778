//! WebSocket frame types for the translation broadcast protocol.
//!
//! Every frame is a JSON object tagged by a kebab-case `type` field with
//! camelCase payload keys, matching what the admin capture app and the
//! listener PWA emit and expect.

use crate::{ErrorCode, LanguageCode, SessionConfig, SessionStatus};
use serde::{Deserialize, Serialize};

/// Authentication method selected in an `admin-auth` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Credentials,
    Token,
}

/// Playback and device-synthesis abilities a listener reports on join.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioCapabilities {
    #[serde(default)]
    pub supports_playback: bool,
    /// Languages the device can synthesize locally.
    #[serde(default)]
    pub local_synthesis_languages: Vec<LanguageCode>,
}

/// Frames the server accepts from admin and listener connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Authenticates an admin connection; expected within the grace window.
    #[serde(rename_all = "camelCase")]
    AdminAuth {
        method: AuthMethod,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
    },

    /// Creates a session. Without a `sessionId` the server mints one.
    #[serde(rename_all = "camelCase")]
    StartSession {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        config: SessionConfig,
    },

    #[serde(rename_all = "camelCase")]
    PauseSession { session_id: String },

    #[serde(rename_all = "camelCase")]
    ResumeSession { session_id: String },

    #[serde(rename_all = "camelCase")]
    EndSession { session_id: String },

    #[serde(rename_all = "camelCase")]
    UpdateSessionConfig {
        session_id: String,
        config: SessionConfig,
    },

    /// A translated line from the admin pipeline, fanned out to listeners.
    #[serde(rename_all = "camelCase")]
    Translation {
        session_id: String,
        language: LanguageCode,
        text: String,
        timestamp: i64,
        sequence_number: u64,
    },

    /// Listener joins a session and subscribes to one language.
    #[serde(rename_all = "camelCase")]
    JoinSession {
        session_id: String,
        preferred_language: LanguageCode,
        #[serde(default)]
        audio_capabilities: AudioCapabilities,
    },

    #[serde(rename_all = "camelCase")]
    ChangeLanguage {
        session_id: String,
        new_language: LanguageCode,
    },

    #[serde(rename_all = "camelCase")]
    LeaveSession { session_id: String },
}

/// Frames the server sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    AdminAuthResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        admin_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
        /// Seconds until the access token expires.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_in: Option<i64>,
        #[serde(default)]
        owned_sessions: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorCode>,
    },

    /// Sent to a listener on join and to all subscribers on config change.
    #[serde(rename_all = "camelCase")]
    SessionMetadata {
        session_id: String,
        config: SessionConfig,
        available_languages: Vec<LanguageCode>,
        tts_available: bool,
    },

    /// Translation broadcast to a language bucket.
    #[serde(rename_all = "camelCase")]
    Translation {
        session_id: String,
        language: LanguageCode,
        text: String,
        timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_url: Option<String>,
        #[serde(
            rename = "useLocalTTS",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        use_local_tts: Option<bool>,
    },

    /// The listener's language was removed from the session; pick another.
    #[serde(rename_all = "camelCase")]
    LanguageUnavailable {
        session_id: String,
        removed_language: LanguageCode,
        available_languages: Vec<LanguageCode>,
    },

    #[serde(rename_all = "camelCase")]
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        retryable: bool,
        /// Seconds to wait before retrying, when the server can estimate it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
    },

    #[serde(rename_all = "camelCase")]
    SessionStatusUpdate {
        session_id: String,
        status: SessionStatus,
        client_count: usize,
    },

    #[serde(rename_all = "camelCase")]
    TokenExpiryWarning {
        /// Unix seconds at which the access token expires.
        expires_at: i64,
        /// Seconds left on the token.
        time_remaining: i64,
    },

    #[serde(rename_all = "camelCase")]
    SessionExpired { reason: String },

    /// Projected hourly spend crossed the configured threshold.
    #[serde(rename_all = "camelCase")]
    CostWarning {
        session_id: String,
        projected_hourly_usd: f64,
        threshold_usd: f64,
    },

    /// Final per-service breakdown emitted when a session ends.
    #[serde(rename_all = "camelCase")]
    CostSummary {
        session_id: String,
        services: Vec<ServiceCost>,
        total_usd: f64,
    },

    #[serde(rename_all = "camelCase")]
    ServerShutdown {
        reason: String,
        reconnect_delay_ms: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCost {
    pub service: String,
    pub units: f64,
    pub cost_usd: f64,
}
