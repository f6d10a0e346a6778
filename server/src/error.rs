//! Server-side error taxonomy.
//!
//! Every variant maps onto exactly one stable wire code from
//! [`shared::ErrorCode`]; `to_frame` produces the `error` frame sent to
//! clients, keeping internal detail out of user-facing messages.

use shared::{ErrorCode, ServerMessage};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    // Authentication
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("access token expired")]
    TokenExpired,
    #[error("invalid access token: {0}")]
    TokenInvalid(String),
    #[error("refresh token expired")]
    RefreshTokenExpired,

    // Authorization
    #[error("connection is not bound to the session owner")]
    NotOwner,
    #[error("insufficient permission: {0}")]
    InsufficientPermission(String),

    // Session
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session already exists: {0}")]
    SessionAlreadyExists(String),
    #[error("invalid session configuration: {0}")]
    InvalidConfiguration(String),
    #[error("listener limit of {0} reached")]
    ClientLimitExceeded(usize),

    // Identity
    #[error("admin identity not found: {0}")]
    IdentityNotFound(String),
    #[error("display name already taken: {0}")]
    DisplayNameTaken(String),
    #[error("corrupted record: {0}")]
    CorruptedRecord(String),

    // Validation
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
    #[error("language {0} is not enabled for this session")]
    UnsupportedLanguage(String),
    #[error("malformed configuration: {0}")]
    MalformedConfiguration(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    // Upstream
    #[error("speech synthesis failed: {0}")]
    SynthesisFailed(String),
    #[error("identity provider unavailable: {0}")]
    IdentityProviderUnavailable(String),

    // System
    #[error("internal error: {0}")]
    Internal(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("connection limit exceeded")]
    ConnectionLimitExceeded,
}

impl ServerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ServerError::InvalidCredentials => ErrorCode::InvalidCredentials,
            ServerError::TokenExpired => ErrorCode::TokenExpired,
            ServerError::TokenInvalid(_) => ErrorCode::TokenInvalid,
            ServerError::RefreshTokenExpired => ErrorCode::RefreshTokenExpired,
            ServerError::NotOwner => ErrorCode::NotOwner,
            ServerError::InsufficientPermission(_) => ErrorCode::InsufficientPermission,
            ServerError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            ServerError::SessionAlreadyExists(_) => ErrorCode::SessionAlreadyExists,
            ServerError::InvalidConfiguration(_) => ErrorCode::InvalidConfiguration,
            ServerError::ClientLimitExceeded(_) => ErrorCode::ClientLimitExceeded,
            ServerError::IdentityNotFound(_) => ErrorCode::IdentityNotFound,
            ServerError::DisplayNameTaken(_) => ErrorCode::DisplayNameTaken,
            ServerError::CorruptedRecord(_) => ErrorCode::CorruptedRecord,
            ServerError::MissingField(_) => ErrorCode::MissingField,
            ServerError::InvalidSessionId(_) => ErrorCode::InvalidSessionId,
            ServerError::UnsupportedLanguage(_) => ErrorCode::UnsupportedLanguage,
            ServerError::MalformedConfiguration(_) => ErrorCode::MalformedConfiguration,
            ServerError::MalformedFrame(_) => ErrorCode::MalformedFrame,
            ServerError::SynthesisFailed(_) => ErrorCode::SynthesisFailed,
            ServerError::IdentityProviderUnavailable(_) => ErrorCode::IdentityProviderUnavailable,
            ServerError::Internal(_) => ErrorCode::Internal,
            ServerError::Persistence(_) => ErrorCode::PersistenceFailure,
            ServerError::RateLimited { .. } => ErrorCode::RateLimited,
            ServerError::ConnectionLimitExceeded => ErrorCode::ConnectionLimitExceeded,
        }
    }

    pub fn retryable(&self) -> bool {
        self.code().retryable()
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ServerError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Message safe to show on a listener or admin device.
    pub fn user_message(&self) -> String {
        match self {
            ServerError::InvalidCredentials => "Invalid username or password".to_string(),
            ServerError::TokenExpired | ServerError::RefreshTokenExpired => {
                "Your session has expired, please sign in again".to_string()
            }
            ServerError::TokenInvalid(_) => "Authentication failed".to_string(),
            ServerError::NotOwner | ServerError::InsufficientPermission(_) => {
                "You do not have permission to do that".to_string()
            }
            ServerError::SessionNotFound(id) => format!("Session {} was not found", id),
            ServerError::SessionAlreadyExists(id) => format!("Session {} already exists", id),
            ServerError::ClientLimitExceeded(_) => "This session is full".to_string(),
            ServerError::UnsupportedLanguage(lang) => {
                format!("Language {} is not available in this session", lang)
            }
            ServerError::IdentityProviderUnavailable(_) => {
                "The sign-in service is temporarily unavailable".to_string()
            }
            ServerError::RateLimited { .. } => "Too many requests, slow down".to_string(),
            ServerError::InvalidConfiguration(msg)
            | ServerError::MalformedConfiguration(msg)
            | ServerError::MalformedFrame(msg) => msg.clone(),
            ServerError::InvalidSessionId(id) => format!("{} is not a valid session id", id),
            ServerError::MissingField(field) => format!("Missing required field {}", field),
            _ => "Something went wrong on the server".to_string(),
        }
    }

    pub fn to_frame(&self) -> ServerMessage {
        ServerMessage::Error {
            code: self.code(),
            message: self.user_message(),
            details: None,
            retryable: self.retryable(),
            retry_after: self.retry_after_secs(),
        }
    }
}
