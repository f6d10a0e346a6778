//! Stable machine-readable error codes carried in `error` frames.
//!
//! The taxonomy is closed: clients switch on these codes, so new failure
//! modes map onto an existing code rather than growing the enum casually.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Authentication
    InvalidCredentials,
    TokenExpired,
    TokenInvalid,
    RefreshTokenExpired,

    // Authorization
    NotOwner,
    InsufficientPermission,

    // Session
    SessionNotFound,
    SessionAlreadyExists,
    InvalidConfiguration,
    ClientLimitExceeded,

    // Identity
    IdentityNotFound,
    DisplayNameTaken,
    CorruptedRecord,

    // Validation
    MissingField,
    InvalidSessionId,
    UnsupportedLanguage,
    MalformedConfiguration,
    MalformedFrame,

    // Upstream
    SynthesisFailed,
    IdentityProviderUnavailable,

    // System
    Internal,
    PersistenceFailure,
    RateLimited,
    ConnectionLimitExceeded,
}

impl ErrorCode {
    /// Whether the caller may usefully retry the same request.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::IdentityProviderUnavailable
                | ErrorCode::SynthesisFailed
                | ErrorCode::PersistenceFailure
                | ErrorCode::RateLimited
                | ErrorCode::Internal
        )
    }
}
