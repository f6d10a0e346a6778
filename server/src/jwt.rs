//! JWT mint and verification for admin access/refresh tokens.
//!
//! Tokens are HS256, signed with the server's `TOKEN_SECRET`. Access and
//! refresh tokens share a claims shape and are told apart by the `use`
//! claim so a refresh token can never pass as an access token.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenUse {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminTokenClaims {
    /// Stable admin id from the identity provider.
    pub sub: String,
    pub name: String,
    pub email: String,
    #[serde(rename = "use")]
    pub token_use: TokenUse,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Failed to encode JWT: {0}")]
    Encode(#[from] jsonwebtoken::errors::Error),

    #[error("Invalid token: {0}")]
    Invalid(String),

    #[error("Token expired")]
    Expired,

    #[error("Wrong token use: expected {expected:?}")]
    WrongUse { expected: TokenUse },
}

pub fn create_token(
    secret: &[u8],
    admin_id: &str,
    name: &str,
    email: &str,
    token_use: TokenUse,
    ttl: std::time::Duration,
) -> Result<(String, i64), JwtError> {
    let now = Utc::now();
    let exp = now + Duration::seconds(ttl.as_secs() as i64);

    let claims = AdminTokenClaims {
        sub: admin_id.to_string(),
        name: name.to_string(),
        email: email.to_string(),
        token_use,
        iat: now.timestamp(),
        exp: exp.timestamp(),
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret),
    )?;

    Ok((token, exp.timestamp()))
}

pub fn verify_token(
    secret: &[u8],
    token: &str,
    expected_use: TokenUse,
) -> Result<AdminTokenClaims, JwtError> {
    let mut validation = Validation::default();
    validation.validate_exp = true;

    let token_data = decode::<AdminTokenClaims>(
        token,
        &DecodingKey::from_secret(secret),
        &validation,
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
        _ => JwtError::Invalid(e.to_string()),
    })?;

    if token_data.claims.token_use != expected_use {
        return Err(JwtError::WrongUse {
            expected: expected_use,
        });
    }

    Ok(token_data.claims)
}
