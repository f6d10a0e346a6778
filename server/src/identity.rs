//! Identity validation for admin connections.
//!
//! Credential checks are delegated to the external identity provider; on
//! success the server mints its own short-lived HS256 access token and a
//! refresh token, so `authenticate_token` and `refresh` verify locally
//! with no provider round-trip. The provider speaks a Cognito-style JSON
//! API whose error kinds arrive in a `__type` discriminator.

use crate::error::ServerError;
use crate::jwt::{self, JwtError, TokenUse};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::warn;

/// The validated identity tuple handed to the router after authentication.
#[derive(Debug, Clone)]
pub struct ValidatedIdentity {
    pub admin_id: String,
    pub display_name: String,
    pub email: String,
    pub access_token: String,
    /// Present only when fresh tokens were minted (credential auth, refresh).
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait IdentityValidator: Send + Sync {
    async fn authenticate_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<ValidatedIdentity, ServerError>;

    async fn authenticate_token(&self, access_token: &str) -> Result<ValidatedIdentity, ServerError>;

    async fn refresh(&self, refresh_token: &str) -> Result<ValidatedIdentity, ServerError>;
}

#[derive(Debug, Clone)]
pub struct TokenMinter {
    secret: Vec<u8>,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenMinter {
    pub fn new(secret: &str, access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            access_ttl,
            refresh_ttl,
        }
    }

    fn mint(
        &self,
        admin_id: &str,
        name: &str,
        email: &str,
    ) -> Result<ValidatedIdentity, ServerError> {
        let (access_token, exp) = jwt::create_token(
            &self.secret,
            admin_id,
            name,
            email,
            TokenUse::Access,
            self.access_ttl,
        )
        .map_err(|e| ServerError::Internal(format!("token mint failed: {}", e)))?;
        let (refresh_token, _) = jwt::create_token(
            &self.secret,
            admin_id,
            name,
            email,
            TokenUse::Refresh,
            self.refresh_ttl,
        )
        .map_err(|e| ServerError::Internal(format!("token mint failed: {}", e)))?;

        Ok(ValidatedIdentity {
            admin_id: admin_id.to_string(),
            display_name: name.to_string(),
            email: email.to_string(),
            access_token,
            refresh_token: Some(refresh_token),
            expires_at: Utc.timestamp_opt(exp, 0).single().unwrap_or_else(Utc::now),
        })
    }

    fn verify_access(&self, access_token: &str) -> Result<ValidatedIdentity, ServerError> {
        let claims =
            jwt::verify_token(&self.secret, access_token, TokenUse::Access).map_err(
                |e| match e {
                    JwtError::Expired => ServerError::TokenExpired,
                    other => ServerError::TokenInvalid(other.to_string()),
                },
            )?;
        Ok(ValidatedIdentity {
            admin_id: claims.sub,
            display_name: claims.name,
            email: claims.email,
            access_token: access_token.to_string(),
            refresh_token: None,
            expires_at: Utc
                .timestamp_opt(claims.exp, 0)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }

    fn exchange_refresh(&self, refresh_token: &str) -> Result<ValidatedIdentity, ServerError> {
        let claims = jwt::verify_token(&self.secret, refresh_token, TokenUse::Refresh).map_err(
            |e| match e {
                JwtError::Expired => ServerError::RefreshTokenExpired,
                other => ServerError::TokenInvalid(other.to_string()),
            },
        )?;
        // New access token only; the refresh token stays valid until expiry.
        let (access_token, exp) = jwt::create_token(
            &self.secret,
            &claims.sub,
            &claims.name,
            &claims.email,
            TokenUse::Access,
            self.access_ttl,
        )
        .map_err(|e| ServerError::Internal(format!("token mint failed: {}", e)))?;
        Ok(ValidatedIdentity {
            admin_id: claims.sub,
            display_name: claims.name,
            email: claims.email,
            access_token,
            refresh_token: None,
            expires_at: Utc.timestamp_opt(exp, 0).single().unwrap_or_else(Utc::now),
        })
    }
}

/// Shape of a successful identity-provider response.
#[derive(Debug, Deserialize)]
struct ProviderIdentity {
    sub: String,
    #[serde(default)]
    name: Option<String>,
    email: String,
}

/// Cognito-style error payload.
#[derive(Debug, Deserialize)]
struct ProviderError {
    #[serde(rename = "__type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

/// Production validator backed by the configured identity provider.
pub struct ProviderValidator {
    http: reqwest::Client,
    provider_url: String,
    client_id: String,
    minter: TokenMinter,
}

impl ProviderValidator {
    pub fn new(provider_url: String, client_id: String, minter: TokenMinter) -> Self {
        Self {
            http: reqwest::Client::new(),
            provider_url,
            client_id,
            minter,
        }
    }

    fn map_provider_error(err: ProviderError) -> ServerError {
        match err.kind.as_str() {
            "NotAuthorizedException" => ServerError::InvalidCredentials,
            "UserNotFoundException" => ServerError::IdentityNotFound(err.message),
            "PasswordResetRequiredException" => ServerError::InvalidCredentials,
            "TooManyRequestsException" | "LimitExceededException" => {
                ServerError::RateLimited { retry_after_secs: 5 }
            }
            other => ServerError::IdentityProviderUnavailable(format!(
                "{}: {}",
                other, err.message
            )),
        }
    }
}

#[async_trait]
impl IdentityValidator for ProviderValidator {
    async fn authenticate_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<ValidatedIdentity, ServerError> {
        let response = self
            .http
            .post(&self.provider_url)
            .json(&serde_json::json!({
                "clientId": self.client_id,
                "username": username,
                "password": password,
            }))
            .send()
            .await
            .map_err(|e| ServerError::IdentityProviderUnavailable(e.to_string()))?;

        if response.status().is_success() {
            let identity: ProviderIdentity = response
                .json()
                .await
                .map_err(|e| ServerError::IdentityProviderUnavailable(e.to_string()))?;
            let name = identity.name.unwrap_or_else(|| username.to_string());
            self.minter.mint(&identity.sub, &name, &identity.email)
        } else if response.status().is_server_error() {
            Err(ServerError::IdentityProviderUnavailable(format!(
                "provider returned {}",
                response.status()
            )))
        } else {
            let err: ProviderError = response.json().await.unwrap_or_else(|_| ProviderError {
                kind: "Unknown".to_string(),
                message: String::new(),
            });
            warn!("identity provider rejected credential auth: {}", err.kind);
            Err(Self::map_provider_error(err))
        }
    }

    async fn authenticate_token(&self, access_token: &str) -> Result<ValidatedIdentity, ServerError> {
        self.minter.verify_access(access_token)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<ValidatedIdentity, ServerError> {
        self.minter.exchange_refresh(refresh_token)
    }
}

/// Dev-mode validator: accepts any credentials and derives a stable admin
/// id from the username so reconnects keep the same identity.
pub struct DevValidator {
    minter: TokenMinter,
}

impl DevValidator {
    pub fn new(minter: TokenMinter) -> Self {
        Self { minter }
    }

    fn stable_id(username: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(username.as_bytes());
        format!("dev-{}", &hex::encode(hasher.finalize())[..16])
    }
}

#[async_trait]
impl IdentityValidator for DevValidator {
    async fn authenticate_credentials(
        &self,
        username: &str,
        _password: &str,
    ) -> Result<ValidatedIdentity, ServerError> {
        if username.is_empty() {
            return Err(ServerError::InvalidCredentials);
        }
        let admin_id = Self::stable_id(username);
        let email = format!("{}@dev.local", username);
        self.minter.mint(&admin_id, username, &email)
    }

    async fn authenticate_token(&self, access_token: &str) -> Result<ValidatedIdentity, ServerError> {
        self.minter.verify_access(access_token)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<ValidatedIdentity, ServerError> {
        self.minter.exchange_refresh(refresh_token)
    }
}
