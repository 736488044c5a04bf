use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config;
use crate::endpoint::RequestContext;
use crate::error::ApiError;

/// Authenticated identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub role: String,
}

impl Principal {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
        }
    }
}

/// Bearer token the principal was established from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthToken {
    pub is_valid: bool,
    pub user_id: String,
    pub user_type: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Outcome of authorizing a request. Both parts may be absent (anonymous).
#[derive(Debug, Clone, Default)]
pub struct Authorization {
    pub principal: Option<Principal>,
    pub token: Option<AuthToken>,
}

impl Authorization {
    pub fn anonymous() -> Self {
        Self::default()
    }
}

/// Application authorization callback, run for every non-public endpoint
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, ctx: &RequestContext) -> Result<Authorization, ApiError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub user_type: String,
    pub exp: i64,
    pub iat: i64,
}

impl Claims {
    pub fn new(sub: impl Into<String>, role: impl Into<String>, user_type: impl Into<String>) -> Self {
        let now = Utc::now();
        let expiry_hours = config::config().security.jwt_expiry_hours;
        let exp = (now + Duration::hours(expiry_hours as i64)).timestamp();

        Self {
            sub: sub.into(),
            role: role.into(),
            user_type: user_type.into(),
            exp,
            iat: now.timestamp(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("JWT secret not configured")]
    MissingSecret,

    #[error("failed to sign token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
}

/// Sign claims with the given HMAC secret
pub fn issue_token(claims: &Claims, secret: &str) -> Result<String, JwtError> {
    if secret.is_empty() {
        return Err(JwtError::MissingSecret);
    }

    encode(&Header::default(), claims, &EncodingKey::from_secret(secret.as_bytes())).map_err(JwtError::Signing)
}

/// Authorizer for `Authorization: Bearer <jwt>` headers signed with a shared secret
#[derive(Clone)]
pub struct JwtAuthorizer {
    secret: String,
}

impl JwtAuthorizer {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    pub fn from_config() -> Self {
        Self::new(config::config().security.jwt_secret.clone())
    }

    /// Signature and expiry check; the message is safe to return to clients
    pub fn validate(&self, token: &str) -> Result<Claims, String> {
        if self.secret.is_empty() {
            return Err(JwtError::MissingSecret.to_string());
        }

        decode::<Claims>(token, &DecodingKey::from_secret(self.secret.as_bytes()), &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| format!("Invalid token: {}", e))
    }
}

impl std::fmt::Debug for JwtAuthorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuthorizer").finish_non_exhaustive()
    }
}

#[async_trait]
impl Authorizer for JwtAuthorizer {
    async fn authorize(&self, ctx: &RequestContext) -> Result<Authorization, ApiError> {
        let token = extract_bearer(ctx.headers()).map_err(ApiError::unauthorized)?;
        let claims = self.validate(&token).map_err(ApiError::unauthorized)?;

        Ok(Authorization {
            principal: Some(Principal::new(claims.sub.clone(), claims.role.clone())),
            token: Some(AuthToken {
                is_valid: true,
                user_id: claims.sub,
                user_type: claims.user_type,
                expires_at: Utc.timestamp_opt(claims.exp, 0).single(),
            }),
        })
    }
}

/// Extract JWT token from Authorization header
pub fn extract_bearer(headers: &HeaderMap) -> Result<String, String> {
    let auth_header = headers
        .get("authorization")
        .ok_or_else(|| "Missing Authorization header".to_string())?;

    let auth_str = auth_header
        .to_str()
        .map_err(|_| "Invalid Authorization header format".to_string())?;

    if let Some(token) = auth_str.strip_prefix("Bearer ") {
        if token.trim().is_empty() {
            return Err("Empty JWT token".to_string());
        }
        Ok(token.trim().to_string())
    } else {
        Err("Authorization header must use Bearer token format".to_string())
    }
}
