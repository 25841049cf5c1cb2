//! Bearer-token authentication for the REST surface.
//!
//! Login checks a configured credential list and issues an HS256 JWT; a
//! middleware layer validates the token on every other route and injects
//! the caller's identity. Non-admin callers are scoped to their own user.

use axum::{
    Json,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::config::{AuthConfig, UserCredential};
use crate::domain::UserId;
use crate::error::ApiError;

use super::AppState;

/// JWT claims carried by issued tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the username.
    pub sub: String,
    pub admin: bool,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
}

/// Authenticated caller identity, injected as a request extension.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: UserId,
    pub admin: bool,
}

impl AuthUser {
    /// Non-admins may only act on their own sessions.
    pub fn authorize_user(&self, owner: &UserId) -> Result<(), ApiError> {
        if self.admin || self.user == *owner {
            Ok(())
        } else {
            Err(ApiError::Authorization(
                "access to another user's resources is denied".to_string(),
            ))
        }
    }
}

/// Token issuing and verification.
pub struct AuthService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    token_ttl: Duration,
    users: Vec<UserCredential>,
}

impl AuthService {
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            token_ttl: config.token_ttl,
            users: config.users.clone(),
        }
    }

    /// Verifies credentials and issues a token.
    pub fn login(&self, username: &str, password: &str) -> Result<(String, i64), ApiError> {
        let user = self
            .users
            .iter()
            .find(|u| u.username == username && u.password == password)
            .ok_or_else(|| {
                ApiError::Unauthenticated("invalid username or password".to_string())
            })?;

        let exp = Utc::now().timestamp() + i64::try_from(self.token_ttl.as_secs()).unwrap_or(3600);
        let claims = Claims {
            sub: user.username.clone(),
            admin: user.admin,
            exp,
        };
        let token = encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| ApiError::Internal(e.into()))?;
        Ok((token, exp))
    }

    /// Validates a bearer token and recovers the caller identity.
    pub fn verify(&self, token: &str) -> Result<AuthUser, ApiError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())
            .map_err(|e| ApiError::Unauthenticated(format!("invalid token: {e}")))?;
        let user = UserId::try_new(data.claims.sub)
            .map_err(|_| ApiError::Unauthenticated("invalid token subject".to_string()))?;
        Ok(AuthUser {
            user,
            admin: data.claims.admin,
        })
    }
}

/// Login request body.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Login response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: i64,
}

/// `POST /auth/login`.
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let (token, expires_at) = state.auth.login(&request.username, &request.password)?;
    Ok(Json(LoginResponse { token, expires_at }))
}

/// Bearer-token middleware for every protected route.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthenticated("missing bearer token".to_string()))?;

    let auth_user = state.auth.verify(token).inspect_err(|_| {
        warn!("rejected request with invalid bearer token");
    })?;
    request.extensions_mut().insert(auth_user);
    Ok(next.run(request).await)
}
