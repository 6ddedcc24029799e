//! Service token authentication.
//!
//! Callers present an HS256 JWT issued by the auth service, either as
//! `Authorization: Bearer <token>` or, for the WebSocket gateway where
//! browsers cannot set headers, as the `token` query parameter.
//!
//! ```text
//! {"sub": "42", "role": "BOOKMAKER", "aud": "messenger", "exp": 1718000000}
//! ```

use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION, request::Parts},
    response::{IntoResponse, Response},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use touchline_core::controllers::Actor;
use touchline_sdk::objects::{Role, UserId};

use crate::state::AppState;

/// Claims carried by a service token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id, as a decimal string.
    pub sub: String,
    pub role: Role,
    pub aud: String,
    pub exp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing service token")]
    MissingToken,
    #[error("invalid service token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token subject is not a user id")]
    InvalidSubject,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match self {
            AuthError::MissingToken => "missing service token",
            AuthError::InvalidToken(_) | AuthError::InvalidSubject => "invalid service token",
        };
        (StatusCode::UNAUTHORIZED, message).into_response()
    }
}

/// Validates service tokens against the shared secret and the configured
/// audiences.
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &[u8], audiences: &[String]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(audiences);
        validation.set_required_spec_claims(&["exp", "aud", "sub"]);
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<Actor, AuthError> {
        let claims = decode::<Claims>(token, &self.key, &self.validation)?.claims;
        let user_id: UserId = claims.sub.parse().map_err(|_| AuthError::InvalidSubject)?;
        Ok(Actor::new(user_id, claims.role))
    }
}

/// Token from an `Authorization: Bearer` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// The authenticated caller of an HTTP handler.
pub struct AuthUser(pub Actor);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(AuthError::MissingToken)?;
        state.tokens.verify(token).map(AuthUser)
    }
}
