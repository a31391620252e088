//! Bearer-token authentication.
//!
//! The middleware resolves the caller to exactly one normalized [`Principal`]
//! before any core handler runs; the core never sees raw tokens or claim
//! shapes.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The single typed identity handed to the core.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

#[derive(Clone)]
pub struct JwtHandler {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtHandler {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }

    pub fn generate_token(&self, user_id: &str, ttl_secs: i64) -> Result<String, jsonwebtoken::errors::Error> {
        let exp = (chrono::Utc::now().timestamp() + ttl_secs) as usize;
        let claims = Claims {
            sub: user_id.to_string(),
            exp,
        };
        encode(&Header::default(), &claims, &self.encoding)
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        decode::<Claims>(token, &self.decoding, &self.validation).map(|data| data.claims)
    }
}

/// Auth middleware that validates the bearer token and attaches a
/// [`Principal`] request extension.
pub async fn auth_middleware(
    State(jwt_handler): State<Arc<JwtHandler>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .ok_or(AuthError::MissingToken)?;

    let claims = jwt_handler
        .validate_token(token)
        .map_err(|_| AuthError::InvalidToken)?;

    req.extensions_mut().insert(Principal {
        user_id: claims.sub,
    });

    Ok(next.run(req).await)
}

#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "Missing authorization token"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
        };
        (status, message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_token_resolves_subject() {
        let handler = JwtHandler::new("test-secret");
        let token = handler.generate_token("user-42", 3600).expect("token");
        let claims = handler.validate_token(&token).expect("valid");
        assert_eq!(claims.sub, "user-42");
    }

    #[test]
    fn expired_token_is_rejected() {
        let handler = JwtHandler::new("test-secret");
        let token = handler.generate_token("user-42", -3600).expect("token");
        assert!(handler.validate_token(&token).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let issuer = JwtHandler::new("secret-a");
        let verifier = JwtHandler::new("secret-b");
        let token = issuer.generate_token("user-42", 3600).expect("token");
        assert!(verifier.validate_token(&token).is_err());
    }
}
