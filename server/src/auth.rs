//! Session token verification.
//!
//! The duplex subsystem accepts exactly one token shape: a symmetric,
//! HS256-signed JWT carrying `sub` (the user id) and `exp`. There is no
//! DID resolution and no asymmetric algorithm support here — that
//! complexity belongs to the REST auth surface this subsystem doesn't
//! touch, not to a WebSocket handshake that runs once per connection.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing or malformed authorization")]
    MissingOrMalformed,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token expired")]
    Expired,
}

/// Claims carried by a session token. `sub` is the user id; everything
/// else in the token is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
}

#[derive(Clone)]
pub struct JwtVerifier {
    secret: String,
}

impl JwtVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    /// Splits an `Authorization: Bearer <token>` header value and returns
    /// the raw token, or `MissingOrMalformed` if it doesn't look like one.
    pub fn parse_bearer(header_value: Option<&str>) -> Result<&str, AuthError> {
        let value = header_value.ok_or(AuthError::MissingOrMalformed)?;
        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .ok_or(AuthError::MissingOrMalformed)?;
        if token.is_empty() {
            return Err(AuthError::MissingOrMalformed);
        }
        Ok(token)
    }

    /// Verifies `token`, requiring HS256 and an unexpired `exp`. Returns
    /// the non-empty user id from `sub`.
    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.required_spec_claims = ["exp", "sub"].into_iter().map(String::from).collect();

        let data: TokenData<Claims> = jsonwebtoken::decode(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::InvalidToken(e.to_string()),
        })?;

        if data.claims.sub.trim().is_empty() {
            return Err(AuthError::InvalidToken("empty sub claim".to_string()));
        }

        Ok(data.claims.sub)
    }

    /// Issues a token. Used by tests and any admin tooling that needs to
    /// mint a session token without a separate auth service.
    pub fn issue(&self, user_id: &str, ttl_seconds: i64) -> Result<String, AuthError> {
        let claims = Claims {
            sub: user_id.to_string(),
            exp: chrono::Utc::now().timestamp() + ttl_seconds,
        };
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_valid_token() {
        let verifier = JwtVerifier::new("test-secret");
        let token = verifier.issue("user-123", 900).unwrap();
        let user_id = verifier.verify(&token).unwrap();
        assert_eq!(user_id, "user-123");
    }

    #[test]
    fn rejects_expired_token() {
        let verifier = JwtVerifier::new("test-secret");
        let token = verifier.issue("user-123", -1).unwrap();
        assert!(matches!(verifier.verify(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn rejects_wrong_secret() {
        let issuer = JwtVerifier::new("secret-a");
        let verifier = JwtVerifier::new("secret-b");
        let token = issuer.issue("user-123", 900).unwrap();
        assert!(matches!(
            verifier.verify(&token),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn parse_bearer_rejects_malformed_header() {
        assert!(matches!(
            JwtVerifier::parse_bearer(Some("Basic abc")),
            Err(AuthError::MissingOrMalformed)
        ));
        assert!(matches!(
            JwtVerifier::parse_bearer(None),
            Err(AuthError::MissingOrMalformed)
        ));
    }
}
