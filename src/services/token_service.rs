use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::models::User;

/// Claims carried by both access and refresh tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_name: String,
    pub roles: Vec<String>,
    pub sub: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

/// HS256 token issuer/verifier.
///
/// Secrets are generated per process: access and refresh use distinct
/// material, and every token is invalidated by a restart.
pub struct TokenService {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
}

/// 32 random bytes of secret material.
fn random_secret() -> [u8; 32] {
    let mut buf = [0u8; 32];
    rand::rng().fill_bytes(&mut buf);
    buf
}

impl TokenService {
    pub fn new(access_ttl_secs: i64, refresh_ttl_secs: i64) -> Self {
        let access_secret = random_secret();
        let refresh_secret = random_secret();
        tracing::debug!(
            access_fingerprint = %hex::encode(&access_secret[..4]),
            "Token secrets generated for this process"
        );
        TokenService {
            access_encoding: EncodingKey::from_secret(&access_secret),
            access_decoding: DecodingKey::from_secret(&access_secret),
            refresh_encoding: EncodingKey::from_secret(&refresh_secret),
            refresh_decoding: DecodingKey::from_secret(&refresh_secret),
            access_ttl_secs,
            refresh_ttl_secs,
        }
    }

    fn claims_for(user: &User, ttl_secs: i64) -> Claims {
        let now = Utc::now().timestamp();
        Claims {
            user_name: user.name.clone(),
            roles: user.roles.clone(),
            sub: user.name.clone(),
            iat: now,
            nbf: now,
            exp: now + ttl_secs,
        }
    }

    pub fn issue_access(&self, user: &User) -> Result<String, ApiError> {
        let claims = Self::claims_for(user, self.access_ttl_secs);
        encode(&Header::default(), &claims, &self.access_encoding)
            .map_err(|e| ApiError::Internal(format!("token encoding failed: {}", e)))
    }

    pub fn issue_refresh(&self, user: &User) -> Result<String, ApiError> {
        let claims = Self::claims_for(user, self.refresh_ttl_secs);
        encode(&Header::default(), &claims, &self.refresh_encoding)
            .map_err(|e| ApiError::Internal(format!("token encoding failed: {}", e)))
    }

    pub fn verify_access(&self, token: &str) -> Result<Claims, ApiError> {
        Self::verify(token, &self.access_decoding)
    }

    pub fn verify_refresh(&self, token: &str) -> Result<Claims, ApiError> {
        Self::verify(token, &self.refresh_decoding)
    }

    fn verify(token: &str, key: &DecodingKey) -> Result<Claims, ApiError> {
        let mut validation = Validation::default();
        validation.validate_nbf = true;
        decode::<Claims>(token, key, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!("Token verification failed: {}", e);
                ApiError::Unauthenticated("invalid or expired token".to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_user() -> User {
        User {
            name: "alice".to_string(),
            password_hash: String::new(),
            roles: vec!["User".to_string()],
            group: None,
            config: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_access_token_round_trip() {
        let service = TokenService::new(3600, 86400);
        let token = service.issue_access(&test_user()).unwrap();
        let claims = service.verify_access(&token).unwrap();
        assert_eq!(claims.user_name, "alice");
        assert_eq!(claims.roles, vec!["User".to_string()]);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_refresh_secret_is_distinct() {
        let service = TokenService::new(3600, 86400);
        let refresh = service.issue_refresh(&test_user()).unwrap();
        assert!(service.verify_access(&refresh).is_err());
        tokio_test::assert_ok!(service.verify_refresh(&refresh));
    }

    #[test]
    fn test_tokens_invalid_across_processes() {
        let service_a = TokenService::new(3600, 86400);
        let service_b = TokenService::new(3600, 86400);
        let token = service_a.issue_access(&test_user()).unwrap();
        assert!(service_b.verify_access(&token).is_err());
    }

    #[test]
    fn test_garbage_token_rejected() {
        let service = TokenService::new(3600, 86400);
        assert!(service.verify_access("not-a-token").is_err());
    }
}
