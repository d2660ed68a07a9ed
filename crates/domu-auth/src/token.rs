use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use domu_types::api::Claims;

use crate::AuthError;

/// Issues and verifies HS256 session tokens. Verification is purely
/// stateless; revocation lives in the session table.
#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenSigner {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(
        &self,
        account_id: Uuid,
        email: &str,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<(String, DateTime<Utc>), AuthError> {
        let expires_at = now + self.ttl;
        let claims = Claims {
            sub: account_id,
            email: email.to_string(),
            username: username.to_string(),
            iat: now.timestamp() as usize,
            exp: expires_at.timestamp() as usize,
            jti: Uuid::new_v4(),
        };

        let token = encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| AuthError::Internal(e.into()))?;
        Ok((token, expires_at))
    }

    /// Signature and expiry only.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::default();
        validation.leeway = 0;
        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|_| AuthError::Unauthorized)
    }
}

/// Sessions are keyed by a digest of the token so a leaked database does
/// not hand out usable credentials.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_round_trips_identity() {
        let signer = TokenSigner::new("test-secret", Duration::days(7));
        let id = Uuid::new_v4();
        let (token, expires_at) = signer.issue(id, "a@x.com", "alice", Utc::now()).unwrap();

        let claims = signer.verify(&token).unwrap();
        assert_eq!(claims.sub, id);
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.exp as i64, expires_at.timestamp());
    }

    #[test]
    fn wrong_secret_and_expired_tokens_fail() {
        let signer = TokenSigner::new("test-secret", Duration::days(7));
        let other = TokenSigner::new("other-secret", Duration::days(7));
        let (token, _) = signer.issue(Uuid::new_v4(), "a@x.com", "alice", Utc::now()).unwrap();
        assert!(matches!(other.verify(&token), Err(AuthError::Unauthorized)));

        let (stale, _) = signer
            .issue(Uuid::new_v4(), "a@x.com", "alice", Utc::now() - Duration::days(8))
            .unwrap();
        assert!(matches!(signer.verify(&stale), Err(AuthError::Unauthorized)));
    }

    #[test]
    fn two_issues_in_the_same_second_differ() {
        let signer = TokenSigner::new("test-secret", Duration::days(7));
        let now = Utc::now();
        let id = Uuid::new_v4();
        let (a, _) = signer.issue(id, "a@x.com", "alice", now).unwrap();
        let (b, _) = signer.issue(id, "a@x.com", "alice", now).unwrap();
        assert_ne!(hash_token(&a), hash_token(&b));
    }
}
