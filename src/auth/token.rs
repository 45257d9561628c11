use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::AuthError;
use crate::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
    Verification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub id: Uuid,
    pub kind: TokenKind,
    /// Unique per token; the blacklist key.
    pub jti: Uuid,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0).single().unwrap_or_else(Utc::now)
    }

    /// Remaining lifetime, zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.expires_at() - now).to_std().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct SignedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: SignedToken,
    pub refresh: SignedToken,
}

/// Signs and checks every token the service hands out, all with one HS256
/// secret.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
    verification_ttl: Duration,
}

impl TokenService {
    pub fn new(
        secret: &str,
        access_ttl: Duration,
        refresh_ttl: Duration,
        verification_ttl: Duration,
    ) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl,
            refresh_ttl,
            verification_ttl,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            &settings.auth.jwt_secret,
            Duration::minutes(settings.auth.access_token_ttl_minutes),
            Duration::days(settings.auth.refresh_token_ttl_days),
            Duration::minutes(settings.verification.token_ttl_minutes),
        )
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    pub fn issue_access_token(&self, user_id: Uuid) -> Result<SignedToken> {
        self.sign(user_id, TokenKind::Access, self.access_ttl)
    }

    pub fn issue_refresh_token(&self, user_id: Uuid) -> Result<SignedToken> {
        self.sign(user_id, TokenKind::Refresh, self.refresh_ttl)
    }

    pub fn issue_pair(&self, user_id: Uuid) -> Result<TokenPair> {
        Ok(TokenPair {
            access: self.issue_access_token(user_id)?,
            refresh: self.issue_refresh_token(user_id)?,
        })
    }

    pub fn issue_verification_token(&self, user_id: Uuid) -> Result<SignedToken> {
        self.sign(user_id, TokenKind::Verification, self.verification_ttl)
    }

    /// Six digit numeric code, 100000..=999999.
    pub fn issue_verification_code(&self) -> String {
        rand::thread_rng().gen_range(100_000..1_000_000).to_string()
    }

    pub fn verify_access_token(&self, token: &str) -> Result<Claims> {
        self.verify(token, TokenKind::Access)
    }

    pub fn verify_refresh_token(&self, token: &str) -> Result<Claims> {
        self.verify(token, TokenKind::Refresh)
    }

    pub fn verify_verification_token(&self, token: &str) -> Result<Claims> {
        self.verify(token, TokenKind::Verification)
    }

    fn sign(&self, user_id: Uuid, kind: TokenKind, ttl: Duration) -> Result<SignedToken> {
        let now = Utc::now();
        let expires_at = now + ttl;
        let claims = Claims {
            id: user_id,
            kind,
            jti: Uuid::new_v4(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AppError::InternalError(format!("Token signing failed: {}", e)))?;

        Ok(SignedToken { token, expires_at })
    }

    fn verify(&self, token: &str, expected: TokenKind) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        let claims = decode::<Claims>(token, &self.decoding, &validation)?.claims;
        if claims.kind != expected {
            return Err(AuthError::InvalidToken.into());
        }

        Ok(claims)
    }
}
