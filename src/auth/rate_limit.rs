use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::config::Settings;
use crate::db::{CredentialStore, VerificationCode, VerificationIssue};
use crate::error::AuthError;
use crate::Result;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window_size: Duration,
    pub max_attempts: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_size: Duration::hours(1),
            max_attempts: 5, // verification mails per window
        }
    }
}

impl RateLimitConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            window_size: Duration::minutes(settings.verification.attempt_window_minutes),
            max_attempts: settings.verification.max_attempts,
        }
    }
}

/// Caps how many verification secrets a user may request per rolling window.
///
/// Attempts live in the credential store, not in process memory, so the
/// limit holds across instances. Counting and issuing happen in one store
/// transaction.
pub struct RateLimiter {
    store: Arc<dyn CredentialStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CredentialStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.config.window_size
    }

    /// Records an attempt at `now` and stores `secret` as the user's live
    /// secret, or fails with `TooManyAttempts` carrying the earliest time a
    /// new attempt will be accepted.
    pub async fn issue_at(
        &self,
        user_id: Uuid,
        secret: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<VerificationCode> {
        let outcome = self
            .store
            .issue_verification(
                user_id,
                secret,
                expires_at,
                now,
                self.window_start(now),
                self.config.max_attempts,
            )
            .await?;

        match outcome {
            VerificationIssue::Issued(code) => Ok(code),
            VerificationIssue::Exhausted { oldest_attempt } => {
                let retry_at = oldest_attempt + self.config.window_size;
                warn!(%user_id, %retry_at, "verification attempts exhausted");
                Err(AuthError::TooManyAttempts { retry_at }.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{NewUser, DEFAULT_ROLE};
    use crate::db::MemoryStore;
    use crate::AppError;

    async fn seed_user(store: &MemoryStore, email: &str) -> Uuid {
        let role = store.find_or_create_role(DEFAULT_ROLE).await.unwrap();
        let new_user = NewUser::new(email.into(), "hash".into(), "Lim".into(), "It".into(), &role);
        let user = store.create_user(&new_user).await.unwrap();
        user.id
    }

    async fn limiter_with_user() -> (RateLimiter, MemoryStore, Uuid) {
        let store = MemoryStore::new();
        let user_id = seed_user(&store, "limit@example.com").await;
        let limiter = RateLimiter::new(Arc::new(store.clone()), RateLimitConfig::default());
        (limiter, store, user_id)
    }

    #[tokio::test]
    async fn test_rate_limiter() {
        let (limiter, _store, user_id) = limiter_with_user().await;
        let t0 = Utc::now();

        // Should allow attempts up to limit
        for i in 0..5 {
            let now = t0 + Duration::minutes(i);
            limiter
                .issue_at(user_id, "123456", now + Duration::minutes(10), now)
                .await
                .unwrap();
        }

        // Sixth attempt inside the window is refused
        let now = t0 + Duration::minutes(30);
        let err = limiter
            .issue_at(user_id, "123456", now + Duration::minutes(10), now)
            .await
            .unwrap_err();
        match err {
            AppError::AuthError(AuthError::TooManyAttempts { retry_at }) => {
                assert_eq!(retry_at, t0 + Duration::hours(1));
            }
            other => panic!("Expected TooManyAttempts, got {other:?}"),
        }

        // Once the oldest attempt leaves the window a slot frees up
        let now = t0 + Duration::hours(1);
        limiter
            .issue_at(user_id, "654321", now + Duration::minutes(10), now)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_limits_are_per_user() {
        let (limiter, store, user_id) = limiter_with_user().await;
        let other_id = seed_user(&store, "other@example.com").await;
        let now = Utc::now();
        for _ in 0..5 {
            limiter.issue_at(user_id, "111111", now, now).await.unwrap();
        }
        assert!(limiter.issue_at(user_id, "111111", now, now).await.is_err());

        let code = limiter.issue_at(other_id, "222222", now, now).await.unwrap();
        assert_eq!(code.user_id, other_id);
        assert_eq!(store.attempt_count(other_id).await, 1);
    }
}
