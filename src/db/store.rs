use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::models::{NewUser, Role, User, VerificationCode, VerificationIssue};
use crate::Result;

/// Transactional persistence for users, roles, verification secrets,
/// verification attempts and blocked emails.
///
/// Every method is atomic on its own. Methods that touch several records
/// (`issue_verification`, `confirm_user`, `block_exhausted_users`) run as one
/// transaction so concurrent requests for the same user serialize on the
/// store rather than on in-process locks.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;

    async fn find_or_create_role(&self, role_name: &str) -> Result<Role>;

    /// Fails with `DatabaseError::Duplicate` when the email is taken.
    async fn create_user(&self, user: &NewUser) -> Result<User>;

    async fn is_email_blocked(&self, email: &str) -> Result<bool>;

    /// Counts the user's attempts created after `window_start`. When that
    /// count has reached `max_attempts` nothing is written and the oldest
    /// counted attempt is reported. Otherwise the user's secret is replaced
    /// (upsert) and a new attempt is recorded at `now`.
    async fn issue_verification(
        &self,
        user_id: Uuid,
        secret: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<VerificationIssue>;

    async fn find_verification(&self, user_id: Uuid) -> Result<Option<VerificationCode>>;

    async fn delete_verification(&self, user_id: Uuid) -> Result<()>;

    /// Deletes the user's verification record if it still holds `secret` and
    /// marks the user verified. Returns `false` when no matching record was
    /// left to consume.
    async fn confirm_user(&self, user_id: Uuid, secret: &str) -> Result<bool>;

    async fn delete_unverified_users(&self, created_before: DateTime<Utc>) -> Result<u64>;

    async fn delete_attempts(&self, created_before: DateTime<Utc>) -> Result<u64>;

    async fn delete_blocked_emails(&self, created_before: DateTime<Utc>) -> Result<u64>;

    /// Users whose secret expired before `now` while holding at least
    /// `max_attempts` attempts since `window_start` get their email blocked
    /// and are deleted, in one transaction.
    async fn block_exhausted_users(
        &self,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<u64>;

    async fn delete_expired_verifications(&self, now: DateTime<Utc>) -> Result<u64>;
}
