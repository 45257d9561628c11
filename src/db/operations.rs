use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::db::models::{NewUser, Role, User, VerificationCode, VerificationIssue};
use crate::db::store::CredentialStore;
use crate::error::DatabaseError;
use crate::{AppError, Result};

const USER_COLUMNS: &str = r#"
    u.id, u.email, u.password, u.first_name, u.last_name, u.is_verified,
    u.created_at, u.role_id, r.role_name
"#;

/// PostgreSQL-backed [`CredentialStore`].
#[derive(Clone)]
pub struct DbOperations {
    pool: Arc<PgPool>,
}

impl DbOperations {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn new_with_options(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| AppError::DatabaseError(DatabaseError::ConnectionError(e.to_string())))?;

        Ok(Self { pool: Arc::new(pool) })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(self.pool.as_ref()).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        self.pool.as_ref()
    }

    pub async fn get_pool_status(&self) -> DbPoolStatus {
        let size = self.pool.size();
        let idle = self.pool.num_idle() as u32;

        DbPoolStatus {
            total_connections: size,
            active_connections: size.saturating_sub(idle),
            idle_connections: idle,
        }
    }

    pub async fn begin_transaction(&self) -> Result<Transaction<'_, Postgres>> {
        Ok(self.pool.as_ref().begin().await?)
    }

    async fn fetch_user(
        transaction: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<User> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users u JOIN roles r ON r.id = u.role_id WHERE u.id = $1"
        ))
        .bind(id)
        .fetch_one(&mut **transaction)
        .await?;

        Ok(user)
    }
}

#[async_trait]
impl CredentialStore for DbOperations {
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users u JOIN roles r ON r.id = u.role_id WHERE u.id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(user)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users u JOIN roles r ON r.id = u.role_id WHERE u.email = $1"
        ))
        .bind(email)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(user)
    }

    async fn find_or_create_role(&self, role_name: &str) -> Result<Role> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let role = sqlx::query_as::<_, Role>(
            r#"
            INSERT INTO roles (id, role_name)
            VALUES ($1, $2)
            ON CONFLICT (role_name) DO UPDATE SET role_name = EXCLUDED.role_name
            RETURNING id, role_name
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(role_name)
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(role)
    }

    async fn create_user(&self, user: &NewUser) -> Result<User> {
        let mut transaction = self.begin_transaction().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO users (id, email, password, first_name, last_name, is_verified, created_at, role_id)
            VALUES ($1, $2, $3, $4, $5, FALSE, $6, $7)
            "#,
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.password)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.created_at)
        .bind(user.role_id)
        .execute(&mut *transaction)
        .await;

        match inserted {
            Ok(_) => {
                let created = Self::fetch_user(&mut transaction, user.id).await?;
                transaction.commit().await?;
                Ok(created)
            }
            Err(e) => {
                transaction.rollback().await?;
                Err(e.into())
            }
        }
    }

    async fn is_email_blocked(&self, email: &str) -> Result<bool> {
        let blocked: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM blocked_emails WHERE email = $1)",
        )
        .bind(email)
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(blocked)
    }

    async fn issue_verification(
        &self,
        user_id: Uuid,
        secret: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<VerificationIssue> {
        let mut transaction = self.begin_transaction().await?;

        // Serializes concurrent issuance for the same user.
        sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_one(&mut *transaction)
            .await?;

        let (count, oldest): (i64, Option<DateTime<Utc>>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), MIN(created_at)
            FROM verification_attempts
            WHERE user_id = $1 AND created_at > $2
            "#,
        )
        .bind(user_id)
        .bind(window_start)
        .fetch_one(&mut *transaction)
        .await?;

        if count >= i64::from(max_attempts) {
            transaction.rollback().await?;
            return Ok(VerificationIssue::Exhausted {
                oldest_attempt: oldest.unwrap_or(now),
            });
        }

        let code = sqlx::query_as::<_, VerificationCode>(
            r#"
            INSERT INTO verification_codes (user_id, secret, expires_at, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE
                SET secret = EXCLUDED.secret,
                    expires_at = EXCLUDED.expires_at,
                    created_at = EXCLUDED.created_at
            RETURNING user_id, secret, expires_at, created_at
            "#,
        )
        .bind(user_id)
        .bind(secret)
        .bind(expires_at)
        .bind(now)
        .fetch_one(&mut *transaction)
        .await?;

        sqlx::query(
            "INSERT INTO verification_attempts (id, user_id, created_at) VALUES ($1, $2, $3)",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(now)
        .execute(&mut *transaction)
        .await?;

        transaction.commit().await?;
        debug!(%user_id, attempts = count + 1, "verification secret issued");

        Ok(VerificationIssue::Issued(code))
    }

    async fn find_verification(&self, user_id: Uuid) -> Result<Option<VerificationCode>> {
        let code = sqlx::query_as::<_, VerificationCode>(
            "SELECT user_id, secret, expires_at, created_at FROM verification_codes WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(code)
    }

    async fn delete_verification(&self, user_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM verification_codes WHERE user_id = $1")
            .bind(user_id)
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    async fn confirm_user(&self, user_id: Uuid, secret: &str) -> Result<bool> {
        let mut transaction = self.begin_transaction().await?;

        let consumed = sqlx::query(
            "DELETE FROM verification_codes WHERE user_id = $1 AND secret = $2",
        )
        .bind(user_id)
        .bind(secret)
        .execute(&mut *transaction)
        .await?
        .rows_affected();

        if consumed == 0 {
            transaction.rollback().await?;
            return Ok(false);
        }

        sqlx::query("UPDATE users SET is_verified = TRUE WHERE id = $1")
            .bind(user_id)
            .execute(&mut *transaction)
            .await?;

        transaction.commit().await?;
        Ok(true)
    }

    async fn delete_unverified_users(&self, created_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM users WHERE is_verified = FALSE AND created_at < $1")
            .bind(created_before)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected())
    }

    async fn delete_attempts(&self, created_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM verification_attempts WHERE created_at < $1")
            .bind(created_before)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected())
    }

    async fn delete_blocked_emails(&self, created_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM blocked_emails WHERE created_at < $1")
            .bind(created_before)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected())
    }

    async fn block_exhausted_users(
        &self,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<u64> {
        let mut transaction = self.begin_transaction().await?;

        let doomed: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT u.id, u.email
            FROM users u
            JOIN verification_codes v ON v.user_id = u.id
            WHERE u.is_verified = FALSE
              AND v.expires_at < $1
              AND (
                SELECT COUNT(*) FROM verification_attempts a
                WHERE a.user_id = u.id AND a.created_at > $2
              ) >= $3
            FOR UPDATE OF u
            "#,
        )
        .bind(now)
        .bind(window_start)
        .bind(i64::from(max_attempts))
        .fetch_all(&mut *transaction)
        .await?;

        if doomed.is_empty() {
            transaction.rollback().await?;
            return Ok(0);
        }

        let (ids, emails): (Vec<Uuid>, Vec<String>) = doomed.into_iter().unzip();

        sqlx::query(
            r#"
            INSERT INTO blocked_emails (email, created_at)
            SELECT email, $2 FROM UNNEST($1::text[]) AS t(email)
            ON CONFLICT (email) DO NOTHING
            "#,
        )
        .bind(&emails)
        .bind(now)
        .execute(&mut *transaction)
        .await?;

        let deleted = sqlx::query("DELETE FROM users WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *transaction)
            .await?
            .rows_affected();

        transaction.commit().await?;
        Ok(deleted)
    }

    async fn delete_expired_verifications(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM verification_codes WHERE expires_at <= $1")
            .bind(now)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DbPoolStatus {
    pub total_connections: u32,
    pub active_connections: u32,
    pub idle_connections: u32,
}
