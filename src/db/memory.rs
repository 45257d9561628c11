use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::models::{BlockedEmail, NewUser, Role, User, VerificationCode, VerificationIssue};
use crate::db::store::CredentialStore;
use crate::error::DatabaseError;
use crate::Result;

#[derive(Debug, Clone)]
struct UserRow {
    id: Uuid,
    email: String,
    password: String,
    first_name: String,
    last_name: String,
    is_verified: bool,
    created_at: DateTime<Utc>,
    role_id: Uuid,
}

#[derive(Debug, Default)]
struct Tables {
    roles: HashMap<String, Role>,
    users: HashMap<Uuid, UserRow>,
    codes: HashMap<Uuid, VerificationCode>,
    attempts: HashMap<Uuid, Vec<DateTime<Utc>>>,
    blocked: HashMap<String, BlockedEmail>,
}

impl Tables {
    fn joined(&self, row: &UserRow) -> User {
        let role_name = self
            .roles
            .values()
            .find(|role| role.id == row.role_id)
            .map(|role| role.role_name.clone())
            .unwrap_or_default();

        User {
            id: row.id,
            email: row.email.clone(),
            password: row.password.clone(),
            first_name: row.first_name.clone(),
            last_name: row.last_name.clone(),
            is_verified: row.is_verified,
            created_at: row.created_at,
            role_id: row.role_id,
            role_name,
        }
    }

    fn attempts_since(&self, user_id: Uuid, window_start: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.attempts
            .get(&user_id)
            .map(|all| all.iter().copied().filter(|ts| *ts > window_start).collect())
            .unwrap_or_default()
    }

    // Mirrors the ON DELETE CASCADE of the relational schema.
    fn remove_user(&mut self, id: Uuid) {
        self.users.remove(&id);
        self.codes.remove(&id);
        self.attempts.remove(&id);
    }
}

/// In-process [`CredentialStore`]. A single lock guards all tables, so each
/// method is one transaction. Used by tests and by local runs without a
/// database.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a block entry directly, for seeding.
    pub async fn block_email(&self, email: &str, created_at: DateTime<Utc>) {
        let mut tables = self.tables.write().await;
        tables.blocked.insert(
            email.to_string(),
            BlockedEmail {
                email: email.to_string(),
                created_at,
            },
        );
    }

    pub async fn attempt_count(&self, user_id: Uuid) -> usize {
        let tables = self.tables.read().await;
        tables.attempts.get(&user_id).map_or(0, Vec::len)
    }

    pub async fn user_count(&self) -> usize {
        self.tables.read().await.users.len()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables.users.get(&id).map(|row| tables.joined(row)))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .values()
            .find(|row| row.email == email)
            .map(|row| tables.joined(row)))
    }

    async fn find_or_create_role(&self, role_name: &str) -> Result<Role> {
        let mut tables = self.tables.write().await;
        let role = tables
            .roles
            .entry(role_name.to_string())
            .or_insert_with(|| Role::new(role_name));
        Ok(role.clone())
    }

    async fn create_user(&self, user: &NewUser) -> Result<User> {
        let mut tables = self.tables.write().await;

        if tables.users.values().any(|row| row.email == user.email) {
            return Err(DatabaseError::Duplicate.into());
        }

        let row = UserRow {
            id: user.id,
            email: user.email.clone(),
            password: user.password.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            is_verified: false,
            created_at: user.created_at,
            role_id: user.role_id,
        };
        let created = tables.joined(&row);
        tables.users.insert(row.id, row);

        Ok(created)
    }

    async fn is_email_blocked(&self, email: &str) -> Result<bool> {
        Ok(self.tables.read().await.blocked.contains_key(email))
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
        let mut tables = self.tables.write().await;

        if !tables.users.contains_key(&user_id) {
            return Err(DatabaseError::NotFound.into());
        }

        let recent = tables.attempts_since(user_id, window_start);
        if recent.len() >= max_attempts as usize {
            let oldest_attempt = recent.iter().min().copied().unwrap_or(now);
            return Ok(VerificationIssue::Exhausted { oldest_attempt });
        }

        let code = VerificationCode {
            user_id,
            secret: secret.to_string(),
            expires_at,
            created_at: now,
        };
        tables.codes.insert(user_id, code.clone());
        tables.attempts.entry(user_id).or_default().push(now);

        Ok(VerificationIssue::Issued(code))
    }

    async fn find_verification(&self, user_id: Uuid) -> Result<Option<VerificationCode>> {
        Ok(self.tables.read().await.codes.get(&user_id).cloned())
    }

    async fn delete_verification(&self, user_id: Uuid) -> Result<()> {
        self.tables.write().await.codes.remove(&user_id);
        Ok(())
    }

    async fn confirm_user(&self, user_id: Uuid, secret: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;

        let matches = tables
            .codes
            .get(&user_id)
            .map_or(false, |code| code.secret == secret);
        if !matches {
            return Ok(false);
        }

        tables.codes.remove(&user_id);
        if let Some(row) = tables.users.get_mut(&user_id) {
            row.is_verified = true;
        }

        Ok(true)
    }

    async fn delete_unverified_users(&self, created_before: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let doomed: Vec<Uuid> = tables
            .users
            .values()
            .filter(|row| !row.is_verified && row.created_at < created_before)
            .map(|row| row.id)
            .collect();

        for id in &doomed {
            tables.remove_user(*id);
        }

        Ok(doomed.len() as u64)
    }

    async fn delete_attempts(&self, created_before: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let mut removed = 0u64;

        tables.attempts.retain(|_, timestamps| {
            let before = timestamps.len();
            timestamps.retain(|ts| *ts >= created_before);
            removed += (before - timestamps.len()) as u64;
            !timestamps.is_empty()
        });

        Ok(removed)
    }

    async fn delete_blocked_emails(&self, created_before: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.blocked.len();
        tables.blocked.retain(|_, entry| entry.created_at >= created_before);
        Ok((before - tables.blocked.len()) as u64)
    }

    async fn block_exhausted_users(
        &self,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<u64> {
        let mut tables = self.tables.write().await;

        let doomed: Vec<(Uuid, String)> = tables
            .users
            .values()
            .filter(|row| !row.is_verified)
            .filter(|row| {
                tables
                    .codes
                    .get(&row.id)
                    .map_or(false, |code| code.expires_at < now)
            })
            .filter(|row| {
                tables.attempts_since(row.id, window_start).len() >= max_attempts as usize
            })
            .map(|row| (row.id, row.email.clone()))
            .collect();

        for (id, email) in &doomed {
            tables.blocked.entry(email.clone()).or_insert_with(|| BlockedEmail {
                email: email.clone(),
                created_at: now,
            });
            tables.remove_user(*id);
        }

        Ok(doomed.len() as u64)
    }

    async fn delete_expired_verifications(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.codes.len();
        tables.codes.retain(|_, code| !code.is_expired_at(now));
        Ok((before - tables.codes.len()) as u64)
    }
}
