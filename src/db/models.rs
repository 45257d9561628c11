use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

pub const DEFAULT_ROLE: &str = "user";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: Uuid,
    pub role_name: String,
}

impl Role {
    pub fn new(role_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role_name: role_name.into(),
        }
    }
}

/// A user row joined with its role name. Carries the password hash, so it is
/// never serialized directly; see [`UserResponse`].
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
    pub role_id: Uuid,
    pub role_name: String,
}

/// Input for creating a user; `password` is already hashed.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: Uuid,
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub created_at: DateTime<Utc>,
    pub role_id: Uuid,
}

impl NewUser {
    pub fn new(
        email: String,
        password_hash: String,
        first_name: String,
        last_name: String,
        role: &Role,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            email,
            password: password_hash,
            first_name,
            last_name,
            created_at: Utc::now(),
            role_id: role.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
    pub role_id: Uuid,
    pub role: Role,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
            is_verified: user.is_verified,
            created_at: user.created_at,
            role_id: user.role_id,
            role: Role {
                id: user.role_id,
                role_name: user.role_name,
            },
        }
    }
}

/// The single live verification secret of a user: a numeric code or a signed
/// token, depending on the configured method.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct VerificationCode {
    pub user_id: Uuid,
    pub secret: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl VerificationCode {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Outcome of asking the store to issue a new verification secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationIssue {
    Issued(VerificationCode),
    /// The attempt limit is already reached; carries the oldest attempt
    /// still inside the window.
    Exhausted { oldest_attempt: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct BlockedEmail {
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_response_hides_password() {
        let role = Role::new(DEFAULT_ROLE);
        let user = User {
            id: Uuid::new_v4(),
            email: "a@mail.com".into(),
            password: "$2b$04$hash".into(),
            first_name: "Ada".into(),
            last_name: "Byron".into(),
            is_verified: false,
            created_at: Utc::now(),
            role_id: role.id,
            role_name: role.role_name.clone(),
        };

        let json = serde_json::to_value(UserResponse::from(user)).unwrap();
        assert!(json.get("password").is_none());
        assert_eq!(json["firstName"], "Ada");
        assert_eq!(json["isVerified"], false);
        assert_eq!(json["role"]["roleName"], "user");
        assert_eq!(json["roleId"], json["role"]["id"]);
    }

    #[test]
    fn test_verification_code_expiry_boundary() {
        let now = Utc::now();
        let code = VerificationCode {
            user_id: Uuid::new_v4(),
            secret: "123456".into(),
            expires_at: now,
            created_at: now - chrono::Duration::minutes(10),
        };
        assert!(code.is_expired_at(now));
        assert!(!code.is_expired_at(now - chrono::Duration::seconds(1)));
    }
}
