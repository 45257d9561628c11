use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::auth::blacklist::TokenBlacklist;
use crate::auth::password::{hash_password, verify_password};
use crate::auth::rate_limit::RateLimiter;
use crate::auth::token::{Claims, SignedToken, TokenPair, TokenService};
use crate::config::{VerificationConfig, VerificationMethod};
use crate::db::models::DEFAULT_ROLE;
use crate::db::{CredentialStore, NewUser, User, VerificationCode};
use crate::error::{AuthError, DatabaseError};
use crate::mail::{self, confirmation_url, MailMessage, Mailer};
use crate::validation::{self, normalize_email};
use crate::{AppError, Result};

const INVALID_CODE: &str = "Invalid verification code";
const EXPIRED_CODE: &str = "Verification code has expired";
const INVALID_TOKEN: &str = "Invalid or expired verification token";

/// Registration payload. Rules apply to the [`normalized`](Self::normalized)
/// form.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "password_excludes_names"))]
pub struct NewRegistration {
    #[validate(
        length(min = 7, max = 254, message = "Email must be between 7 and 254 characters"),
        email(message = "Email is incorrect"),
        custom(
            function = "validation::unrestricted_email",
            message = "Invalid email format or contains a restricted domain"
        )
    )]
    pub email: String,
    #[validate(
        length(min = 8, max = 20, message = "Password must be between 8 and 20 characters"),
        custom(function = "validation::password_strength")
    )]
    pub password: String,
    #[validate(custom(function = "validation::person_name", message = "First name is incorrect"))]
    pub first_name: String,
    #[validate(custom(function = "validation::person_name", message = "Last name is incorrect"))]
    pub last_name: String,
}

impl NewRegistration {
    /// Trimmed names and a trimmed, lower-cased email. The password is kept
    /// as typed.
    pub fn normalized(&self) -> Self {
        Self {
            email: normalize_email(&self.email),
            password: self.password.clone(),
            first_name: self.first_name.trim().to_string(),
            last_name: self.last_name.trim().to_string(),
        }
    }
}

fn password_excludes_names(input: &NewRegistration) -> std::result::Result<(), ValidationError> {
    let names = [input.first_name.as_str(), input.last_name.as_str()];
    validation::password_excludes_names(&input.password, names)
}

/// A user together with a freshly issued access/refresh pair.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub user: User,
    pub tokens: TokenPair,
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub session: AuthSession,
    pub code_expires_at: DateTime<Utc>,
}

/// Registration, login, refresh, logout and email confirmation.
pub struct AuthService {
    store: Arc<dyn CredentialStore>,
    tokens: Arc<TokenService>,
    limiter: RateLimiter,
    blacklist: Arc<dyn TokenBlacklist>,
    mailer: Arc<dyn Mailer>,
    verification: VerificationConfig,
    bcrypt_cost: u32,
}

impl AuthService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        tokens: Arc<TokenService>,
        limiter: RateLimiter,
        blacklist: Arc<dyn TokenBlacklist>,
        mailer: Arc<dyn Mailer>,
        verification: VerificationConfig,
        bcrypt_cost: u32,
    ) -> Self {
        Self {
            store,
            tokens,
            limiter,
            blacklist,
            mailer,
            verification,
            bcrypt_cost,
        }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub async fn register(&self, input: &NewRegistration) -> Result<Registration> {
        let input = input.normalized();
        input.validate()?;
        let email = input.email.clone();

        if self.store.is_email_blocked(&email).await? {
            warn!(%email, "registration attempt with blocked email");
            return Err(AppError::Forbidden("This email is blocked".into()));
        }

        if self.store.find_user_by_email(&email).await?.is_some() {
            return Err(AppError::Conflict("A user with this email already exists".into()));
        }

        let password_hash = hash_password(&input.password, self.bcrypt_cost).await?;
        let role = self.store.find_or_create_role(DEFAULT_ROLE).await?;
        let new_user =
            NewUser::new(email, password_hash, input.first_name, input.last_name, &role);

        // A concurrent registration can still win the race on the unique index.
        let user = match self.store.create_user(&new_user).await {
            Err(AppError::DatabaseError(DatabaseError::Duplicate)) => {
                return Err(AppError::Conflict("A user with this email already exists".into()));
            }
            other => other?,
        };
        info!(user_id = %user.id, email = %user.email, "user registered");

        let tokens = self.tokens.issue_pair(user.id)?;
        let record = self.issue_verification(&user).await?;

        Ok(Registration {
            session: AuthSession { user, tokens },
            code_expires_at: record.expires_at,
        })
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSession> {
        let email = normalize_email(email);
        validation::require_non_empty("Email", &email)?;
        validation::require_non_empty("Password", password)?;

        let user = self
            .store
            .find_user_by_email(&email)
            .await?
            .ok_or_else(|| AppError::NotFound("User is not found".into()))?;

        if !verify_password(password, &user.password).await? {
            warn!(user_id = %user.id, "login with wrong password");
            return Err(AuthError::InvalidCredentials.into());
        }

        let tokens = self.tokens.issue_pair(user.id)?;
        info!(user_id = %user.id, "login successful");

        Ok(AuthSession { user, tokens })
    }

    /// Mints a new access token; the refresh token itself is left unchanged.
    pub async fn refresh_access_token(&self, refresh_token: &str) -> Result<SignedToken> {
        let claims = self.tokens.verify_refresh_token(refresh_token)?;
        self.ensure_not_revoked(&claims).await?;

        let user = self.user_for_claims(&claims).await?;
        self.tokens.issue_access_token(user.id)
    }

    /// Resolves a bearer token to its user.
    pub async fn authenticate(&self, access_token: &str) -> Result<(User, Claims)> {
        let claims = self.tokens.verify_access_token(access_token)?;
        self.ensure_not_revoked(&claims).await?;

        let user = self.user_for_claims(&claims).await?;
        Ok((user, claims))
    }

    /// Revokes the access token for the rest of its lifetime, and the refresh
    /// token too when one is presented and still valid.
    pub async fn logout(&self, access: &Claims, refresh_token: Option<&str>) -> Result<()> {
        let now = Utc::now();
        self.blacklist
            .revoke(&access.jti.to_string(), access.remaining(now))
            .await?;

        if let Some(refresh) = refresh_token.filter(|t| !t.is_empty()) {
            if let Ok(claims) = self.tokens.verify_refresh_token(refresh) {
                if claims.id == access.id {
                    self.blacklist
                        .revoke(&claims.jti.to_string(), claims.remaining(now))
                        .await?;
                }
            }
        }

        info!(user_id = %access.id, "logout");
        Ok(())
    }

    pub async fn current_user(&self, id: Uuid) -> Result<User> {
        self.store
            .find_user_by_id(id)
            .await?
            .ok_or_else(|| AuthError::Unauthorized("Invalid token: user not found".into()).into())
    }

    /// Issues a new verification secret for `email` and mails it. The caller
    /// may only ask for their own address.
    pub async fn send_confirmation(&self, caller: &User, email: &str) -> Result<DateTime<Utc>> {
        let email = normalize_email(email);
        validation::require_non_empty("Email", &email)?;

        let user = self
            .store
            .find_user_by_email(&email)
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".into()))?;

        if user.id != caller.id {
            return Err(AppError::Forbidden(
                "You can only request confirmation for your own email".into(),
            ));
        }
        if user.is_verified {
            return Err(AppError::BadRequest("Email is already verified".into()));
        }

        let record = self.issue_verification(&user).await?;
        Ok(record.expires_at)
    }

    pub async fn confirm_email(&self, email: &str, secret: &str) -> Result<User> {
        let email = normalize_email(email);
        validation::require_non_empty("Email", &email)?;
        let (invalid, expired) = match self.verification.method {
            VerificationMethod::Code => {
                validation::verification_code(secret)?;
                (INVALID_CODE, EXPIRED_CODE)
            }
            VerificationMethod::Link => {
                validation::require_non_empty("Token", secret)?;
                (INVALID_TOKEN, INVALID_TOKEN)
            }
        };

        let user = self
            .store
            .find_user_by_email(&email)
            .await?
            .ok_or_else(|| AppError::NotFound("User with this email not found".into()))?;

        let record = match self.store.find_verification(user.id).await? {
            Some(record) if record.secret == secret => record,
            _ => return Err(AppError::BadRequest(invalid.into())),
        };

        if record.is_expired_at(Utc::now()) || !self.token_matches(&record, user.id)? {
            self.store.delete_verification(user.id).await?;
            return Err(AppError::BadRequest(expired.into()));
        }

        // Another request may have consumed the record since the lookup.
        if !self.store.confirm_user(user.id, secret).await? {
            return Err(AppError::BadRequest(invalid.into()));
        }
        info!(user_id = %user.id, "email confirmed");

        self.store
            .find_user_by_id(user.id)
            .await?
            .ok_or_else(|| AppError::InternalError("Confirmed user disappeared".into()))
    }

    /// Link-mode secrets are signed tokens and must still verify for this
    /// user; codes carry no signature.
    fn token_matches(&self, record: &VerificationCode, user_id: Uuid) -> Result<bool> {
        if self.verification.method != VerificationMethod::Link {
            return Ok(true);
        }
        match self.tokens.verify_verification_token(&record.secret) {
            Ok(claims) => Ok(claims.id == user_id),
            Err(AppError::AuthError(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn issue_verification(&self, user: &User) -> Result<VerificationCode> {
        let now = Utc::now();
        let (secret, expires_at) = match self.verification.method {
            VerificationMethod::Code => (
                self.tokens.issue_verification_code(),
                now + Duration::minutes(self.verification.code_ttl_minutes),
            ),
            VerificationMethod::Link => {
                let token = self.tokens.issue_verification_token(user.id)?;
                (token.token, token.expires_at)
            }
        };

        let record = self.limiter.issue_at(user.id, &secret, expires_at, now).await?;

        let message = match self.verification.method {
            VerificationMethod::Code => MailMessage::confirmation_code(
                &user.email,
                &record.secret,
                self.verification.code_ttl_minutes,
            ),
            VerificationMethod::Link => MailMessage::confirmation_link(
                &user.email,
                &confirmation_url(&self.verification.frontend_url, &record.secret)?,
            ),
        };
        mail::dispatch(self.mailer.clone(), message);

        Ok(record)
    }

    async fn ensure_not_revoked(&self, claims: &Claims) -> Result<()> {
        if self.blacklist.is_revoked(&claims.jti.to_string()).await? {
            return Err(AuthError::TokenRevoked.into());
        }
        Ok(())
    }

    async fn user_for_claims(&self, claims: &Claims) -> Result<User> {
        self.current_user(claims.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::blacklist::InMemoryBlacklist;
    use crate::auth::rate_limit::RateLimitConfig;
    use crate::config::Settings;
    use crate::db::MemoryStore;
    use crate::error::MailError;
    use crate::mail::MockMailer;

    fn quiet_mailer() -> MockMailer {
        let mut mailer = MockMailer::new();
        mailer.expect_send().returning(|_| Ok(()));
        mailer
    }

    fn service_with(
        store: MemoryStore,
        mailer: MockMailer,
        method: VerificationMethod,
    ) -> AuthService {
        let mut settings = Settings::new_for_test().unwrap();
        settings.verification.method = method;
        let store: Arc<dyn CredentialStore> = Arc::new(store);

        AuthService::new(
            store.clone(),
            Arc::new(TokenService::from_settings(&settings)),
            RateLimiter::new(store, RateLimitConfig::from_settings(&settings)),
            Arc::new(InMemoryBlacklist::new()),
            Arc::new(mailer),
            settings.verification.clone(),
            settings.auth.bcrypt_cost,
        )
    }

    fn registration(email: &str) -> NewRegistration {
        NewRegistration {
            email: email.into(),
            password: "Passw0rd!".into(),
            first_name: "Ada".into(),
            last_name: "Byron".into(),
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_register_then_login_returns_same_user() {
        let service = service_with(MemoryStore::new(), quiet_mailer(), VerificationMethod::Code);

        let registered = service.register(&registration("a@mail.com")).await.unwrap();
        assert!(!registered.session.user.is_verified);
        assert_eq!(registered.session.user.role_name, DEFAULT_ROLE);

        let session = service.login("a@mail.com", "Passw0rd!").await.unwrap();
        assert_eq!(session.user.id, registered.session.user.id);

        let claims = service.tokens().verify_access_token(&session.tokens.access.token).unwrap();
        assert_eq!(claims.id, registered.session.user.id);
    }

    #[tokio::test]
    async fn test_register_sends_code_by_mail() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut tx = Some(tx);
        let mut mailer = MockMailer::new();
        mailer
            .expect_send()
            .withf(|message: &MailMessage| message.to == "mailed@mail.com")
            .times(1)
            .returning(move |message| {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(message.text.clone());
                }
                Ok(())
            });

        let store = MemoryStore::new();
        let service = service_with(store.clone(), mailer, VerificationMethod::Code);
        let registered = service.register(&registration("mailed@mail.com")).await.unwrap();

        let body = tokio::time::timeout(std::time::Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        let record = store
            .find_verification(registered.session.user.id)
            .await
            .unwrap()
            .unwrap();
        assert!(body.contains(&record.secret));
        assert_eq!(record.expires_at, registered.code_expires_at);
    }

    #[tokio::test]
    async fn test_mail_failure_does_not_fail_registration() {
        let mut mailer = MockMailer::new();
        mailer
            .expect_send()
            .returning(|_| Err(MailError::Transport("connection refused".into())));
        let service = service_with(MemoryStore::new(), mailer, VerificationMethod::Code);

        assert!(service.register(&registration("down@mail.com")).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_and_blocked_registration() {
        let store = MemoryStore::new();
        store.block_email("blocked@mail.com", Utc::now()).await;
        let service = service_with(store, quiet_mailer(), VerificationMethod::Code);

        service.register(&registration("a@mail.com")).await.unwrap();
        assert!(matches!(
            service.register(&registration("A@Mail.com")).await,
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            service.register(&registration("blocked@mail.com")).await,
            Err(AppError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_registration_payload() {
        let service = service_with(MemoryStore::new(), quiet_mailer(), VerificationMethod::Code);
        let mut weak = registration("weak@mail.com");
        weak.password = "password".into();

        assert!(matches!(
            service.register(&weak).await,
            Err(AppError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_blank_or_letterless_names_are_rejected() {
        let store = MemoryStore::new();
        let service = service_with(store.clone(), quiet_mailer(), VerificationMethod::Code);

        for (first, last) in [("   ", "''"), ("Ada", "--"), ("  ", "Byron")] {
            let mut input = registration("blank@mail.com");
            input.first_name = first.into();
            input.last_name = last.into();

            assert!(
                matches!(service.register(&input).await, Err(AppError::ValidationError(_))),
                "{first:?} {last:?}"
            );
        }
        assert!(store.find_user_by_email("blank@mail.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_registration_stores_trimmed_names() {
        let service = service_with(MemoryStore::new(), quiet_mailer(), VerificationMethod::Code);
        let mut input = registration("  Trim@Mail.com ");
        input.first_name = "  Ada ".into();
        input.last_name = " Byron  ".into();

        let user = service.register(&input).await.unwrap().session.user;
        assert_eq!(user.email, "trim@mail.com");
        assert_eq!(user.first_name, "Ada");
        assert_eq!(user.last_name, "Byron");
    }

    #[tokio::test]
    async fn test_registration_rule_messages() {
        let service = service_with(MemoryStore::new(), quiet_mailer(), VerificationMethod::Code);

        let mut common = registration("common@mail.com");
        common.password = "qWERTY123!".into();
        let mut named = registration("named@mail.com");
        named.password = "Byron#2024".into();
        let mut blank = registration("blank@mail.com");
        blank.last_name = "   ".into();

        for (input, expected) in [
            (common, "Password is too common"),
            (named, "Password must not contain your name"),
            (blank, "Last name is incorrect"),
        ] {
            match service.register(&input).await {
                Err(AppError::ValidationError(message)) => assert_eq!(message, expected),
                other => panic!("unexpected result: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_login_failures() {
        let store = MemoryStore::new();
        let service = service_with(store.clone(), quiet_mailer(), VerificationMethod::Code);
        let registered = service.register(&registration("a@mail.com")).await.unwrap();

        assert!(matches!(
            service.login("nobody@mail.com", "Passw0rd!").await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            service.login("a@mail.com", "Wrong0rd!").await,
            Err(AppError::AuthError(AuthError::InvalidCredentials))
        ));

        let unchanged = store.find_user_by_id(registered.session.user.id).await.unwrap().unwrap();
        assert_eq!(unchanged.password, registered.session.user.password);
        assert!(!unchanged.is_verified);
    }

    #[tokio::test]
    async fn test_confirm_with_code() {
        let store = MemoryStore::new();
        let service = service_with(store.clone(), quiet_mailer(), VerificationMethod::Code);
        let registered = service.register(&registration("a@mail.com")).await.unwrap();
        let user_id = registered.session.user.id;
        let code = store.find_verification(user_id).await.unwrap().unwrap().secret;
        let wrong = if code == "000000" { "111111" } else { "000000" };

        assert!(matches!(
            service.confirm_email("a@mail.com", wrong).await,
            Err(AppError::BadRequest(_))
        ));

        let user = service.confirm_email("a@mail.com", &code).await.unwrap();
        assert!(user.is_verified);
        assert!(store.find_verification(user_id).await.unwrap().is_none());

        assert!(matches!(
            service.confirm_email("a@mail.com", &code).await,
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            service.confirm_email("ghost@mail.com", &code).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_code_is_rejected_and_removed() {
        let store = MemoryStore::new();
        let service = service_with(store.clone(), quiet_mailer(), VerificationMethod::Code);
        let registered = service.register(&registration("late@mail.com")).await.unwrap();
        let user_id = registered.session.user.id;

        let now = Utc::now();
        store
            .issue_verification(
                user_id,
                "424242",
                now - Duration::minutes(1),
                now,
                now - Duration::hours(1),
                5,
            )
            .await
            .unwrap();

        match service.confirm_email("late@mail.com", "424242").await {
            Err(AppError::BadRequest(message)) => assert_eq!(message, EXPIRED_CODE),
            other => panic!("Expected BadRequest, got {other:?}"),
        }
        assert!(store.find_verification(user_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_confirm_with_link_token() {
        let store = MemoryStore::new();
        let service = service_with(store.clone(), quiet_mailer(), VerificationMethod::Link);
        let registered = service.register(&registration("link@mail.com")).await.unwrap();
        let token = store
            .find_verification(registered.session.user.id)
            .await
            .unwrap()
            .unwrap()
            .secret;

        let claims = service.tokens().verify_verification_token(&token).unwrap();
        assert_eq!(claims.id, registered.session.user.id);

        assert!(matches!(
            service.confirm_email("link@mail.com", "not-the-token").await,
            Err(AppError::BadRequest(_))
        ));
        let user = service.confirm_email("link@mail.com", &token).await.unwrap();
        assert!(user.is_verified);
    }

    #[tokio::test]
    async fn test_send_confirmation_rules() {
        let store = MemoryStore::new();
        let service = service_with(store.clone(), quiet_mailer(), VerificationMethod::Code);
        let alice = service.register(&registration("alice@mail.com")).await.unwrap().session.user;
        let bob = service.register(&registration("bob@mail.com")).await.unwrap().session.user;

        assert!(matches!(
            service.send_confirmation(&alice, "bob@mail.com").await,
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            service.send_confirmation(&alice, "nobody@mail.com").await,
            Err(AppError::NotFound(_))
        ));

        // Registration used the first attempt; four more fit in the window.
        for _ in 0..4 {
            service.send_confirmation(&bob, "bob@mail.com").await.unwrap();
        }
        assert!(matches!(
            service.send_confirmation(&bob, "bob@mail.com").await,
            Err(AppError::AuthError(AuthError::TooManyAttempts { .. }))
        ));
        assert_eq!(store.attempt_count(bob.id).await, 5);
    }

    #[tokio::test]
    async fn test_refresh_and_logout() {
        let service = service_with(MemoryStore::new(), quiet_mailer(), VerificationMethod::Code);
        let registered = service.register(&registration("a@mail.com")).await.unwrap();
        let tokens = registered.session.tokens;

        let access = service.refresh_access_token(&tokens.refresh.token).await.unwrap();
        let (user, claims) = service.authenticate(&access.token).await.unwrap();
        assert_eq!(user.id, registered.session.user.id);

        service.logout(&claims, Some(&tokens.refresh.token)).await.unwrap();

        assert!(matches!(
            service.authenticate(&access.token).await,
            Err(AppError::AuthError(AuthError::TokenRevoked))
        ));
        assert!(matches!(
            service.refresh_access_token(&tokens.refresh.token).await,
            Err(AppError::AuthError(AuthError::TokenRevoked))
        ));
        // The access token issued at registration was never presented at logout.
        assert!(service.authenticate(&tokens.access.token).await.is_ok());
    }
}
