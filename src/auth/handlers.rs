use actix_web::cookie::time::{Duration as CookieDuration, OffsetDateTime};
use actix_web::cookie::{Cookie, SameSite};
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};
use validator::Validate;

use crate::auth::extractor::AuthenticatedUser;
use crate::auth::service::NewRegistration;
use crate::config::AuthConfig;
use crate::db::UserResponse;
use crate::error::AuthError;
use crate::validation::normalize_email;
use crate::{AppState, Result};

/// The register body is the service's own input; it is validated after the
/// service normalizes it.
pub type RegisterRequest = NewRegistration;

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(
        length(min = 1, message = "Email is required"),
        email(message = "Email is incorrect"),
        custom(
            function = "crate::validation::unrestricted_email",
            message = "Invalid email format or contains a restricted domain"
        )
    )]
    pub email: String,
    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct EmailRequest {
    #[validate(
        length(min = 1, message = "Email is required"),
        email(message = "Email is incorrect"),
        custom(
            function = "crate::validation::unrestricted_email",
            message = "Invalid email format or contains a restricted domain"
        )
    )]
    pub email: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ConfirmEmailRequest {
    #[validate(
        length(min = 1, message = "Email is required"),
        email(message = "Email is incorrect"),
        custom(
            function = "crate::validation::unrestricted_email",
            message = "Invalid email format or contains a restricted domain"
        )
    )]
    pub email: String,
    /// A six digit code, or the link token in link mode. The digit rule
    /// depends on the mode, so the service checks it.
    #[serde(alias = "token")]
    #[validate(length(min = 1, message = "Code is required"))]
    pub code: String,
}

pub fn refresh_cookie(config: &AuthConfig, token: &str, max_age_seconds: i64) -> Cookie<'static> {
    let mut cookie = Cookie::build(config.refresh_cookie_name.clone(), token.to_string())
        .http_only(true)
        .secure(true)
        .same_site(SameSite::None)
        .path("/")
        .max_age(CookieDuration::seconds(max_age_seconds))
        .finish();
    if let Some(domain) = &config.cookie_domain {
        cookie.set_domain(domain.clone());
    }
    cookie
}

pub fn cleared_refresh_cookie(config: &AuthConfig) -> Cookie<'static> {
    let mut cookie = refresh_cookie(config, "", 0);
    cookie.set_expires(OffsetDateTime::UNIX_EPOCH);
    cookie
}

fn session_cookie(state: &AppState, token: &str) -> Cookie<'static> {
    let max_age = state.auth_service.tokens().refresh_ttl().num_seconds();
    refresh_cookie(&state.config.auth, token, max_age)
}

pub async fn register(
    req: web::Json<RegisterRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    info!("Received registration request for email: {}", req.email);

    let registration = match state.auth_service.register(&req).await {
        Ok(registration) => registration,
        Err(e) => {
            error!("Registration failed for email: {}: {}", req.email, e);
            return Err(e);
        }
    };

    let session = registration.session;
    Ok(HttpResponse::Created()
        .cookie(session_cookie(&state, &session.tokens.refresh.token))
        .json(json!({
            "success": true,
            "message": "Registration successful. Please check your email for confirmation.",
            "user": UserResponse::from(session.user),
            "accessToken": session.tokens.access.token,
            "codeExpiresAt": registration.code_expires_at,
        })))
}

pub async fn login(
    req: web::Json<LoginRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    info!("Received login request for email: {}", req.email);
    let mut req = req.into_inner();
    req.email = normalize_email(&req.email);
    req.validate()?;

    let session = state.auth_service.login(&req.email, &req.password).await?;

    Ok(HttpResponse::Ok()
        .cookie(session_cookie(&state, &session.tokens.refresh.token))
        .json(json!({
            "success": true,
            "message": "Login successful",
            "user": UserResponse::from(session.user),
            "accessToken": session.tokens.access.token,
        })))
}

pub async fn refresh_token(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse> {
    let cookie = req
        .cookie(&state.config.auth.refresh_cookie_name)
        .filter(|c| !c.value().is_empty())
        .ok_or(AuthError::MissingToken)?;

    let access = state.auth_service.refresh_access_token(cookie.value()).await?;

    Ok(HttpResponse::Ok().json(json!({ "accessToken": access.token })))
}

pub async fn logout(
    caller: AuthenticatedUser,
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let refresh = req.cookie(&state.config.auth.refresh_cookie_name);
    state
        .auth_service
        .logout(&caller.claims, refresh.as_ref().map(|c| c.value()))
        .await?;

    Ok(HttpResponse::Ok()
        .cookie(cleared_refresh_cookie(&state.config.auth))
        .json(json!({
            "success": true,
            "message": "Successfully logged out"
        })))
}

pub async fn send_confirmation_email(
    caller: AuthenticatedUser,
    req: web::Json<EmailRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let mut req = req.into_inner();
    req.email = normalize_email(&req.email);
    req.validate()?;

    let expires_at = state
        .auth_service
        .send_confirmation(&caller.user, &req.email)
        .await?;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Confirmation email sent",
        "expiresAt": expires_at,
    })))
}

pub async fn confirm_email(
    req: web::Json<ConfirmEmailRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let mut req = req.into_inner();
    req.email = normalize_email(&req.email);
    req.validate()?;

    let user = state.auth_service.confirm_email(&req.email, &req.code).await?;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Email confirmed",
        "user": UserResponse::from(user),
    })))
}

pub async fn current_user(caller: AuthenticatedUser) -> HttpResponse {
    HttpResponse::Ok().json(UserResponse::from(caller.user))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    #[test]
    fn test_refresh_cookie_attributes() {
        let mut settings = Settings::new_for_test().unwrap();
        settings.auth.cookie_domain = Some("example.com".into());

        let cookie = refresh_cookie(&settings.auth, "token-value", 86400);
        assert_eq!(cookie.name(), "refreshToken");
        assert_eq!(cookie.value(), "token-value");
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::None));
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.domain(), Some("example.com"));
        assert_eq!(cookie.max_age(), Some(CookieDuration::days(1)));
    }

    #[test]
    fn test_cleared_cookie_expires_immediately() {
        let settings = Settings::new_for_test().unwrap();
        let cookie = cleared_refresh_cookie(&settings.auth);

        assert_eq!(cookie.value(), "");
        assert_eq!(cookie.max_age(), Some(CookieDuration::ZERO));
        assert_eq!(cookie.expires_datetime(), Some(OffsetDateTime::UNIX_EPOCH));
    }

    #[test]
    fn test_login_request_rules() {
        let ok = LoginRequest {
            email: "ada@mail.com".into(),
            password: "anything".into(),
        };
        assert!(ok.validate().is_ok());

        let restricted = LoginRequest {
            email: "ada@mail.ru".into(),
            password: "anything".into(),
        };
        assert!(restricted.validate().is_err());

        let empty = LoginRequest {
            email: String::new(),
            password: String::new(),
        };
        let errors = empty.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("email"));
        assert!(errors.field_errors().contains_key("password"));
    }

    #[test]
    fn test_confirm_request_leaves_code_format_to_the_service() {
        let req = ConfirmEmailRequest {
            email: "ada@mail.com".into(),
            code: "eyJhbGciOiJIUzI1NiJ9.link.token".into(),
        };
        assert!(req.validate().is_ok());

        let req = ConfirmEmailRequest {
            email: "ada@mail.com".into(),
            code: String::new(),
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_register_request_is_camel_case() {
        let req: RegisterRequest = serde_json::from_str(
            r#"{"email":"a@mail.com","password":"Passw0rd!","firstName":"Ada","lastName":"Byron"}"#,
        )
        .unwrap();
        assert_eq!(req.first_name, "Ada");
        assert!(req.normalized().validate().is_ok());
    }

    #[test]
    fn test_confirm_request_accepts_token_alias() {
        let req: ConfirmEmailRequest =
            serde_json::from_str(r#"{"email":"a@mail.com","token":"abc"}"#).unwrap();
        assert_eq!(req.code, "abc");

        let req: ConfirmEmailRequest =
            serde_json::from_str(r#"{"email":"a@mail.com","code":"123456"}"#).unwrap();
        assert_eq!(req.code, "123456");
    }
}
