use actix_web::{error::JsonPayloadError, web, HttpRequest};

use crate::auth::handlers;
use crate::{health_check, AppError};

fn json_error(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    AppError::BadRequest(format!("Invalid request body: {}", err)).into()
}

/// Registers every route. Shared by the binary and the HTTP tests.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error))
        .route("/health", web::get().to(health_check))
        .service(
            web::scope("/auth")
                .route("/register", web::post().to(handlers::register))
                .route("/login", web::post().to(handlers::login))
                .route("/refresh-token", web::post().to(handlers::refresh_token))
                .route("/logout", web::post().to(handlers::logout))
                .route(
                    "/send-confirmation-email",
                    web::post().to(handlers::send_confirmation_email),
                )
                .route("/confirm-email", web::post().to(handlers::confirm_email)),
        )
        .service(
            web::scope("/users")
                .route("/current", web::get().to(handlers::current_user))
                .route(
                    "/send-confirmation-email",
                    web::post().to(handlers::send_confirmation_email),
                )
                .route("/confirm-email", web::post().to(handlers::confirm_email)),
        );
}
