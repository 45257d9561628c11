pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod mail;
pub mod routes;
pub mod scheduler;
pub mod validation;

use actix_web::{web, HttpResponse};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use crate::config::Settings;

pub use auth::{AuthService, RateLimitConfig, RateLimiter};
pub use db::{CredentialStore, DbOperations, MemoryStore, User};

use auth::{InMemoryBlacklist, RedisBlacklist, TokenBlacklist, TokenService};
use mail::Mailer;
use scheduler::{CleanupPolicy, CleanupScheduler};

/// Health check endpoint handler
/// Returns server status, a timestamp and, with PostgreSQL, pool usage
pub async fn health_check(state: Option<web::Data<AppState>>) -> HttpResponse {
    let database = match state.as_ref().and_then(|s| s.db.as_ref()) {
        Some(db) => Some(db.get_pool_status().await),
        None => None,
    };

    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "database": database,
    }))
}

/// Application state shared across all workers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub store: Arc<dyn CredentialStore>,
    pub blacklist: Arc<dyn TokenBlacklist>,
    pub auth_service: Arc<AuthService>,
    pub db: Option<DbOperations>,
}

impl AppState {
    /// Connects to PostgreSQL (running migrations) and, when configured,
    /// Redis.
    pub async fn new(config: Settings) -> Result<Self> {
        let db = DbOperations::new_with_options(
            &config.database.url,
            config.database.max_connections,
            Duration::from_secs(config.database.acquire_timeout_seconds),
        )
        .await?;
        db.migrate().await?;
        info!("Database connected and migrated");

        let blacklist: Arc<dyn TokenBlacklist> = match &config.redis.url {
            Some(url) => {
                let blacklist = RedisBlacklist::connect(url).await?;
                info!("Token blacklist backed by Redis");
                Arc::new(blacklist)
            }
            None => {
                warn!("No redis.url configured; token blacklist is local to this process");
                Arc::new(InMemoryBlacklist::new())
            }
        };

        let mailer = mail::mailer_from_config(&config.mail)?;
        let mut state = Self::from_parts(config, Arc::new(db.clone()), blacklist, mailer);
        state.db = Some(db);
        Ok(state)
    }

    pub fn from_parts(
        config: Settings,
        store: Arc<dyn CredentialStore>,
        blacklist: Arc<dyn TokenBlacklist>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let tokens = Arc::new(TokenService::from_settings(&config));
        let limiter = RateLimiter::new(store.clone(), RateLimitConfig::from_settings(&config));
        let auth_service = AuthService::new(
            store.clone(),
            tokens,
            limiter,
            blacklist.clone(),
            mailer,
            config.verification.clone(),
            config.auth.bcrypt_cost,
        );

        Self {
            config: Arc::new(config),
            store,
            blacklist,
            auth_service: Arc::new(auth_service),
            db: None,
        }
    }

    /// In-process store and blacklist with the log mailer.
    pub fn in_memory(config: Settings) -> Self {
        Self::from_parts(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(InMemoryBlacklist::new()),
            Arc::new(mail::LogMailer),
        )
    }

    pub fn scheduler(&self) -> CleanupScheduler {
        CleanupScheduler::new(
            self.store.clone(),
            self.blacklist.clone(),
            CleanupPolicy::from_settings(&self.config),
        )
    }

    pub async fn shutdown(&self) -> Result<()> {
        if let Some(db) = &self.db {
            db.pool().close().await;
        }
        Ok(())
    }
}
