//! Periodic cleanup of stale credential data.
//!
//! Two background loops share one [`CleanupScheduler`]: a minutely sweep for
//! users, attempts, blocks and revoked tokens, and a sweep at UTC midnight for
//! expired verification secrets.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::auth::blacklist::TokenBlacklist;
use crate::config::Settings;
use crate::db::CredentialStore;
use crate::Result;

#[derive(Debug, Clone)]
pub struct CleanupPolicy {
    pub unverified_user_ttl: Duration,
    pub blocked_email_ttl: Duration,
    pub attempt_window: Duration,
    pub max_attempts: u32,
    pub interval: std::time::Duration,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            unverified_user_ttl: Duration::hours(24),
            blocked_email_ttl: Duration::hours(24),
            attempt_window: Duration::hours(1),
            max_attempts: 5,
            interval: std::time::Duration::from_secs(60),
        }
    }
}

impl CleanupPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            unverified_user_ttl: Duration::hours(settings.cleanup.unverified_user_ttl_hours),
            blocked_email_ttl: Duration::hours(settings.cleanup.blocked_email_ttl_hours),
            attempt_window: Duration::minutes(settings.verification.attempt_window_minutes),
            max_attempts: settings.verification.max_attempts,
            interval: std::time::Duration::from_secs(settings.cleanup.interval_seconds.max(1)),
        }
    }
}

/// Rows removed by one minutely sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub blocked_users: u64,
    pub stale_attempts: u64,
    pub unverified_users: u64,
    pub expired_blocks: u64,
    pub revoked_tokens: u64,
}

impl CleanupReport {
    pub fn total(&self) -> u64 {
        self.blocked_users
            + self.stale_attempts
            + self.unverified_users
            + self.expired_blocks
            + self.revoked_tokens
    }
}

#[derive(Clone)]
pub struct CleanupScheduler {
    store: Arc<dyn CredentialStore>,
    blacklist: Arc<dyn TokenBlacklist>,
    policy: CleanupPolicy,
}

impl CleanupScheduler {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        blacklist: Arc<dyn TokenBlacklist>,
        policy: CleanupPolicy,
    ) -> Self {
        Self {
            store,
            blacklist,
            policy,
        }
    }

    pub async fn run_minutely(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let window_start = now - self.policy.attempt_window;

        // Blocking must see the attempts before they are swept as stale.
        let blocked_users = self
            .store
            .block_exhausted_users(now, window_start, self.policy.max_attempts)
            .await?;
        let stale_attempts = self.store.delete_attempts(window_start).await?;
        let unverified_users = self
            .store
            .delete_unverified_users(now - self.policy.unverified_user_ttl)
            .await?;
        let expired_blocks = self
            .store
            .delete_blocked_emails(now - self.policy.blocked_email_ttl)
            .await?;
        let revoked_tokens = self.blacklist.purge_expired().await?;

        Ok(CleanupReport {
            blocked_users,
            stale_attempts,
            unverified_users,
            expired_blocks,
            revoked_tokens,
        })
    }

    pub async fn run_daily(&self, now: DateTime<Utc>) -> Result<u64> {
        self.store.delete_expired_verifications(now).await
    }

    /// Starts both loops on the current runtime.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let scheduler = Arc::new(self);

        let minutely = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(scheduler.policy.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    match scheduler.run_minutely(Utc::now()).await {
                        Ok(report) if report.total() > 0 => {
                            info!(
                                blocked_users = report.blocked_users,
                                stale_attempts = report.stale_attempts,
                                unverified_users = report.unverified_users,
                                expired_blocks = report.expired_blocks,
                                revoked_tokens = report.revoked_tokens,
                                "cleanup sweep"
                            );
                        }
                        Ok(_) => debug!("cleanup sweep found nothing"),
                        Err(e) => error!(error = %e, "cleanup sweep failed"),
                    }
                }
            })
        };

        let daily = tokio::spawn(async move {
            loop {
                tokio::time::sleep(until_next_midnight(Utc::now())).await;
                match scheduler.run_daily(Utc::now()).await {
                    Ok(removed) => info!(removed, "expired verification secrets removed"),
                    Err(e) => error!(error = %e, "daily cleanup failed"),
                }
            }
        });

        vec![minutely, daily]
    }
}

fn until_next_midnight(now: DateTime<Utc>) -> std::time::Duration {
    now.date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|midnight| Utc.from_utc_datetime(&midnight) - now)
        .and_then(|wait| wait.to_std().ok())
        .unwrap_or(std::time::Duration::from_secs(24 * 60 * 60))
}
