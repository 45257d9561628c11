//! Revocation list for tokens that must stop working before they expire.
//!
//! Entries are keyed by the token's `jti` claim and live exactly as long as
//! the token would have, so the list never outgrows the set of live tokens.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use crate::Result;

const KEY_PREFIX: &str = "blacklist:";

#[async_trait]
pub trait TokenBlacklist: Send + Sync {
    async fn revoke(&self, jti: &str, ttl: Duration) -> Result<()>;

    async fn is_revoked(&self, jti: &str) -> Result<bool>;

    /// Drops expired entries; backends with native expiry have nothing to do.
    async fn purge_expired(&self) -> Result<u64> {
        Ok(0)
    }
}

/// Redis-backed blacklist, shared by every instance pointing at the same
/// server. Relies on `SET ... EX` for expiry.
#[derive(Clone)]
pub struct RedisBlacklist {
    manager: ConnectionManager,
}

impl RedisBlacklist {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl TokenBlacklist for RedisBlacklist {
    async fn revoke(&self, jti: &str, ttl: Duration) -> Result<()> {
        // Redis rejects EX 0.
        let seconds = ttl.as_secs().max(1);
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(format!("{KEY_PREFIX}{jti}"), "blacklisted", seconds)
            .await?;
        debug!(jti, seconds, "token revoked");
        Ok(())
    }

    async fn is_revoked(&self, jti: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let exists: bool = conn.exists(format!("{KEY_PREFIX}{jti}")).await?;
        Ok(exists)
    }
}

/// Single-process blacklist for tests and local runs without Redis.
#[derive(Clone, Default)]
pub struct InMemoryBlacklist {
    entries: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
}

impl InMemoryBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl TokenBlacklist for InMemoryBlacklist {
    async fn revoke(&self, jti: &str, ttl: Duration) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let mut entries = self.entries.write().await;
        entries.insert(jti.to_string(), Utc::now() + ttl);
        Ok(())
    }

    async fn is_revoked(&self, jti: &str) -> Result<bool> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(jti)
            .map_or(false, |expires_at| *expires_at > Utc::now()))
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        Ok((before - entries.len()) as u64)
    }
}
