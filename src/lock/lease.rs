//! Exclusive lock backed by a Redis lease
//!
//! For deployments where runs for one roster can start on different hosts.
//! The lease is a key set with `NX` and a TTL, holding a random token. It is
//! released with a compare-and-delete script so an expired lease that was
//! taken over by another run is never deleted by the old holder.

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{LockToken, MutualExclusion};
use crate::error::LockError;

/// Delete the key only if it still holds our token
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Redis lease configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisLockConfig {
    /// Redis URL (e.g., redis://localhost:6379)
    pub url: String,

    /// Key prefix for namespacing
    pub key_prefix: String,

    /// Lease lifetime in seconds; must outlive the longest expected run
    pub lease_ttl_secs: u64,

    /// Connection pool size
    pub pool_size: usize,
}

impl Default for RedisLockConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "roster-sync".to_string(),
            lease_ttl_secs: 15 * 60,
            pool_size: 2,
        }
    }
}

/// Key holding the lease for one roster resource
pub fn lock_key(prefix: &str, resource: &str) -> String {
    format!("{prefix}:lock:{resource}")
}

/// Lease-based exclusive lock
pub struct RedisLock {
    pool: Pool,
    key: String,
    lease_ttl: Duration,
    poll_interval: Duration,
}

impl RedisLock {
    /// Connect to Redis and scope the lease to `resource`
    pub async fn connect(config: &RedisLockConfig, resource: &str) -> Result<Self, LockError> {
        let pool = PoolConfig::from_url(&config.url)
            .builder()
            .map_err(|e| LockError::Pool(format!("Failed to create pool builder: {e}")))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| LockError::Pool(format!("Failed to create Redis connection pool: {e}")))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| LockError::Pool(format!("Failed to get Redis connection: {e}")))?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;

        let key = lock_key(&config.key_prefix, resource);
        info!(url = %config.url, key = %key, "Connected to Redis lock backend");

        Ok(Self {
            pool,
            key,
            lease_ttl: Duration::from_secs(config.lease_ttl_secs),
            poll_interval: POLL_INTERVAL,
        })
    }

    /// Key this lock leases
    pub fn key(&self) -> &str {
        &self.key
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, LockError> {
        self.pool
            .get()
            .await
            .map_err(|e| LockError::Pool(format!("Failed to get Redis connection: {e}")))
    }

    async fn try_set(&self, token: &LockToken) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(self.lease_ttl.as_millis() as u64)
            .query_async(&mut *conn)
            .await?;
        Ok(reply.is_some())
    }
}

#[async_trait]
impl MutualExclusion for RedisLock {
    async fn try_acquire(&self, wait: Duration) -> Result<Option<LockToken>, LockError> {
        let token = LockToken::generate();
        let started = Instant::now();

        loop {
            if self.try_set(&token).await? {
                debug!(key = %self.key, token = %token, "Lease taken");
                return Ok(Some(token));
            }

            let elapsed = started.elapsed();
            if elapsed >= wait {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(wait - elapsed)).await;
        }
    }

    async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        let mut conn = self.connection().await?;
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(token.as_str())
            .invoke_async(&mut *conn)
            .await?;

        if deleted == 0 {
            warn!(key = %self.key, token = %token, "Lease already expired or taken over");
        } else {
            debug!(key = %self.key, token = %token, "Lease released");
        }
        Ok(())
    }
}
