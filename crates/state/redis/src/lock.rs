//! Redis-backed locking via `SET NX PX` with an owner token.
//!
//! Mutual exclusion holds on a single Redis instance; under Cluster or
//! Sentinel failover the guarantee is best-effort, which matches what the
//! circuit breaker needs (readers tolerate stale state).

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::Script;
use uuid::Uuid;

use gatehouse_state::error::StateError;
use gatehouse_state::lock::{DistributedLock, LockGuard};

use crate::config::RedisConfig;
use crate::scripts;

/// Redis-backed implementation of [`DistributedLock`].
pub struct RedisDistributedLock {
    pool: Pool,
    prefix: String,
}

impl RedisDistributedLock {
    /// Create a new `RedisDistributedLock` from the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Connection`] if the pool cannot be created.
    pub fn new(config: &RedisConfig) -> Result<Self, StateError> {
        let cfg = Config::from_url(&config.url);
        let pool = cfg
            .builder()
            .map(|b| {
                b.max_size(config.pool_size)
                    .wait_timeout(Some(config.connection_timeout))
                    .runtime(Runtime::Tokio1)
                    .build()
            })
            .map_err(|e| StateError::Connection(e.to_string()))?
            .map_err(|e| StateError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            prefix: config.prefix.clone(),
        })
    }

    fn lock_key(&self, name: &str) -> String {
        format!("{}:lock:{name}", self.prefix)
    }
}

#[async_trait]
impl DistributedLock for RedisDistributedLock {
    async fn try_acquire(
        &self,
        name: &str,
        ttl: Duration,
    ) -> Result<Option<Box<dyn LockGuard>>, StateError> {
        let key = self.lock_key(name);
        let owner = Uuid::new_v4().to_string();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;

        if acquired.is_none() {
            return Ok(None);
        }

        Ok(Some(Box::new(RedisLockGuard {
            pool: self.pool.clone(),
            key,
            owner,
        })))
    }
}

/// Guard for a lock acquired via [`RedisDistributedLock`].
struct RedisLockGuard {
    pool: Pool,
    key: String,
    owner: String,
}

#[async_trait]
impl LockGuard for RedisLockGuard {
    async fn release(self: Box<Self>) -> Result<(), StateError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        let _: i64 = Script::new(scripts::RELEASE_LOCK)
            .key(&self.key)
            .arg(&self.owner)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;

        Ok(())
    }
}
