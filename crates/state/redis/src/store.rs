use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::{AsyncCommands, Script};

use gatehouse_state::error::StateError;
use gatehouse_state::key::StateKey;
use gatehouse_state::store::{CasResult, StateStore};

use crate::config::RedisConfig;
use crate::scripts;

/// Redis-backed implementation of [`StateStore`].
///
/// Uses a `deadpool-redis` connection pool and Lua scripts for atomicity.
/// Counters are plain Redis strings driven by `INCRBY`; versioned values
/// (written by `set` / `compare_and_swap`) are hashes with fields `v` and
/// `ver`.
pub struct RedisStateStore {
    pool: Pool,
    prefix: String,
}

impl RedisStateStore {
    /// Create a new `RedisStateStore` from the provided configuration.
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

    /// Build the full Redis key for a plain string entry.
    fn string_key(&self, key: &StateKey) -> String {
        format!("{}:{}", self.prefix, key.canonical())
    }

    /// Build the full Redis key for a hash-based entry (versioned data).
    fn hash_key(&self, key: &StateKey) -> String {
        format!("{}:h", self.string_key(key))
    }

    /// Obtain a connection from the pool.
    async fn conn(&self) -> Result<deadpool_redis::Connection, StateError> {
        self.pool
            .get()
            .await
            .map_err(|e| StateError::Connection(e.to_string()))
    }
}

fn ttl_ms(ttl: Option<Duration>) -> i64 {
    ttl.map_or(0i64, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn check_and_set(
        &self,
        key: &StateKey,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StateError> {
        let mut conn = self.conn().await?;
        let result: i64 = Script::new(scripts::CHECK_AND_SET)
            .key(self.string_key(key))
            .key(self.hash_key(key))
            .arg(value)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;

        Ok(result == 1)
    }

    async fn get(&self, key: &StateKey) -> Result<Option<String>, StateError> {
        let mut conn = self.conn().await?;

        // Versioned hash first, then the plain string key.
        let val: Option<String> = conn
            .hget(self.hash_key(key), "v")
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;
        if val.is_some() {
            return Ok(val);
        }

        conn.get(self.string_key(key))
            .await
            .map_err(|e| StateError::Backend(e.to_string()))
    }

    async fn set(
        &self,
        key: &StateKey,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StateError> {
        let hash_key = self.hash_key(key);
        let mut conn = self.conn().await?;

        let cur_ver: Option<u64> = conn
            .hget(&hash_key, "ver")
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;
        let new_ver = cur_ver.map_or(1, |v| v + 1);

        redis::pipe()
            .hset(&hash_key, "v", value)
            .ignore()
            .hset(&hash_key, "ver", new_ver)
            .ignore()
            .del(self.string_key(key))
            .ignore()
            .exec_async(&mut conn)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;

        if let Some(d) = ttl {
            let ms = i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
            let () = conn
                .pexpire(&hash_key, ms)
                .await
                .map_err(|e| StateError::Backend(e.to_string()))?;
        }

        Ok(())
    }

    async fn delete(&self, key: &StateKey) -> Result<bool, StateError> {
        let mut conn = self.conn().await?;

        let (a, b): (i64, i64) = redis::pipe()
            .del(self.hash_key(key))
            .del(self.string_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;

        Ok(a + b > 0)
    }

    async fn increment(
        &self,
        key: &StateKey,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StateError> {
        let mut conn = self.conn().await?;

        Script::new(scripts::INCR_WITH_TTL)
            .key(self.string_key(key))
            .arg(delta)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))
    }

    async fn compare_and_swap(
        &self,
        key: &StateKey,
        expected_version: u64,
        new_value: &str,
        ttl: Option<Duration>,
    ) -> Result<CasResult, StateError> {
        let mut conn = self.conn().await?;
        let result: Vec<redis::Value> = Script::new(scripts::COMPARE_AND_SWAP)
            .key(self.hash_key(key))
            .arg(expected_version)
            .arg(new_value)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;

        // Success: [1, new_version]; conflict: [0, current_version, value|nil].
        let status = match result.first() {
            Some(redis::Value::Int(n)) => *n,
            _ => return Err(StateError::Backend("unexpected CAS script response".into())),
        };

        if status == 1 {
            Ok(CasResult::Ok)
        } else {
            let current_version = match result.get(1) {
                Some(redis::Value::Int(n)) => u64::try_from(*n).unwrap_or(0),
                _ => 0,
            };
            let current_value = match result.get(2) {
                Some(redis::Value::BulkString(bytes)) => String::from_utf8(bytes.clone()).ok(),
                _ => None,
            };

            Ok(CasResult::Conflict {
                current_value,
                current_version,
            })
        }
    }

    async fn clear_all(&self) -> Result<(), StateError> {
        let pattern = format!("{}:*", self.prefix);
        let mut conn = self.conn().await?;
        let mut cursor = 0u64;

        loop {
            let (new_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| StateError::Backend(e.to_string()))?;

            if !keys.is_empty() {
                let () = conn
                    .del(keys)
                    .await
                    .map_err(|e| StateError::Backend(e.to_string()))?;
            }

            cursor = new_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(())
    }
}
