use std::sync::Arc;

use gatehouse_state::{DistributedLock, StateStore};
use gatehouse_state_memory::{MemoryDistributedLock, MemoryStateStore};
use gatehouse_state_redis::{RedisConfig, RedisDistributedLock, RedisStateStore};
use tracing::info;

use crate::config::StateSection;
use crate::error::ServerError;

/// Build the state store and lock for the configured backend.
pub fn create_state(
    config: &StateSection,
) -> Result<(Arc<dyn StateStore>, Arc<dyn DistributedLock>), ServerError> {
    match config.backend.as_str() {
        "memory" => {
            info!("state backend: in-memory");
            Ok((
                Arc::new(MemoryStateStore::new()),
                Arc::new(MemoryDistributedLock::new()),
            ))
        }
        "redis" => {
            let redis_config = RedisConfig {
                url: config.redis_url.clone(),
                prefix: config.redis_prefix.clone(),
                ..RedisConfig::default()
            };
            let store = RedisStateStore::new(&redis_config)
                .map_err(|e| ServerError::Config(format!("redis state store: {e}")))?;
            let lock = RedisDistributedLock::new(&redis_config)
                .map_err(|e| ServerError::Config(format!("redis lock: {e}")))?;
            info!(url = %config.redis_url, "state backend: redis");
            Ok((Arc::new(store), Arc::new(lock)))
        }
        other => Err(ServerError::Config(format!(
            "unknown state backend '{other}' (expected 'memory' or 'redis')"
        ))),
    }
}
