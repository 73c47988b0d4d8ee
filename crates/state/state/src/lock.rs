use std::time::Duration;

use async_trait::async_trait;

use crate::error::StateError;

/// A held lock. Dropping without explicit release is allowed (the lock
/// expires after its TTL), but explicit release is preferred.
#[async_trait]
pub trait LockGuard: Send + Sync {
    /// Explicitly release the lock.
    async fn release(self: Box<Self>) -> Result<(), StateError>;
}

/// Trait for serializing single-writer mutations (circuit breaker state).
///
/// In a single-process deployment the in-memory implementation suffices; the
/// Redis implementation extends the guarantee across gateway instances.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to acquire a lock with the given name and TTL.
    /// Returns `None` if the lock is already held by another owner.
    async fn try_acquire(
        &self,
        name: &str,
        ttl: Duration,
    ) -> Result<Option<Box<dyn LockGuard>>, StateError>;
}
