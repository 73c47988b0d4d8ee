use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use gatehouse_state::error::StateError;
use gatehouse_state::key::StateKey;
use gatehouse_state::store::{CasResult, StateStore};

/// A single entry in the in-memory store.
#[derive(Debug, Clone)]
struct Entry {
    value: String,
    version: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    /// Returns `true` if this entry has passed its TTL deadline.
    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Compute the expiry instant from an optional TTL duration.
fn expiry_from_ttl(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|d| Instant::now() + d)
}

/// In-memory [`StateStore`] backed by a [`DashMap`].
///
/// Entries are lazily evicted on read when their TTL has elapsed. This
/// implementation is fully synchronous internally; the async trait methods
/// return immediately.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    data: DashMap<String, Entry>,
}

impl MemoryStateStore {
    /// Create a new, empty in-memory state store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Render a [`StateKey`] into the string used as the map key.
    fn render_key(key: &StateKey) -> String {
        key.canonical()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn check_and_set(
        &self,
        key: &StateKey,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StateError> {
        let rendered = Self::render_key(key);

        // Remove any expired entry, then insert only if vacant.
        self.data
            .remove_if(&rendered, |_, entry| entry.is_expired());

        let was_inserted = match self.data.entry(rendered) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Entry {
                    value: value.to_owned(),
                    version: 1,
                    expires_at: expiry_from_ttl(ttl),
                });
                true
            }
        };

        Ok(was_inserted)
    }

    async fn get(&self, key: &StateKey) -> Result<Option<String>, StateError> {
        let rendered = Self::render_key(key);

        // Lazy TTL eviction: check and remove if expired.
        if let Some(entry) = self.data.get(&rendered) {
            if entry.is_expired() {
                drop(entry);
                self.data.remove(&rendered);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }

        Ok(None)
    }

    async fn set(
        &self,
        key: &StateKey,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StateError> {
        let rendered = Self::render_key(key);
        let expires_at = expiry_from_ttl(ttl);

        self.data
            .entry(rendered)
            .and_modify(|entry| {
                value.clone_into(&mut entry.value);
                entry.version += 1;
                entry.expires_at = expires_at;
            })
            .or_insert_with(|| Entry {
                value: value.to_owned(),
                version: 1,
                expires_at,
            });

        Ok(())
    }

    async fn delete(&self, key: &StateKey) -> Result<bool, StateError> {
        let rendered = Self::render_key(key);

        // Remove, but treat expired entries as "not found".
        match self.data.remove(&rendered) {
            Some((_, entry)) => Ok(!entry.is_expired()),
            None => Ok(false),
        }
    }

    async fn increment(
        &self,
        key: &StateKey,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StateError> {
        let rendered = Self::render_key(key);
        let expires_at = expiry_from_ttl(ttl);

        // Remove any expired entry first so the counter starts fresh.
        self.data
            .remove_if(&rendered, |_, entry| entry.is_expired());

        let mut ref_mut = self.data.entry(rendered).or_insert_with(|| Entry {
            value: "0".to_owned(),
            version: 0,
            expires_at,
        });

        let current: i64 = ref_mut
            .value
            .parse()
            .map_err(|e: std::num::ParseIntError| {
                StateError::Serialization(format!("counter value is not an integer: {e}"))
            })?;

        let new_value = current + delta;
        ref_mut.value = new_value.to_string();
        ref_mut.version += 1;

        Ok(new_value)
    }

    async fn compare_and_swap(
        &self,
        key: &StateKey,
        expected_version: u64,
        new_value: &str,
        ttl: Option<Duration>,
    ) -> Result<CasResult, StateError> {
        let rendered = Self::render_key(key);

        // Remove expired entries so they appear as missing.
        self.data
            .remove_if(&rendered, |_, entry| entry.is_expired());

        let Some(mut entry) = self.data.get_mut(&rendered) else {
            return Ok(CasResult::Conflict {
                current_value: None,
                current_version: 0,
            });
        };

        if entry.version != expected_version {
            return Ok(CasResult::Conflict {
                current_value: Some(entry.value.clone()),
                current_version: entry.version,
            });
        }

        new_value.clone_into(&mut entry.value);
        entry.version += 1;
        entry.expires_at = expiry_from_ttl(ttl).or(entry.expires_at);

        Ok(CasResult::Ok)
    }

    async fn clear_all(&self) -> Result<(), StateError> {
        self.data.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use gatehouse_state::key::KeyKind;

    use super::*;

    fn key(id: &str) -> StateKey {
        StateKey::new(KeyKind::Custom("test".into()), id)
    }

    #[tokio::test]
    async fn set_get_delete_roundtrip() {
        let store = MemoryStateStore::new();
        let k = key("a");

        assert_eq!(store.get(&k).await.unwrap(), None);
        store.set(&k, "hello", None).await.unwrap();
        assert_eq!(store.get(&k).await.unwrap(), Some("hello".into()));
        assert!(store.delete(&k).await.unwrap());
        assert_eq!(store.get(&k).await.unwrap(), None);
        assert!(!store.delete(&k).await.unwrap());
    }

    #[tokio::test]
    async fn check_and_set_only_sets_once() {
        let store = MemoryStateStore::new();
        let k = key("once");

        assert!(store.check_and_set(&k, "first", None).await.unwrap());
        assert!(!store.check_and_set(&k, "second", None).await.unwrap());
        assert_eq!(store.get(&k).await.unwrap(), Some("first".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_entries() {
        let store = MemoryStateStore::new();
        let k = key("ttl");

        store
            .set(&k, "v", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(store.get(&k).await.unwrap(), Some("v".into()));

        tokio::time::advance(Duration::from_millis(1_100)).await;
        assert_eq!(store.get(&k).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn increment_restarts_after_ttl() {
        let store = MemoryStateStore::new();
        let k = key("counter");
        let ttl = Some(Duration::from_secs(1));

        assert_eq!(store.increment(&k, 1, ttl).await.unwrap(), 1);
        assert_eq!(store.increment(&k, 1, ttl).await.unwrap(), 2);

        tokio::time::advance(Duration::from_millis(1_100)).await;
        assert_eq!(store.increment(&k, 1, ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn increment_supports_negative_delta() {
        let store = MemoryStateStore::new();
        let k = key("rollback");

        assert_eq!(store.increment(&k, 1, None).await.unwrap(), 1);
        assert_eq!(store.increment(&k, -1, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn compare_and_swap_detects_conflicts() {
        let store = MemoryStateStore::new();
        let k = key("cas");

        store.set(&k, "v1", None).await.unwrap();
        let result = store.compare_and_swap(&k, 1, "v2", None).await.unwrap();
        assert_eq!(result, CasResult::Ok);

        let result = store.compare_and_swap(&k, 1, "v3", None).await.unwrap();
        assert!(matches!(
            result,
            CasResult::Conflict {
                current_version: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn clear_all_is_idempotent() {
        let store = MemoryStateStore::new();
        store.set(&key("a"), "1", None).await.unwrap();
        store.set(&key("b"), "2", None).await.unwrap();

        store.clear_all().await.unwrap();
        assert_eq!(store.get(&key("a")).await.unwrap(), None);

        store.clear_all().await.unwrap();
        assert_eq!(store.get(&key("b")).await.unwrap(), None);
    }
}
