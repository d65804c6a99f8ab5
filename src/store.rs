use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::TimeDelta;
use chrono::Utc;
use moka::future::Cache;
use moka::Expiry;
use rand::Rng;

use crate::error::StoreError;

/// Reserved value meaning "queried, confirmed absent". A serialized record is always a JSON object and can never
/// collide with it.
pub const NULL_MARKER: &str = "\u{0}null";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key:        String,
    pub value:      String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn new(key: String, value: String, ttl: Option<Duration>, jitter: Duration) -> Self {
        Self {
            key,
            value,
            expires_at: expiration_at(ttl, jitter),
        }
    }

    pub fn null_marker(key: String, ttl: Option<Duration>, jitter: Duration) -> Self {
        Self::new(key, NULL_MARKER.to_string(), ttl, jitter)
    }

    pub fn is_null_marker(&self) -> bool {
        is_null_marker(&self.value)
    }
}

pub fn is_null_marker(value: &str) -> bool {
    value == NULL_MARKER
}

/// Absolute expiration: now + ttl + a random share of `jitter`, so records cached in one burst do not expire in one
/// burst too. `None` if there is no ttl.
pub fn expiration_at(ttl: Option<Duration>, jitter: Duration) -> Option<DateTime<Utc>> {
    let ttl = ttl?;
    let jitter_ms = jitter.as_millis().min(u64::MAX as u128) as u64;
    let extra = if jitter_ms > 0 {
        Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
    else {
        Duration::ZERO
    };
    let delta = TimeDelta::from_std(ttl.checked_add(extra)?).ok()?;
    Utc::now().checked_add_signed(delta)
}

fn remaining(expires_at: Option<DateTime<Utc>>) -> Option<Duration> {
    expires_at.map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
}

/// Contract of the secondary cache backend.
///
/// `scan_keys` pages are 0-based. A store is free to return fewer than `page_size` keys on a non-final page; callers
/// keep scanning until an empty page comes back.
#[async_trait]
pub trait CacheStore: Debug + Send + Sync + 'static {
    async fn set(&self, entries: Vec<CacheEntry>) -> Result<(), StoreError>;
    async fn get(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;
    async fn delete(&self, keys: &[String]) -> Result<(), StoreError>;
    async fn scan_keys(&self, prefix: &str, page: usize, page_size: usize) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    value:      Arc<str>,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

struct AbsoluteExpiry;

impl Expiry<String, StoredValue> for AbsoluteExpiry {
    fn expire_after_create(&self, _key: &String, value: &StoredValue, _created_at: Instant) -> Option<Duration> {
        remaining(value.expires_at)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        remaining(value.expires_at)
    }
}

/// In-process [`CacheStore`] over a moka cache.
#[derive(Clone)]
pub struct MokaStore {
    cache: Cache<String, StoredValue>,
}

impl MokaStore {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .name("aside-db")
                .max_capacity(max_capacity)
                .expire_after(AbsoluteExpiry)
                .build(),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for MokaStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

impl Debug for MokaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaStore")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

#[async_trait]
impl CacheStore for MokaStore {
    async fn set(&self, entries: Vec<CacheEntry>) -> Result<(), StoreError> {
        for entry in entries {
            self.cache
                .insert(
                    entry.key,
                    StoredValue {
                        value:      Arc::from(entry.value),
                        expires_at: entry.expires_at,
                    },
                )
                .await;
        }
        Ok(())
    }

    async fn get(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(
                self.cache
                    .get(key)
                    .await
                    .filter(|v| !v.is_expired())
                    .map(|v| v.value.to_string()),
            );
        }
        Ok(values)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        for key in keys {
            self.cache.invalidate(key).await;
        }
        Ok(())
    }

    async fn scan_keys(&self, prefix: &str, page: usize, page_size: usize) -> Result<Vec<String>, StoreError> {
        let mut keys = self
            .cache
            .iter()
            .filter(|(k, v)| k.starts_with(prefix) && !v.is_expired())
            .map(|(k, _)| k.as_ref().clone())
            .collect::<Vec<_>>();
        keys.sort_unstable();
        Ok(keys.into_iter().skip(page * page_size).take(page_size).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn moka_store_roundtrip_and_scan() {
        let store = MokaStore::new(1000);
        store
            .set(vec![
                CacheEntry::new("Order#p##Id=1".into(), "{}".into(), None, Duration::ZERO),
                CacheEntry::new("Order#p##Id=2".into(), "{}".into(), None, Duration::ZERO),
                CacheEntry::null_marker("Order#p##Id=3".into(), None, Duration::ZERO),
                CacheEntry::new("OrderLine#p##Id=1".into(), "{}".into(), None, Duration::ZERO),
            ])
            .await
            .unwrap();

        let values = store
            .get(&["Order#p##Id=3".to_string(), "Order#p##Id=4".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some(NULL_MARKER.to_string()), None]);

        let first = store.scan_keys("Order#", 0, 2).await.unwrap();
        let second = store.scan_keys("Order#", 1, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second, vec!["Order#p##Id=3".to_string()]);

        store.delete(&first).await.unwrap();
        assert_eq!(store.scan_keys("Order#", 0, 10).await.unwrap(), second);
    }

    #[tokio::test]
    async fn expired_entries_are_invisible() {
        let store = MokaStore::new(10);
        store
            .set(vec![CacheEntry::new(
                "k".into(),
                "v".into(),
                Some(Duration::from_millis(30)),
                Duration::ZERO,
            )])
            .await
            .unwrap();
        assert_eq!(store.get(&["k".to_string()]).await.unwrap(), vec![Some("v".to_string())]);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.get(&["k".to_string()]).await.unwrap(), vec![None]);
        assert!(store.scan_keys("k", 0, 10).await.unwrap().is_empty());
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let before = Utc::now();
        let at = expiration_at(Some(Duration::from_secs(10)), Duration::from_secs(2)).unwrap();
        let after = Utc::now();
        assert!(at >= before + TimeDelta::seconds(10));
        assert!(at <= after + TimeDelta::seconds(12));
        assert!(expiration_at(None, Duration::from_secs(2)).is_none());
    }
}
