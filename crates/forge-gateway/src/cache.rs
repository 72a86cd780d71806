//! Response cache and its invalidation index.
//!
//! Keys are namespaced so one invalidation prefix never reaches another
//! namespace:
//! - `vr:<owner>/<repo>:<ref>` for the `/vr` document snapshot
//! - `proxy:<path>?<query>` for allowlist proxy responses
//!
//! The store cannot enumerate keys, so every cached key is also recorded in a
//! single index entry (`cache:index`, JSON array, no TTL). The index is
//! updated with read-modify-write and no lock. Two overlapping writers can
//! lose an update; the consequence is a key that survives one invalidation
//! sweep and gets swept the next time, or simply expires by TTL.
//!
//! Every operation here fails open: a broken store reads as a miss and
//! writes are dropped. A corrupt index is replaced by an empty one, since
//! keeping it would stop invalidation for good.

use bytes::Bytes;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};

use crate::policy::fail_open;
use crate::store::{SharedStore, StoreError};

pub const INDEX_KEY: &str = "cache:index";
pub const DOCUMENT_NAMESPACE: &str = "vr:";
pub const PROXY_NAMESPACE: &str = "proxy:";

/// Cache key for the `/vr` document of `owner/repo` at `git_ref`.
pub fn document_key(repo_full_name: &str, git_ref: &str) -> String {
    format!("{}{}:{}", DOCUMENT_NAMESPACE, repo_full_name, git_ref)
}

/// Cache key for a proxied GitHub path. An empty query adds nothing.
pub fn proxy_key(path: &str, query: &str) -> String {
    if query.is_empty() {
        format!("{}{}", PROXY_NAMESPACE, path)
    } else {
        format!("{}{}?{}", PROXY_NAMESPACE, path, query)
    }
}

#[derive(Clone)]
pub struct ResponseCache {
    store: SharedStore,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(store: SharedStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        fail_open("cache.get", None, self.store.get(key)).await
    }

    /// Store `value` under `key` and record the key in the index.
    pub async fn put(&self, key: &str, value: Bytes) {
        let stored = fail_open(
            "cache.put",
            false,
            async { self.store.put(key, value, Some(self.ttl)).await.map(|_| true) },
        )
        .await;
        if stored {
            self.index_add(key).await;
        }
    }

    pub async fn delete(&self, key: &str) {
        fail_open("cache.delete", (), self.store.delete(key)).await;
    }

    /// Add `key` to the index unless it is already there.
    pub async fn index_add(&self, key: &str) {
        let Some(mut keys) = self.read_index().await else {
            // Unknown index contents; writing now could drop every other key.
            return;
        };
        if keys.insert(key.to_string()) {
            self.write_index(&keys).await;
        }
    }

    /// Delete every indexed key starting with `prefix` and return how many
    /// matched. An empty prefix matches nothing.
    pub async fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        if prefix.is_empty() {
            warn!("refusing to invalidate with an empty prefix");
            return 0;
        }
        let Some(keys) = self.read_index().await else {
            return 0;
        };

        let (matched, kept): (BTreeSet<String>, BTreeSet<String>) =
            keys.into_iter().partition(|k| k.starts_with(prefix));
        if matched.is_empty() {
            return 0;
        }

        join_all(matched.iter().map(|key| self.delete(key))).await;
        self.write_index(&kept).await;

        debug!(prefix, count = matched.len(), "invalidated cache prefix");
        matched.len()
    }

    /// Current index contents. `None` when the store could not be read.
    async fn read_index(&self) -> Option<BTreeSet<String>> {
        let raw = match self.store.get(INDEX_KEY).await {
            Ok(raw) => raw,
            Err(StoreError::Corrupt(e)) => {
                warn!(error = %e, "cache index is corrupt; starting over");
                return Some(BTreeSet::new());
            }
            Err(e) => {
                warn!(error = %e, "cache index unreadable; skipping index update");
                return None;
            }
        };
        let Some(raw) = raw else {
            return Some(BTreeSet::new());
        };
        match serde_json::from_slice::<BTreeSet<String>>(&raw) {
            Ok(keys) => Some(keys),
            Err(e) => {
                warn!(error = %e, "cache index is not a JSON string array; starting over");
                Some(BTreeSet::new())
            }
        }
    }

    async fn write_index(&self, keys: &BTreeSet<String>) {
        let raw = match serde_json::to_vec(keys) {
            Ok(raw) => Bytes::from(raw),
            Err(e) => {
                warn!(error = %e, "failed to encode cache index");
                return;
            }
        };
        fail_open("cache.index.write", (), self.store.put(INDEX_KEY, raw, None)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::FailingKvStore;
    use crate::store::{FsKvStore, KvStore, MemoryKvStore};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn cache_with(ttl: Duration) -> (ResponseCache, Arc<MemoryKvStore>) {
        let store = Arc::new(MemoryKvStore::new());
        (ResponseCache::new(store.clone(), ttl), store)
    }

    async fn index_of(store: &MemoryKvStore) -> Vec<String> {
        let raw = store.get(INDEX_KEY).await.unwrap().unwrap_or_default();
        if raw.is_empty() {
            return Vec::new();
        }
        serde_json::from_slice(&raw).unwrap()
    }

    #[test]
    fn test_key_shapes() {
        assert_eq!(document_key("acme/widgets", "main"), "vr:acme/widgets:main");
        assert_eq!(
            proxy_key("/repos/acme/widgets/pulls", "state=open"),
            "proxy:/repos/acme/widgets/pulls?state=open"
        );
        assert_eq!(proxy_key("/repos/acme/widgets", ""), "proxy:/repos/acme/widgets");
    }

    #[tokio::test]
    async fn test_round_trip_returns_identical_bytes() {
        let (cache, store) = cache_with(Duration::from_secs(60));
        let body = Bytes::from_static(b"{\"sha\":\"abc\"}");

        cache.put("vr:acme/widgets:main", body.clone()).await;

        assert_eq!(cache.get("vr:acme/widgets:main").await, Some(body));
        assert_eq!(index_of(&store).await, vec!["vr:acme/widgets:main".to_string()]);
    }

    #[tokio::test]
    async fn test_read_after_expiry_is_absent() {
        let (cache, _) = cache_with(Duration::from_millis(30));
        cache.put("proxy:/repos/acme/widgets", Bytes::from_static(b"{}")).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get("proxy:/repos/acme/widgets").await, None);
    }

    #[tokio::test]
    async fn test_invalidation_respects_namespace() {
        let (cache, store) = cache_with(Duration::from_secs(60));
        cache.put("vr:acme/widgets:main", Bytes::from_static(b"a")).await;
        cache.put("vr:acme/widgets-extra:main", Bytes::from_static(b"b")).await;
        cache
            .put("proxy:/repos/acme/widgets/pulls", Bytes::from_static(b"c"))
            .await;

        let removed = cache.invalidate_by_prefix("vr:acme/widgets:").await;

        assert_eq!(removed, 1);
        assert_eq!(cache.get("vr:acme/widgets:main").await, None);
        assert!(cache.get("vr:acme/widgets-extra:main").await.is_some());
        assert!(cache.get("proxy:/repos/acme/widgets/pulls").await.is_some());
        assert_eq!(
            index_of(&store).await,
            vec![
                "proxy:/repos/acme/widgets/pulls".to_string(),
                "vr:acme/widgets-extra:main".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_repeated_invalidation_is_idempotent() {
        let (cache, _) = cache_with(Duration::from_secs(60));
        cache.put("proxy:/repos/acme/widgets", Bytes::from_static(b"a")).await;
        cache
            .put("proxy:/repos/acme/widgets/pulls?page=2", Bytes::from_static(b"b"))
            .await;

        assert_eq!(cache.invalidate_by_prefix("proxy:").await, 2);
        assert_eq!(cache.invalidate_by_prefix("proxy:").await, 0);
        assert_eq!(cache.invalidate_by_prefix("proxy:").await, 0);
    }

    #[tokio::test]
    async fn test_empty_prefix_matches_nothing() {
        let (cache, _) = cache_with(Duration::from_secs(60));
        cache.put("vr:acme/widgets:main", Bytes::from_static(b"a")).await;

        assert_eq!(cache.invalidate_by_prefix("").await, 0);
        assert!(cache.get("vr:acme/widgets:main").await.is_some());
    }

    #[tokio::test]
    async fn test_index_lists_key_once() {
        let (cache, store) = cache_with(Duration::from_secs(60));
        cache.put("vr:acme/widgets:main", Bytes::from_static(b"a")).await;
        cache.put("vr:acme/widgets:main", Bytes::from_static(b"b")).await;

        assert_eq!(index_of(&store).await.len(), 1);
        assert_eq!(
            cache.get("vr:acme/widgets:main").await,
            Some(Bytes::from_static(b"b"))
        );
    }

    #[tokio::test]
    async fn test_corrupt_index_is_replaced() {
        let (cache, store) = cache_with(Duration::from_secs(60));
        store
            .put(INDEX_KEY, Bytes::from_static(b"not json"), None)
            .await
            .unwrap();

        cache.put("vr:acme/widgets:main", Bytes::from_static(b"a")).await;
        assert_eq!(index_of(&store).await, vec!["vr:acme/widgets:main".to_string()]);
    }

    #[tokio::test]
    async fn test_unreadable_index_entry_is_reset() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FsKvStore::open(dir.path()).await.unwrap());
        let cache = ResponseCache::new(store.clone(), Duration::from_secs(60));
        cache.put("vr:acme/widgets:main", Bytes::from_static(b"a")).await;
        std::fs::write(store.entry_path(INDEX_KEY), b"abc").unwrap();
        assert!(matches!(store.get(INDEX_KEY).await, Err(StoreError::Corrupt(_))));

        cache.put("vr:acme/widgets:dev", Bytes::from_static(b"b")).await;
        assert_eq!(cache.invalidate_by_prefix("vr:acme/widgets").await, 1);
        assert_eq!(cache.get("vr:acme/widgets:dev").await, None);

        cache.put("vr:acme/widgets:next", Bytes::from_static(b"c")).await;
        assert_eq!(cache.invalidate_by_prefix("vr:acme/widgets").await, 1);
    }

    #[tokio::test]
    async fn test_broken_store_fails_open() {
        let store = Arc::new(FailingKvStore::new());
        let cache = ResponseCache::new(store.clone(), Duration::from_secs(60));

        cache.put("vr:acme/widgets:main", Bytes::from_static(b"a")).await;
        assert_eq!(cache.get("vr:acme/widgets:main").await, None);
        assert_eq!(cache.invalidate_by_prefix("vr:").await, 0);
        assert!(store.call_count() >= 3);
    }
}
