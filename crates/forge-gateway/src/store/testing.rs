//! Store doubles for tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{KvStore, StoreError, StoreResult};

/// A store whose every operation fails, for exercising fail-open paths.
#[derive(Debug, Default)]
pub struct FailingKvStore {
    calls: AtomicUsize,
}

impl FailingKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T>(&self) -> StoreResult<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("store is down".to_string()))
    }
}

#[async_trait]
impl KvStore for FailingKvStore {
    async fn get(&self, _key: &str) -> StoreResult<Option<Bytes>> {
        self.fail()
    }

    async fn put(&self, _key: &str, _value: Bytes, _ttl: Option<Duration>) -> StoreResult<()> {
        self.fail()
    }

    async fn delete(&self, _key: &str) -> StoreResult<()> {
        self.fail()
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        self.fail()
    }
}
