//! Key/value store backing the response cache and the rate limiter.
//!
//! The store is the only state shared between requests. It offers per-key
//! TTL and nothing else: no enumeration, no transactions, no compare-and-set.
//! Callers that need a set of keys (the cache index) build it on top with
//! read-modify-write and live with the races.
//!
//! Expired entries read as absent immediately. Both backends also drop them
//! physically on a sweep that runs every [`SWEEP_EVERY_WRITES`] writes, so
//! keys that are never read again (old rate-limit windows, one-off proxy
//! queries) do not pile up.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod fs;
pub mod memory;
pub mod testing;

pub use fs::FsKvStore;
pub use memory::MemoryKvStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt store entry: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A write that is a multiple of this triggers an expiry sweep.
pub const SWEEP_EVERY_WRITES: u64 = 256;

/// Shared handle to a store implementation.
pub type SharedStore = Arc<dyn KvStore>;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a live value. Expired entries read as absent.
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>>;

    /// Write a value. `ttl: None` keeps it until deleted.
    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> StoreResult<()>;

    /// Remove a value. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Physically remove every expired entry and return how many went.
    async fn purge_expired(&self) -> StoreResult<usize>;
}
