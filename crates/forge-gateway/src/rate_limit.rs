//! Fixed-window rate limiter on top of the key/value store.
//!
//! Counter key: `rl:<group>:<caller>:<window>` with
//! `window = floor(now_ms / window_ms)`. A new window always starts a new key
//! at zero, and old keys expire after two windows.
//!
//! The read and the increment are separate store calls, so concurrent
//! requests can undercount. A burst straddling a window boundary can also see
//! up to twice the limit in a short span. Both are accepted: the goal is
//! bounded abuse resistance, not exact accounting.

use bytes::Bytes;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::policy::fail_open;
use crate::store::SharedStore;

/// Route groups with independent budgets.
pub const GROUP_DISPATCH: &str = "dispatch";
pub const GROUP_AI: &str = "ai";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u64 },
    Denied { retry_after_secs: u64 },
}

#[derive(Clone)]
pub struct RateLimiter {
    store: SharedStore,
    limit: u64,
    window_secs: u64,
}

impl RateLimiter {
    pub fn new(store: SharedStore, config: &RateLimitConfig) -> Self {
        Self {
            store,
            limit: config.max_requests,
            window_secs: config.window_secs.max(1),
        }
    }

    pub async fn check(&self, caller: &str, group: &str) -> RateDecision {
        self.check_at(caller, group, unix_millis()).await
    }

    /// Same as [`check`](Self::check) with an explicit clock reading.
    pub async fn check_at(&self, caller: &str, group: &str, now_ms: u64) -> RateDecision {
        let window = now_ms / self.window_secs.saturating_mul(1000);
        let key = counter_key(group, caller, window);

        let count = fail_open("rate_limit.read", None, self.store.get(&key))
            .await
            .and_then(|raw| parse_count(&raw))
            .unwrap_or(0);

        if count >= self.limit {
            debug!(group, count, limit = self.limit, "rate limit exceeded");
            return RateDecision::Denied {
                retry_after_secs: self.window_secs,
            };
        }

        let next = count + 1;
        fail_open(
            "rate_limit.increment",
            (),
            self.store.put(
                &key,
                Bytes::from(next.to_string()),
                Some(Duration::from_secs(self.window_secs.saturating_mul(2))),
            ),
        )
        .await;

        RateDecision::Allowed {
            remaining: self.limit - next,
        }
    }
}

pub fn counter_key(group: &str, caller: &str, window: u64) -> String {
    format!("rl:{}:{}:{}", group, caller, window)
}

fn parse_count(raw: &[u8]) -> Option<u64> {
    std::str::from_utf8(raw).ok()?.trim().parse().ok()
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
