//! Failure policies.
//!
//! Two classes of check live in this crate and they must not be mixed:
//!
//! - **Fail closed** (security): shared secret, CORS origin, webhook
//!   signature, proxy allowlist. These return `Result<_, GatewayError>` or
//!   `bool` and have no fallback path. See [`crate::access`],
//!   [`crate::signature`] and [`crate::allowlist`].
//! - **Fail open** (availability): cache reads and writes, the cache index,
//!   rate-limit counters. A broken store must not take the gateway down, so
//!   these go through [`fail_open`], which logs and substitutes a fallback.

use std::fmt::Display;
use std::future::Future;
use tracing::warn;

/// Await `op`, returning `fallback` if it fails.
///
/// Only availability helpers may call this. Never route a security check
/// through here.
pub async fn fail_open<T, E, F>(what: &'static str, fallback: T, op: F) -> T
where
    E: Display,
    F: Future<Output = Result<T, E>>,
{
    match op.await {
        Ok(value) => value,
        Err(e) => {
            warn!(operation = what, error = %e, "store operation failed; continuing without it");
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fail_open_substitutes_fallback() {
        let ok: u64 = fail_open("read", 0, async { Ok::<_, String>(7) }).await;
        assert_eq!(ok, 7);

        let failed: u64 = fail_open("read", 0, async { Err::<u64, _>("down".to_string()) }).await;
        assert_eq!(failed, 0);
    }
}
