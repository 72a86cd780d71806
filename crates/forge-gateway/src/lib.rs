//! Forge Gateway - edge gateway between the forge dashboard and its upstreams.
//!
//! The browser never sees a long-lived credential. Everything it needs from
//! GitHub or a completion provider goes through this crate:
//! - `/gh/*` reads are forwarded only when they match a fixed allowlist.
//! - `/vr` serves one repository document, cache-first.
//! - `/webhook/github` verifies the HMAC signature and busts cache prefixes.
//! - `/ai/forge*` streams completions from three providers in one format.
//!
//! Security checks fail closed (see [`access`], [`signature`], [`allowlist`]).
//! Cache and rate-limit bookkeeping fail open (see [`policy`]).

pub mod access;
pub mod allowlist;
pub mod cache;
pub mod config;
pub mod error;
pub mod github;
pub mod policy;
pub mod rate_limit;
pub mod server;
pub mod signature;
pub mod store;
pub mod streaming;
pub mod types;
pub mod webhook;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use server::{build_state, configure, serve, AppState};
