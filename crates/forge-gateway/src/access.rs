//! Access gate for mutating and expensive routes.
//!
//! Both checks are fail-closed:
//! - The shared-secret header must equal the configured secret. If no secret
//!   is configured at all, every protected request is refused.
//! - CORS headers are emitted only for an `Origin` that exactly matches an
//!   allow-list entry. An empty allow-list permits no origin.

use actix_web::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use actix_web::HttpRequest;
use secrecy::{ExposeSecret, SecretString};

use crate::config::AccessConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::signature::constant_time_eq;

pub const SHARED_SECRET_HEADER: &str = "x-forge-secret";

const ALLOW_METHODS: &str = "GET, HEAD, POST, OPTIONS";
const ALLOW_HEADERS: &str = "content-type, x-forge-secret";
const EXPOSE_HEADERS: &str = "x-cache, retry-after";
const MAX_AGE_SECS: &str = "86400";

#[derive(Debug, Clone)]
pub struct AccessGate {
    shared_secret: Option<SecretString>,
    allowed_origins: Vec<String>,
    trusted_client_ip_header: Option<HeaderName>,
}

impl AccessGate {
    pub fn new(config: &AccessConfig) -> Self {
        Self {
            shared_secret: config.shared_secret.clone(),
            allowed_origins: config.allowed_origins.clone(),
            trusted_client_ip_header: config
                .trusted_client_ip_header
                .as_deref()
                .and_then(|h| HeaderName::from_bytes(h.as_bytes()).ok()),
        }
    }

    pub fn check_shared_secret(&self, headers: &HeaderMap) -> GatewayResult<()> {
        let Some(expected) = &self.shared_secret else {
            return Err(GatewayError::NotConfigured("FORGE_SHARED_SECRET"));
        };
        let provided = headers
            .get(SHARED_SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(GatewayError::Unauthorized)?;

        if constant_time_eq(provided.as_bytes(), expected.expose_secret().as_bytes()) {
            Ok(())
        } else {
            Err(GatewayError::Unauthorized)
        }
    }

    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|o| o == origin)
    }

    /// CORS response headers for a request carrying `origin`.
    ///
    /// Empty unless the origin is allow-listed; the browser then blocks the
    /// response on its side.
    pub fn cors_headers(&self, origin: Option<&str>) -> Vec<(HeaderName, HeaderValue)> {
        let Some(origin) = origin.filter(|o| self.is_origin_allowed(o)) else {
            return Vec::new();
        };
        let Ok(origin_value) = HeaderValue::from_str(origin) else {
            return Vec::new();
        };

        vec![
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, origin_value),
            (header::VARY, HeaderValue::from_static("Origin")),
            (
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static(ALLOW_METHODS),
            ),
            (
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static(ALLOW_HEADERS),
            ),
            (
                header::ACCESS_CONTROL_EXPOSE_HEADERS,
                HeaderValue::from_static(EXPOSE_HEADERS),
            ),
            (
                header::ACCESS_CONTROL_MAX_AGE,
                HeaderValue::from_static(MAX_AGE_SECS),
            ),
        ]
    }
}

impl AccessGate {
    /// Identity used for rate limiting.
    ///
    /// The TCP peer address, unless a trusted proxy header is configured, in
    /// which case its first (client-most) entry is used. Client-supplied
    /// forwarding headers are ignored otherwise.
    pub fn caller_identity(&self, req: &HttpRequest) -> String {
        let forwarded = self.trusted_client_ip_header.as_ref().and_then(|name| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        });
        if let Some(client) = forwarded {
            return client.to_string();
        }
        req.peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "anonymous".to_string())
    }
}
