//! Gateway error types.
//!
//! Every variant maps to one HTTP status and one stable string code. Response
//! bodies carry the code plus a few whitelisted structured fields; the
//! `Display` text is for logs and never contains a secret.

use actix_web::http::{header, StatusCode};
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("route not found")]
    NotFound,

    #[error("required setting is not configured: {0}")]
    NotConfigured(&'static str),

    #[error("missing or invalid shared secret")]
    Unauthorized,

    #[error("webhook signature verification failed")]
    InvalidSignature,

    #[error("path is not allow-listed: {path}")]
    PathDenied { path: String },

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("rate limit exceeded: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("upstream returned {status}")]
    UpstreamStatus { status: u16 },

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

impl GatewayError {
    /// The stable code placed in the `error` field of the JSON body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::NotConfigured(_) => "not_configured",
            Self::Unauthorized => "unauthorized",
            Self::InvalidSignature => "invalid_signature",
            Self::PathDenied { .. } => "path_denied",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::RateLimited { .. } => "rate_limited",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::BadRequest(_) => "bad_request",
            Self::UpstreamStatus { .. } | Self::Upstream(_) => "upstream_error",
        }
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Unauthorized | Self::InvalidSignature => StatusCode::UNAUTHORIZED,
            Self::PathDenied { .. } => StatusCode::FORBIDDEN,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamStatus { .. } | Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut body = json!({ "error": self.code() });
        let mut builder = HttpResponse::build(self.status_code());

        match self {
            Self::PathDenied { path } => {
                body["path"] = json!(path);
            }
            Self::RateLimited { retry_after_secs } => {
                body["retry_after"] = json!(retry_after_secs);
                builder.insert_header((header::RETRY_AFTER, retry_after_secs.to_string()));
            }
            Self::UpstreamStatus { status } => {
                body["status"] = json!(status);
            }
            _ => {}
        }

        builder.json(body)
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
