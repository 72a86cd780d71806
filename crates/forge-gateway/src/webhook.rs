//! GitHub webhook receiver.
//!
//! Order of checks: body size, secret configured, signature, JSON. Only after
//! all four pass is any cache entry touched.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;
use std::fmt::Display;
use tracing::{debug, info, warn};

use crate::cache::{ResponseCache, DOCUMENT_NAMESPACE, PROXY_NAMESPACE};
use crate::error::{GatewayError, GatewayResult};
use crate::signature;

/// Largest webhook body accepted.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

pub const EVENT_HEADER: &str = "x-github-event";

/// Cache prefixes made stale by `event` on repository `full_name`.
pub fn invalidation_prefixes(event: &str, full_name: &str) -> Vec<String> {
    match event {
        "push" | "create" | "delete" | "release" => vec![
            format!("{}{}", DOCUMENT_NAMESPACE, full_name),
            format!("{}/repos/{}", PROXY_NAMESPACE, full_name),
        ],
        "pull_request" | "pull_request_review" => {
            vec![format!("{}/repos/{}/pulls", PROXY_NAMESPACE, full_name)]
        }
        "workflow_run" | "workflow_job" | "check_suite" => {
            vec![format!("{}/repos/{}/actions/runs", PROXY_NAMESPACE, full_name)]
        }
        _ => Vec::new(),
    }
}

/// Read a request body, refusing anything over `limit` bytes.
///
/// A declared `Content-Length` over the limit is refused before reading. The
/// running total is checked on every chunk as well, since the header can be
/// absent or wrong.
pub async fn read_capped<S, E>(
    body: S,
    declared_len: Option<usize>,
    limit: usize,
) -> GatewayResult<Bytes>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    if declared_len.is_some_and(|len| len > limit) {
        return Err(GatewayError::PayloadTooLarge { limit });
    }

    let mut body = Box::pin(body);
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk =
            chunk.map_err(|e| GatewayError::BadRequest(format!("failed to read body: {}", e)))?;
        if buf.len() + chunk.len() > limit {
            return Err(GatewayError::PayloadTooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// `repository.full_name` from a webhook payload, if the event has one.
pub fn repository_full_name(payload: &Value) -> Option<&str> {
    payload
        .get("repository")
        .and_then(|r| r.get("full_name"))
        .and_then(Value::as_str)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookOutcome {
    pub ok: bool,
    pub event: String,
    pub repo: Option<String>,
    pub invalidated: usize,
}

#[derive(Clone)]
pub struct WebhookReceiver {
    secret: Option<SecretString>,
    cache: ResponseCache,
}

impl WebhookReceiver {
    pub fn new(secret: Option<SecretString>, cache: ResponseCache) -> Self {
        Self { secret, cache }
    }

    /// Verify and apply one delivery whose body has already been read.
    pub async fn receive(
        &self,
        event: Option<&str>,
        signature_header: Option<&str>,
        body: &[u8],
    ) -> GatewayResult<WebhookOutcome> {
        let Some(secret) = &self.secret else {
            warn!("webhook received but GITHUB_WEBHOOK_SECRET is not set");
            return Err(GatewayError::NotConfigured("GITHUB_WEBHOOK_SECRET"));
        };
        if !signature::verify(secret.expose_secret(), body, signature_header) {
            warn!(event, "webhook signature rejected");
            return Err(GatewayError::InvalidSignature);
        }

        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| GatewayError::BadRequest(format!("webhook body is not JSON: {}", e)))?;
        let event = event
            .ok_or_else(|| GatewayError::BadRequest("missing X-GitHub-Event header".into()))?;
        let repo = repository_full_name(&payload).map(str::to_string);

        let mut invalidated = 0;
        if let Some(full_name) = &repo {
            // Sequential: each sweep rewrites the shared index.
            for prefix in invalidation_prefixes(event, full_name) {
                invalidated += self.cache.invalidate_by_prefix(&prefix).await;
            }
        } else {
            debug!(event, "webhook payload has no repository");
        }

        info!(event, repo = ?repo, invalidated, "webhook applied");
        Ok(WebhookOutcome {
            ok: true,
            event: event.to_string(),
            repo,
            invalidated,
        })
    }
}
