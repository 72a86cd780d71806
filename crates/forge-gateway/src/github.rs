//! Outbound GitHub REST client.
//!
//! This is the only place the server-held token is attached to a request.
//! Callers hand in repository-relative paths; the token never flows back out
//! in a response or a log line.

use bytes::Bytes;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::config::{DocumentConfig, GatewayConfig};
use crate::error::{GatewayError, GatewayResult};

pub const ACCEPT_JSON: &str = "application/vnd.github+json";
pub const ACCEPT_RAW: &str = "application/vnd.github.raw";
const API_VERSION: &str = "2022-11-28";
const AGENT: &str = concat!("forge-gateway/", env!("CARGO_PKG_VERSION"));

/// A fully-read upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    owner: String,
    repo: String,
    token: Option<SecretString>,
}

impl GitHubClient {
    pub fn new(http: reqwest::Client, config: &GatewayConfig) -> Self {
        Self {
            http,
            api_base: config.github_api_base_trimmed(),
            owner: config.github.owner.clone(),
            repo: config.github.repo.clone(),
            token: config.github.token.clone(),
        }
    }

    pub fn repo_path(&self) -> String {
        format!("/repos/{}/{}", self.owner, self.repo)
    }

    fn request(&self, method: Method, path_and_query: &str, accept: &str) -> RequestBuilder {
        let url = format!("{}{}", self.api_base, path_and_query);
        let mut builder = self
            .http
            .request(method, url)
            .header(ACCEPT, accept)
            .header(USER_AGENT, AGENT)
            .header("x-github-api-version", API_VERSION);
        if let Some(token) = &self.token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token.expose_secret()));
        }
        builder
    }

    /// `GET` or `HEAD` a path, reading the whole body.
    pub async fn read(
        &self,
        method: Method,
        path: &str,
        query: &str,
        accept: &str,
    ) -> GatewayResult<UpstreamResponse> {
        let path_and_query = if query.is_empty() {
            path.to_string()
        } else {
            format!("{}?{}", path, query)
        };
        debug!(%method, path, "forwarding to GitHub");

        let upstream = self
            .request(method, &path_and_query, accept)
            .send()
            .await
            .map_err(|e| upstream_failure("GitHub request failed", e))?;

        let status = upstream.status().as_u16();
        let content_type = upstream
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = upstream
            .bytes()
            .await
            .map_err(|e| upstream_failure("failed to read GitHub response", e))?;

        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }

    /// Raw contents of the configured document at the configured branch.
    pub async fn fetch_document(&self, doc: &DocumentConfig) -> GatewayResult<UpstreamResponse> {
        let path = format!("{}/contents/{}", self.repo_path(), doc.path);
        let query = format!("ref={}", doc.branch);
        self.read(Method::GET, &path, &query, ACCEPT_RAW).await
    }

    /// Fire a `repository_dispatch` event. Repeating it simply re-triggers.
    pub async fn dispatch(&self, event_type: &str, client_payload: Value) -> GatewayResult<()> {
        if self.token.is_none() {
            return Err(GatewayError::NotConfigured("GITHUB_TOKEN"));
        }
        let path = format!("{}/dispatches", self.repo_path());
        let upstream = self
            .request(Method::POST, &path, ACCEPT_JSON)
            .json(&json!({
                "event_type": event_type,
                "client_payload": client_payload,
            }))
            .send()
            .await
            .map_err(|e| upstream_failure("GitHub dispatch failed", e))?;

        let status = upstream.status();
        if !status.is_success() {
            error!(%status, event_type, "GitHub dispatch rejected");
            return Err(GatewayError::UpstreamStatus {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

/// Log a transport failure and wrap it. The URL is stripped first so query
/// strings never reach the log.
pub(crate) fn upstream_failure(message: &'static str, e: reqwest::Error) -> GatewayError {
    let e = e.without_url();
    error!(error = %e, "{}", message);
    GatewayError::Upstream(e)
}
