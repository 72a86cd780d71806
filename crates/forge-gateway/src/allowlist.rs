//! Allowlist proxy for read-only GitHub API access.
//!
//! Only a handful of path shapes under the one configured repository are
//! forwarded. Everything else is denied before any upstream call is made.

use bytes::Bytes;
use reqwest::Method;
use tracing::debug;

use crate::cache::{proxy_key, ResponseCache};
use crate::error::{GatewayError, GatewayResult};
use crate::github::{GitHubClient, ACCEPT_JSON};

/// Subtrees of `/repos/<owner>/<repo>` that may be read.
const ALLOWED_SUBTREES: &[&str] = &["contents", "pulls", "commits", "actions/runs"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_header_value(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub cache: CacheStatus,
}

/// Path rules for one owner/repo, computed once at startup.
#[derive(Debug, Clone)]
pub struct Allowlist {
    exact: String,
    prefixes: Vec<String>,
}

impl Allowlist {
    pub fn for_repo(owner: &str, repo: &str) -> Self {
        let exact = format!("/repos/{}/{}", owner, repo);
        let prefixes = ALLOWED_SUBTREES
            .iter()
            .map(|subtree| format!("{}/{}", exact, subtree))
            .collect();
        Self { exact, prefixes }
    }

    /// Whether `path` (no query string) may be forwarded.
    pub fn permits(&self, path: &str) -> bool {
        if !is_clean_path(path) {
            return false;
        }
        if path == self.exact {
            return true;
        }
        self.prefixes.iter().any(|prefix| {
            path.strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
        })
    }
}

/// Reject traversal and encoded separators so prefix matching means what it
/// says.
fn is_clean_path(path: &str) -> bool {
    if !path.starts_with('/') || path.contains("//") || path.contains('\\') {
        return false;
    }
    let lowered = path.to_ascii_lowercase();
    if ["%2e", "%2f", "%5c", "%00"]
        .iter()
        .any(|encoded| lowered.contains(encoded))
    {
        return false;
    }
    !path.split('/').any(|segment| segment == "." || segment == "..")
}

#[derive(Clone)]
pub struct AllowlistProxy {
    rules: Allowlist,
    github: GitHubClient,
    cache: ResponseCache,
}

impl AllowlistProxy {
    pub fn new(rules: Allowlist, github: GitHubClient, cache: ResponseCache) -> Self {
        Self {
            rules,
            github,
            cache,
        }
    }

    pub fn rules(&self) -> &Allowlist {
        &self.rules
    }

    pub async fn forward(
        &self,
        method: &Method,
        path: &str,
        query: &str,
    ) -> GatewayResult<ProxyResponse> {
        if method != Method::GET && method != Method::HEAD {
            return Err(GatewayError::MethodNotAllowed);
        }
        if !self.rules.permits(path) {
            debug!(path, "proxy path denied");
            return Err(GatewayError::PathDenied {
                path: path.to_string(),
            });
        }

        if method == Method::HEAD {
            let upstream = self.github.read(Method::HEAD, path, query, ACCEPT_JSON).await?;
            return Ok(ProxyResponse {
                status: upstream.status,
                content_type: upstream.content_type,
                body: Bytes::new(),
                cache: CacheStatus::Miss,
            });
        }

        let key = proxy_key(path, query);
        if let Some(body) = self.cache.get(&key).await {
            return Ok(ProxyResponse {
                status: 200,
                content_type: Some("application/json; charset=utf-8".to_string()),
                body,
                cache: CacheStatus::Hit,
            });
        }

        let upstream = self.github.read(Method::GET, path, query, ACCEPT_JSON).await?;
        if upstream.is_success() {
            self.cache.put(&key, upstream.body.clone()).await;
        }

        Ok(ProxyResponse {
            status: upstream.status,
            content_type: upstream.content_type,
            body: upstream.body,
            cache: CacheStatus::Miss,
        })
    }
}
