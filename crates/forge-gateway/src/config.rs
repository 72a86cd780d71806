//! Configuration from environment variables and an optional YAML file.
//!
//! Non-secret settings may live in a YAML file named by `FORGE_GATEWAY_CONFIG`:
//!
//! ```yaml
//! github:
//!   owner: "acme"
//!   repo: "widgets"
//! document:
//!   branch: "main"
//!   path: "data/vr.json"
//! allowed_origins:
//!   - "https://dashboard.acme.dev"
//! ```
//!
//! Environment variables always win over the file. Secrets (`GITHUB_TOKEN`,
//! `GITHUB_WEBHOOK_SECRET`, `FORGE_SHARED_SECRET`, provider keys) are read
//! from the environment only and never deserialized from disk.

use anyhow::{bail, Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_PORT: u16 = 8787;
const DEFAULT_GITHUB_API: &str = "https://api.github.com";
const DEFAULT_ANTHROPIC_BASE: &str = "https://api.anthropic.com";
const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com";
const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";
/// One day. Longer windows are not useful and overflow the millisecond math.
const MAX_WINDOW_SECS: u64 = 86_400;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub github: GitHubConfig,
    pub document: DocumentConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub access: AccessConfig,
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub api_base: String,
    pub owner: String,
    pub repo: String,
    pub token: Option<SecretString>,
    pub webhook_secret: Option<SecretString>,
}

/// The single document served by `/vr`.
#[derive(Debug, Clone)]
pub struct DocumentConfig {
    pub branch: String,
    pub path: String,
    pub content_type: String,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    /// When set, cache entries are persisted under this directory.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u64,
    pub window_secs: u64,
}

#[derive(Debug, Clone)]
pub struct AccessConfig {
    pub shared_secret: Option<SecretString>,
    pub allowed_origins: Vec<String>,
    /// Header set by a trusted reverse proxy carrying the client address,
    /// e.g. `x-forwarded-for`. Unset means the TCP peer address is used.
    pub trusted_client_ip_header: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProvidersConfig {
    pub anthropic: ProviderSettings,
    pub openai: ProviderSettings,
    pub n8n: N8nSettings,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub api_key: Option<SecretString>,
    pub model: String,
    pub base_url: String,
}

#[derive(Debug, Clone, Default)]
pub struct N8nSettings {
    pub webhook_url: Option<String>,
    pub api_key: Option<SecretString>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    request_timeout_secs: Option<u64>,
    #[serde(default)]
    github: FileGitHub,
    #[serde(default)]
    document: FileDocument,
    cache_ttl_seconds: Option<u64>,
    cache_dir: Option<PathBuf>,
    rate_limit_max: Option<u64>,
    rate_limit_window_seconds: Option<u64>,
    allowed_origins: Option<Vec<String>>,
    trusted_client_ip_header: Option<String>,
    anthropic_model: Option<String>,
    openai_model: Option<String>,
    max_tokens: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct FileGitHub {
    api_base: Option<String>,
    owner: Option<String>,
    repo: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileDocument {
    branch: Option<String>,
    path: Option<String>,
    content_type: Option<String>,
}

impl GatewayConfig {
    /// Defaults for one target repository with every secret unset.
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            request_timeout_secs: 120,
            github: GitHubConfig {
                api_base: DEFAULT_GITHUB_API.to_string(),
                owner: owner.into(),
                repo: repo.into(),
                token: None,
                webhook_secret: None,
            },
            document: DocumentConfig {
                branch: "main".to_string(),
                path: "vr.json".to_string(),
                content_type: "application/json".to_string(),
            },
            cache: CacheConfig {
                ttl_secs: 300,
                dir: None,
            },
            rate_limit: RateLimitConfig {
                max_requests: 20,
                window_secs: 60,
            },
            access: AccessConfig {
                shared_secret: None,
                allowed_origins: Vec::new(),
                trusted_client_ip_header: None,
            },
            providers: ProvidersConfig {
                anthropic: ProviderSettings {
                    api_key: None,
                    model: DEFAULT_ANTHROPIC_MODEL.to_string(),
                    base_url: DEFAULT_ANTHROPIC_BASE.to_string(),
                },
                openai: ProviderSettings {
                    api_key: None,
                    model: DEFAULT_OPENAI_MODEL.to_string(),
                    base_url: DEFAULT_OPENAI_BASE.to_string(),
                },
                n8n: N8nSettings::default(),
                max_tokens: 2048,
            },
        }
    }

    /// Load from the process environment, layered over the YAML file named by
    /// `FORGE_GATEWAY_CONFIG` when that variable is set.
    pub fn load() -> Result<Self> {
        let file = match env::var("FORGE_GATEWAY_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Some(PathBuf::from(path)),
            _ => None,
        };
        Self::resolve(file.as_deref(), |key| env::var(key).ok())
    }

    /// Resolve configuration from an optional YAML file and a variable lookup.
    ///
    /// The lookup is injected so tests never have to touch the process
    /// environment.
    pub fn resolve(
        file: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let file_config = match file {
            Some(path) => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read gateway config from {:?}", path))?;
                serde_yaml_ng::from_str::<FileConfig>(&content)
                    .with_context(|| "Failed to parse gateway config")?
            }
            None => FileConfig::default(),
        };

        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secret = |key: &str| var(key).map(SecretString::from);

        let owner = var("GITHUB_OWNER").or(file_config.github.owner);
        let repo = var("GITHUB_REPO").or(file_config.github.repo);
        let (Some(owner), Some(repo)) = (owner, repo) else {
            bail!("GITHUB_OWNER and GITHUB_REPO must both be configured");
        };
        if !is_repo_segment(&owner) || !is_repo_segment(&repo) {
            bail!("GITHUB_OWNER and GITHUB_REPO must be plain path segments");
        }

        let mut config = Self::new(owner, repo);

        if let Some(host) = var("HOST").or(file_config.host) {
            config.host = host;
        }
        config.port = parse_var(&var, "PORT")?
            .or(file_config.port)
            .unwrap_or(config.port);
        config.request_timeout_secs = parse_var(&var, "REQUEST_TIMEOUT_SECS")?
            .or(file_config.request_timeout_secs)
            .unwrap_or(config.request_timeout_secs);

        if let Some(base) = var("GITHUB_API_BASE").or(file_config.github.api_base) {
            config.github.api_base = base;
        }
        config.github.token = secret("GITHUB_TOKEN");
        config.github.webhook_secret = secret("GITHUB_WEBHOOK_SECRET");

        if let Some(branch) = var("VR_BRANCH").or(file_config.document.branch) {
            config.document.branch = branch;
        }
        if let Some(path) = var("VR_PATH").or(file_config.document.path) {
            config.document.path = path.trim_start_matches('/').to_string();
        }
        if let Some(ct) = var("VR_CONTENT_TYPE").or(file_config.document.content_type) {
            config.document.content_type = ct;
        }

        config.cache.ttl_secs = parse_var(&var, "CACHE_TTL_SECONDS")?
            .or(file_config.cache_ttl_seconds)
            .unwrap_or(config.cache.ttl_secs);
        config.cache.dir = var("CACHE_DIR").map(PathBuf::from).or(file_config.cache_dir);

        config.rate_limit.max_requests = parse_var(&var, "RATE_LIMIT_MAX")?
            .or(file_config.rate_limit_max)
            .unwrap_or(config.rate_limit.max_requests);
        config.rate_limit.window_secs = parse_var(&var, "RATE_LIMIT_WINDOW_SECONDS")?
            .or(file_config.rate_limit_window_seconds)
            .unwrap_or(config.rate_limit.window_secs);
        if !(1..=MAX_WINDOW_SECS).contains(&config.rate_limit.window_secs) {
            bail!(
                "RATE_LIMIT_WINDOW_SECONDS must be between 1 and {}",
                MAX_WINDOW_SECS
            );
        }

        config.access.shared_secret = secret("FORGE_SHARED_SECRET");
        config.access.allowed_origins = match var("ALLOWED_ORIGINS") {
            Some(raw) => parse_origins(&raw),
            None => file_config.allowed_origins.unwrap_or_default(),
        };
        config.access.trusted_client_ip_header = var("TRUSTED_CLIENT_IP_HEADER")
            .or(file_config.trusted_client_ip_header)
            .map(|h| h.trim().to_ascii_lowercase());

        let anthropic = &mut config.providers.anthropic;
        anthropic.api_key = secret("ANTHROPIC_API_KEY");
        if let Some(model) = var("ANTHROPIC_MODEL").or(file_config.anthropic_model) {
            anthropic.model = model;
        }
        if let Some(base) = var("ANTHROPIC_BASE_URL") {
            anthropic.base_url = base;
        }

        let openai = &mut config.providers.openai;
        openai.api_key = secret("OPENAI_API_KEY");
        if let Some(model) = var("OPENAI_MODEL").or(file_config.openai_model) {
            openai.model = model;
        }
        if let Some(base) = var("OPENAI_BASE_URL") {
            openai.base_url = base;
        }

        config.providers.n8n = N8nSettings {
            webhook_url: var("N8N_WEBHOOK_URL"),
            api_key: secret("N8N_API_KEY"),
        };
        config.providers.max_tokens = parse_var(&var, "FORGE_MAX_TOKENS")?
            .or(file_config.max_tokens)
            .unwrap_or(config.providers.max_tokens);

        Ok(config)
    }

    /// `owner/repo` of the target repository.
    pub fn repo_full_name(&self) -> String {
        format!("{}/{}", self.github.owner, self.github.repo)
    }

    pub fn github_api_base_trimmed(&self) -> String {
        self.github.api_base.trim_end_matches('/').to_string()
    }
}

impl ProviderSettings {
    pub fn base_url_trimmed(&self) -> String {
        self.base_url.trim_end_matches('/').to_string()
    }
}

/// Split a comma-separated origin list, dropping blanks. Entries are kept
/// verbatim apart from surrounding whitespace; matching is exact.
pub fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_var<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} is not a valid value: {:?}", key, raw)),
        None => Ok(None),
    }
}

fn is_repo_segment(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_with_required_repo() {
        let config =
            GatewayConfig::resolve(None, lookup(&[("GITHUB_OWNER", "acme"), ("GITHUB_REPO", "widgets")]))
                .unwrap();

        assert_eq!(config.port, 8787);
        assert_eq!(config.repo_full_name(), "acme/widgets");
        assert_eq!(config.cache.ttl_secs, 300);
        assert_eq!(config.rate_limit.max_requests, 20);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert!(config.access.shared_secret.is_none());
        assert!(config.access.allowed_origins.is_empty());
        assert!(config.github.token.is_none());
    }

    #[test]
    fn test_missing_repo_is_an_error() {
        assert!(GatewayConfig::resolve(None, lookup(&[("GITHUB_OWNER", "acme")])).is_err());
        assert!(GatewayConfig::resolve(
            None,
            lookup(&[("GITHUB_OWNER", "acme"), ("GITHUB_REPO", "../etc")])
        )
        .is_err());
    }

    #[test]
    fn test_env_values_and_secrets() {
        let config = GatewayConfig::resolve(
            None,
            lookup(&[
                ("GITHUB_OWNER", "acme"),
                ("GITHUB_REPO", "widgets"),
                ("GITHUB_TOKEN", "ghp_test"),
                ("FORGE_SHARED_SECRET", "s3cret"),
                ("ALLOWED_ORIGINS", " https://a.dev, ,https://b.dev "),
                ("CACHE_TTL_SECONDS", "42"),
                ("OPENAI_MODEL", "gpt-4.1"),
            ]),
        )
        .unwrap();

        assert_eq!(config.github.token.as_ref().unwrap().expose_secret(), "ghp_test");
        assert_eq!(
            config.access.shared_secret.as_ref().unwrap().expose_secret(),
            "s3cret"
        );
        assert_eq!(
            config.access.allowed_origins,
            vec!["https://a.dev".to_string(), "https://b.dev".to_string()]
        );
        assert_eq!(config.cache.ttl_secs, 42);
        assert_eq!(config.providers.openai.model, "gpt-4.1");
    }

    #[test]
    fn test_blank_secret_counts_as_unset() {
        let config = GatewayConfig::resolve(
            None,
            lookup(&[
                ("GITHUB_OWNER", "acme"),
                ("GITHUB_REPO", "widgets"),
                ("FORGE_SHARED_SECRET", "   "),
            ]),
        )
        .unwrap();
        assert!(config.access.shared_secret.is_none());
    }

    #[test]
    fn test_invalid_number_is_an_error() {
        let result = GatewayConfig::resolve(
            None,
            lookup(&[
                ("GITHUB_OWNER", "acme"),
                ("GITHUB_REPO", "widgets"),
                ("RATE_LIMIT_MAX", "lots"),
            ]),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_window_is_bounded() {
        for window in ["0", "86401", "18446744073709551615"] {
            let result = GatewayConfig::resolve(
                None,
                lookup(&[
                    ("GITHUB_OWNER", "acme"),
                    ("GITHUB_REPO", "widgets"),
                    ("RATE_LIMIT_WINDOW_SECONDS", window),
                ]),
            );
            assert!(result.is_err(), "window {} accepted", window);
        }
    }

    #[test]
    fn test_trusted_client_ip_header_is_opt_in() {
        let base = [("GITHUB_OWNER", "acme"), ("GITHUB_REPO", "widgets")];
        let config = GatewayConfig::resolve(None, lookup(&base)).unwrap();
        assert!(config.access.trusted_client_ip_header.is_none());

        let mut vars = base.to_vec();
        vars.push(("TRUSTED_CLIENT_IP_HEADER", " X-Forwarded-For "));
        let config = GatewayConfig::resolve(None, lookup(&vars)).unwrap();
        assert_eq!(
            config.access.trusted_client_ip_header.as_deref(),
            Some("x-forwarded-for")
        );
    }

    #[test]
    fn test_yaml_file_with_env_override() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("forge-gateway.yml");
        fs::write(
            &path,
            r#"
port: 9000
github:
  owner: "acme"
  repo: "widgets"
document:
  branch: "release"
  path: "/data/vr.json"
allowed_origins:
  - "https://dashboard.acme.dev"
cache_ttl_seconds: 60
"#,
        )
        .unwrap();

        let config =
            GatewayConfig::resolve(Some(&path), lookup(&[("CACHE_TTL_SECONDS", "10")])).unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.repo_full_name(), "acme/widgets");
        assert_eq!(config.document.branch, "release");
        assert_eq!(config.document.path, "data/vr.json");
        assert_eq!(
            config.access.allowed_origins,
            vec!["https://dashboard.acme.dev".to_string()]
        );
        assert_eq!(config.cache.ttl_secs, 10);
    }
}
