//! Actix Web HTTP server.
//!
//! Routes:
//! - `GET /healthz`
//! - `GET /vr`
//! - `POST /dispatch/run-engine`
//! - `GET|HEAD /gh/{tail}`
//! - `POST /webhook/github`
//! - `POST /ai/forge`, `/ai/forge/gpt`, `/ai/forge/n8n`
//!
//! Every handler ends in [`finish`], which renders errors and attaches the
//! CORS headers for the request's `Origin`.

use actix_web::http::header::{self, HeaderMap};
use actix_web::http::{Method, StatusCode};
use actix_web::{web, HttpRequest, HttpResponse, HttpServer, ResponseError};
use anyhow::{Context, Result};
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::access::AccessGate;
use crate::allowlist::{Allowlist, AllowlistProxy, CacheStatus};
use crate::cache::{document_key, ResponseCache};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::github::GitHubClient;
use crate::rate_limit::{RateDecision, RateLimiter, GROUP_AI, GROUP_DISPATCH};
use crate::signature::SIGNATURE_HEADER;
use crate::store::{FsKvStore, MemoryKvStore, SharedStore};
use crate::streaming::{CompletionClient, Provider};
use crate::types::ForgeRequest;
use crate::webhook::{self, WebhookReceiver, EVENT_HEADER};

/// Cap on JSON bodies for dispatch and completion requests.
const MAX_JSON_BODY_BYTES: usize = 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISPATCH_EVENT: &str = "run-engine";

pub struct AppState {
    pub config: GatewayConfig,
    pub gate: AccessGate,
    pub limiter: RateLimiter,
    pub cache: ResponseCache,
    pub github: GitHubClient,
    pub proxy: AllowlistProxy,
    pub webhooks: WebhookReceiver,
    pub completions: CompletionClient,
}

impl AppState {
    /// Wire every component over one store and one outbound HTTP client.
    pub fn new(config: GatewayConfig, store: SharedStore) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build reqwest client")?;

        let cache = ResponseCache::new(store.clone(), Duration::from_secs(config.cache.ttl_secs));
        let limiter = RateLimiter::new(store, &config.rate_limit);
        let github = GitHubClient::new(http.clone(), &config);
        let proxy = AllowlistProxy::new(
            Allowlist::for_repo(&config.github.owner, &config.github.repo),
            github.clone(),
            cache.clone(),
        );
        let webhooks = WebhookReceiver::new(config.github.webhook_secret.clone(), cache.clone());
        let completions = CompletionClient::new(http, config.providers.clone());

        Ok(Self {
            gate: AccessGate::new(&config.access),
            limiter,
            cache,
            github,
            proxy,
            webhooks,
            completions,
            config,
        })
    }
}

/// Build shared state, opening the durable store when `CACHE_DIR` is set.
pub async fn build_state(config: GatewayConfig) -> Result<web::Data<AppState>> {
    let store: SharedStore = match &config.cache.dir {
        Some(dir) => {
            let fs = FsKvStore::open(dir.clone())
                .await
                .with_context(|| format!("failed to open cache dir {}", dir.display()))?;
            info!(dir = %dir.display(), "using durable cache store");
            Arc::new(fs)
        }
        None => {
            info!("using in-memory cache store");
            Arc::new(MemoryKvStore::new())
        }
    };
    Ok(web::Data::new(AppState::new(config, store)?))
}

/// Register every route on an app. State must already be in `app_data`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/healthz", web::route().to(healthz))
        .route("/vr", web::route().to(document))
        .route("/dispatch/run-engine", web::route().to(dispatch))
        .route("/gh/{tail:.*}", web::route().to(github_proxy))
        .route("/webhook/github", web::route().to(github_webhook))
        .route("/ai/forge", web::route().to(forge_anthropic))
        .route("/ai/forge/gpt", web::route().to(forge_openai))
        .route("/ai/forge/n8n", web::route().to(forge_n8n))
        .default_service(web::to(fallback));
}

pub async fn serve(config: GatewayConfig) -> Result<()> {
    let addr = (config.host.clone(), config.port);
    info!(
        host = %addr.0,
        port = addr.1,
        repo = %config.repo_full_name(),
        "forge-gateway listening"
    );

    let state = build_state(config).await?;

    HttpServer::new(move || {
        actix_web::App::new()
            .app_data(state.clone())
            .configure(configure)
    })
    .bind(addr.clone())
    .with_context(|| format!("failed to bind {}:{}", addr.0, addr.1))?
    .run()
    .await
    .context("server error")?;

    Ok(())
}

/// Render the result and attach CORS headers for the request's origin.
fn finish(
    state: &AppState,
    req: &HttpRequest,
    result: GatewayResult<HttpResponse>,
) -> HttpResponse {
    let mut response = match result {
        Ok(response) => response,
        Err(e) => {
            if e.status_code().is_server_error() {
                warn!(path = req.path(), code = e.code(), error = %e, "request failed");
            } else {
                debug!(path = req.path(), code = e.code(), "request refused");
            }
            e.error_response()
        }
    };

    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok());
    let headers = response.headers_mut();
    for (name, value) in state.gate.cors_headers(origin) {
        headers.insert(name, value);
    }
    response
}

fn preflight() -> HttpResponse {
    HttpResponse::NoContent().finish()
}

fn require_method(req: &HttpRequest, method: Method) -> GatewayResult<()> {
    if req.method() == method {
        Ok(())
    } else {
        Err(GatewayError::MethodNotAllowed)
    }
}

async fn enforce_rate_limit(
    state: &AppState,
    req: &HttpRequest,
    group: &str,
) -> GatewayResult<()> {
    let caller = state.gate.caller_identity(req);
    match state.limiter.check(&caller, group).await {
        RateDecision::Allowed { .. } => Ok(()),
        RateDecision::Denied { retry_after_secs } => {
            debug!(caller = %caller, group, retry_after_secs, "rate limited");
            Err(GatewayError::RateLimited { retry_after_secs })
        }
    }
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

async fn read_body(
    req: &HttpRequest,
    payload: web::Payload,
    limit: usize,
) -> GatewayResult<Bytes> {
    webhook::read_capped(payload, declared_length(req.headers()), limit).await
}

async fn healthz(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    if req.method() == Method::OPTIONS {
        return finish(&state, &req, Ok(preflight()));
    }
    let result = require_method(&req, Method::GET).map(|()| {
        HttpResponse::Ok().json(json!({
            "ok": true,
            "ts": chrono::Utc::now().timestamp_millis(),
            "version": env!("CARGO_PKG_VERSION"),
            "repo": state.config.repo_full_name(),
        }))
    });
    finish(&state, &req, result)
}

async fn document(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    if req.method() == Method::OPTIONS {
        return finish(&state, &req, Ok(preflight()));
    }
    let result = serve_document(&state, &req).await;
    finish(&state, &req, result)
}

async fn serve_document(state: &AppState, req: &HttpRequest) -> GatewayResult<HttpResponse> {
    require_method(req, Method::GET)?;
    let doc = &state.config.document;
    let key = document_key(&state.config.repo_full_name(), &doc.branch);

    if let Some(body) = state.cache.get(&key).await {
        return Ok(HttpResponse::Ok()
            .content_type(doc.content_type.as_str())
            .insert_header(("x-cache", CacheStatus::Hit.as_header_value()))
            .body(body));
    }

    let upstream = state.github.fetch_document(doc).await?;
    if !upstream.is_success() {
        return Err(GatewayError::UpstreamStatus {
            status: upstream.status,
        });
    }
    state.cache.put(&key, upstream.body.clone()).await;

    Ok(HttpResponse::Ok()
        .content_type(doc.content_type.as_str())
        .insert_header(("x-cache", CacheStatus::Miss.as_header_value()))
        .body(upstream.body))
}

async fn dispatch(
    state: web::Data<AppState>,
    req: HttpRequest,
    payload: web::Payload,
) -> HttpResponse {
    if req.method() == Method::OPTIONS {
        return finish(&state, &req, Ok(preflight()));
    }
    let result = run_dispatch(&state, &req, payload).await;
    finish(&state, &req, result)
}

async fn run_dispatch(
    state: &AppState,
    req: &HttpRequest,
    payload: web::Payload,
) -> GatewayResult<HttpResponse> {
    require_method(req, Method::POST)?;
    state.gate.check_shared_secret(req.headers())?;
    enforce_rate_limit(state, req, GROUP_DISPATCH).await?;

    let body = read_body(req, payload, MAX_JSON_BODY_BYTES).await?;
    let client_payload: Value = if body.iter().all(u8::is_ascii_whitespace) {
        json!({})
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| GatewayError::BadRequest(format!("invalid JSON body: {}", e)))?
    };

    state.github.dispatch(DISPATCH_EVENT, client_payload).await?;
    info!(event_type = DISPATCH_EVENT, "repository dispatch sent");
    Ok(HttpResponse::Accepted().json(json!({ "ok": true })))
}

async fn github_proxy(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    if req.method() == Method::OPTIONS {
        return finish(&state, &req, Ok(preflight()));
    }
    let result = forward_to_github(&state, &req).await;
    finish(&state, &req, result)
}

async fn forward_to_github(state: &AppState, req: &HttpRequest) -> GatewayResult<HttpResponse> {
    // actix and reqwest sit on different `http` crate versions.
    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .map_err(|_| GatewayError::MethodNotAllowed)?;
    let path = req.uri().path().strip_prefix("/gh").unwrap_or_default();

    let proxied = state.proxy.forward(&method, path, req.query_string()).await?;

    let status = StatusCode::from_u16(proxied.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = HttpResponse::build(status);
    builder.insert_header(("x-cache", proxied.cache.as_header_value()));
    if let Some(content_type) = proxied.content_type {
        builder.content_type(content_type);
    }
    Ok(builder.body(proxied.body))
}

async fn github_webhook(
    state: web::Data<AppState>,
    req: HttpRequest,
    payload: web::Payload,
) -> HttpResponse {
    if req.method() == Method::OPTIONS {
        return finish(&state, &req, Ok(preflight()));
    }
    let result = receive_webhook(&state, &req, payload).await;
    finish(&state, &req, result)
}

async fn receive_webhook(
    state: &AppState,
    req: &HttpRequest,
    payload: web::Payload,
) -> GatewayResult<HttpResponse> {
    require_method(req, Method::POST)?;
    let body = read_body(req, payload, webhook::MAX_BODY_BYTES).await?;

    let headers = req.headers();
    let event = headers.get(EVENT_HEADER).and_then(|v| v.to_str().ok());
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    let outcome = state.webhooks.receive(event, signature, &body).await?;
    Ok(HttpResponse::Ok().json(outcome))
}

async fn forge_anthropic(
    state: web::Data<AppState>,
    req: HttpRequest,
    payload: web::Payload,
) -> HttpResponse {
    forge(state, req, payload, Provider::Anthropic).await
}

async fn forge_openai(
    state: web::Data<AppState>,
    req: HttpRequest,
    payload: web::Payload,
) -> HttpResponse {
    forge(state, req, payload, Provider::OpenAi).await
}

async fn forge_n8n(
    state: web::Data<AppState>,
    req: HttpRequest,
    payload: web::Payload,
) -> HttpResponse {
    forge(state, req, payload, Provider::N8n).await
}

async fn forge(
    state: web::Data<AppState>,
    req: HttpRequest,
    payload: web::Payload,
    provider: Provider,
) -> HttpResponse {
    if req.method() == Method::OPTIONS {
        return finish(&state, &req, Ok(preflight()));
    }
    let result = stream_completion(&state, &req, payload, provider).await;
    finish(&state, &req, result)
}

async fn stream_completion(
    state: &AppState,
    req: &HttpRequest,
    payload: web::Payload,
    provider: Provider,
) -> GatewayResult<HttpResponse> {
    require_method(req, Method::POST)?;
    state.gate.check_shared_secret(req.headers())?;
    enforce_rate_limit(state, req, GROUP_AI).await?;
    state.completions.ensure_configured(provider)?;

    let body = read_body(req, payload, MAX_JSON_BODY_BYTES).await?;
    let request: ForgeRequest = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::BadRequest(format!("invalid forge request: {}", e)))?;
    request.validate()?;

    let session = state.completions.open(provider, &request).await?;
    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("cache-control", "no-cache"))
        .streaming(session.into_sse()))
}

async fn fallback(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    if req.method() == Method::OPTIONS {
        return finish(&state, &req, Ok(preflight()));
    }
    finish(&state, &req, Err(GatewayError::NotFound))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_declared_length() {
        let req = TestRequest::default()
            .insert_header((header::CONTENT_LENGTH, "42"))
            .to_http_request();
        assert_eq!(declared_length(req.headers()), Some(42));

        let req = TestRequest::default()
            .insert_header((header::CONTENT_LENGTH, "lots"))
            .to_http_request();
        assert_eq!(declared_length(req.headers()), None);
    }

    #[test]
    fn test_require_method() {
        let req = TestRequest::get().to_http_request();
        assert!(require_method(&req, Method::GET).is_ok());
        assert!(matches!(
            require_method(&req, Method::POST),
            Err(GatewayError::MethodNotAllowed)
        ));
    }
}
