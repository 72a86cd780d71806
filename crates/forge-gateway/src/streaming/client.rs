//! Outbound calls to the completion providers.

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use secrecy::ExposeSecret;
use std::fmt;
use tracing::{debug, error};

use super::{AnthropicDecoder, N8nDecoder, OpenAiDecoder, StreamDecoder, StreamSession};
use crate::config::ProvidersConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::github::upstream_failure;
use crate::types::{
    AnthropicStreamRequest, ForgeRequest, N8nRequest, OpenAiMessage, OpenAiStreamRequest,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub type UpstreamBytes = BoxStream<'static, Result<Bytes, reqwest::Error>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    OpenAi,
    N8n,
}

impl Provider {
    /// The setting that must be present before the provider can be called.
    pub fn required_setting(&self) -> &'static str {
        match self {
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::N8n => "N8N_WEBHOOK_URL",
        }
    }

    fn decoder(&self) -> Box<dyn StreamDecoder> {
        match self {
            Provider::Anthropic => Box::new(AnthropicDecoder::new()),
            Provider::OpenAi => Box::new(OpenAiDecoder::new()),
            Provider::N8n => Box::new(N8nDecoder::new()),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
            Provider::N8n => "n8n",
        })
    }
}

#[derive(Clone)]
pub struct CompletionClient {
    http: reqwest::Client,
    config: ProvidersConfig,
}

impl CompletionClient {
    pub fn new(http: reqwest::Client, config: ProvidersConfig) -> Self {
        Self { http, config }
    }

    pub fn is_configured(&self, provider: Provider) -> bool {
        match provider {
            Provider::Anthropic => self.config.anthropic.api_key.is_some(),
            Provider::OpenAi => self.config.openai.api_key.is_some(),
            Provider::N8n => self.config.n8n.webhook_url.is_some(),
        }
    }

    pub fn ensure_configured(&self, provider: Provider) -> GatewayResult<()> {
        if self.is_configured(provider) {
            Ok(())
        } else {
            Err(GatewayError::NotConfigured(provider.required_setting()))
        }
    }

    /// Send the request and hand back a session over the response body.
    ///
    /// Fails before any bytes reach the client if the provider is not
    /// configured, unreachable, or answers with a non-2xx status.
    pub async fn open(
        &self,
        provider: Provider,
        request: &ForgeRequest,
    ) -> GatewayResult<StreamSession<UpstreamBytes>> {
        self.ensure_configured(provider)?;
        let builder = match provider {
            Provider::Anthropic => self.anthropic(request)?,
            Provider::OpenAi => self.openai(request)?,
            Provider::N8n => self.n8n(request)?,
        };

        debug!(%provider, messages = request.messages.len(), "opening completion stream");
        let upstream = builder
            .send()
            .await
            .map_err(|e| upstream_failure("completion request failed", e))?;

        let status = upstream.status();
        if !status.is_success() {
            error!(%provider, %status, "completion provider rejected request");
            return Err(GatewayError::UpstreamStatus {
                status: status.as_u16(),
            });
        }

        Ok(StreamSession::new(
            provider.decoder(),
            upstream.bytes_stream().boxed(),
        ))
    }

    fn anthropic(&self, request: &ForgeRequest) -> GatewayResult<reqwest::RequestBuilder> {
        let settings = &self.config.anthropic;
        let key = settings
            .api_key
            .as_ref()
            .ok_or(GatewayError::NotConfigured("ANTHROPIC_API_KEY"))?;
        let body = AnthropicStreamRequest {
            model: &settings.model,
            max_tokens: self.config.max_tokens,
            system: request.mode.system_prompt(),
            messages: &request.messages,
            stream: true,
        };
        Ok(self
            .http
            .post(format!("{}/v1/messages", settings.base_url_trimmed()))
            .header("x-api-key", key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header(CONTENT_TYPE, "application/json")
            .json(&body))
    }

    fn openai(&self, request: &ForgeRequest) -> GatewayResult<reqwest::RequestBuilder> {
        let settings = &self.config.openai;
        let key = settings
            .api_key
            .as_ref()
            .ok_or(GatewayError::NotConfigured("OPENAI_API_KEY"))?;

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(OpenAiMessage {
            role: "system",
            content: request.mode.system_prompt(),
        });
        messages.extend(request.messages.iter().map(|m| OpenAiMessage {
            role: m.role.as_str(),
            content: &m.content,
        }));
        let body = OpenAiStreamRequest {
            model: &settings.model,
            max_tokens: self.config.max_tokens,
            messages,
            stream: true,
        };
        Ok(self
            .http
            .post(format!("{}/v1/chat/completions", settings.base_url_trimmed()))
            .header(AUTHORIZATION, format!("Bearer {}", key.expose_secret()))
            .json(&body))
    }

    fn n8n(&self, request: &ForgeRequest) -> GatewayResult<reqwest::RequestBuilder> {
        let settings = &self.config.n8n;
        let url = settings
            .webhook_url
            .as_deref()
            .ok_or(GatewayError::NotConfigured("N8N_WEBHOOK_URL"))?;
        let body = N8nRequest {
            messages: &request.messages,
            mode: request.mode,
        };
        let mut builder = self.http.post(url).json(&body);
        if let Some(key) = &settings.api_key {
            builder = builder.header("x-n8n-key", key.expose_secret());
        }
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::streaming::{CanonicalEvent, UPSTREAM_ERROR};
    use crate::types::{ChatMessage, ForgeMode, Role};
    use secrecy::SecretString;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ForgeRequest {
        ForgeRequest {
            messages: vec![ChatMessage {
                role: Role::User,
                content: "hello".into(),
            }],
            mode: ForgeMode::Chat,
        }
    }

    fn providers(base: &str) -> ProvidersConfig {
        let mut config = GatewayConfig::new("acme", "widgets").providers;
        config.anthropic.api_key = Some(SecretString::from("sk-ant-test".to_string()));
        config.anthropic.base_url = base.to_string();
        config.openai.api_key = Some(SecretString::from("sk-oai-test".to_string()));
        config.openai.base_url = format!("{}/", base);
        config.n8n.webhook_url = Some(format!("{}/webhook/forge", base));
        config.n8n.api_key = Some(SecretString::from("n8n-key".to_string()));
        config
    }

    async fn events(client: &CompletionClient, provider: Provider) -> Vec<CanonicalEvent> {
        let session = client.open(provider, &request()).await.unwrap();
        session.into_events().collect().await
    }

    #[test]
    fn test_unconfigured_provider() {
        let config = GatewayConfig::new("acme", "widgets").providers;
        let client = CompletionClient::new(reqwest::Client::new(), config);
        for provider in [Provider::Anthropic, Provider::OpenAi, Provider::N8n] {
            assert!(!client.is_configured(provider));
            assert!(matches!(
                client.ensure_configured(provider),
                Err(GatewayError::NotConfigured(name)) if name == provider.required_setting()
            ));
        }
    }

    #[tokio::test]
    async fn test_anthropic_request_and_stream() {
        let server = MockServer::start().await;
        let sse = "event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n\
event: message_stop\n\
data: {\"type\":\"message_stop\"}\n\n";
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant-test"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .and(body_partial_json(json!({
                "stream": true,
                "messages": [{"role": "user", "content": "hello"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let client = CompletionClient::new(reqwest::Client::new(), providers(&server.uri()));
        assert_eq!(
            events(&client, Provider::Anthropic).await,
            vec![CanonicalEvent::text("Hi"), CanonicalEvent::Done]
        );
    }

    #[tokio::test]
    async fn test_openai_prepends_system_message() {
        let server = MockServer::start().await;
        let sse = "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Yo\"}}]}\n\ndata: [DONE]\n\n";
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-oai-test"))
            .and(body_partial_json(json!({
                "messages": [
                    {"role": "system", "content": ForgeMode::Chat.system_prompt()},
                    {"role": "user", "content": "hello"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let client = CompletionClient::new(reqwest::Client::new(), providers(&server.uri()));
        assert_eq!(
            events(&client, Provider::OpenAi).await,
            vec![CanonicalEvent::text("Yo"), CanonicalEvent::Done]
        );
    }

    #[tokio::test]
    async fn test_n8n_single_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook/forge"))
            .and(header("x-n8n-key", "n8n-key"))
            .and(body_partial_json(json!({"mode": "chat"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"output": "done it"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = CompletionClient::new(reqwest::Client::new(), providers(&server.uri()));
        assert_eq!(
            events(&client, Provider::N8n).await,
            vec![CanonicalEvent::text("done it"), CanonicalEvent::Done]
        );
    }

    #[tokio::test]
    async fn test_non_success_status_fails_before_streaming() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(529).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = CompletionClient::new(reqwest::Client::new(), providers(&server.uri()));
        assert!(matches!(
            client.open(Provider::Anthropic, &request()).await,
            Err(GatewayError::UpstreamStatus { status: 529 })
        ));
    }

    #[tokio::test]
    async fn test_truncated_stream_still_terminates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook/forge"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"outp"))
            .mount(&server)
            .await;

        let client = CompletionClient::new(reqwest::Client::new(), providers(&server.uri()));
        assert_eq!(
            events(&client, Provider::N8n).await,
            vec![CanonicalEvent::error(UPSTREAM_ERROR)]
        );
    }
}
