//! Wire types for the `/ai/forge*` routes.
//!
//! The client sends one provider-agnostic [`ForgeRequest`]. Each provider gets
//! its own outbound body built from it; the client never sees those shapes.

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Upper bound on conversation length accepted from the client.
pub const MAX_MESSAGES: usize = 64;

/// A message role in a forge conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// What the model is being asked to do. Selects the system prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForgeMode {
    #[default]
    Chat,
    Plan,
}

impl ForgeMode {
    pub fn system_prompt(&self) -> &'static str {
        match self {
            ForgeMode::Chat => {
                "You are the forge assistant. Answer questions about the repository \
                 and its engine runs concisely."
            }
            ForgeMode::Plan => {
                "You are the forge planner. Produce a short, numbered plan of concrete \
                 steps for the request. Do not write code unless asked."
            }
        }
    }
}

/// Request body for every `/ai/forge*` route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub mode: ForgeMode,
}

impl ForgeRequest {
    pub fn validate(&self) -> GatewayResult<()> {
        if self.messages.is_empty() {
            return Err(GatewayError::BadRequest("messages must not be empty".into()));
        }
        if self.messages.len() > MAX_MESSAGES {
            return Err(GatewayError::BadRequest(format!(
                "at most {} messages are accepted",
                MAX_MESSAGES
            )));
        }
        Ok(())
    }
}

/// `POST /v1/messages` body (Anthropic), streaming only.
#[derive(Debug, Clone, Serialize)]
pub struct AnthropicStreamRequest<'a> {
    pub model: &'a str,
    pub max_tokens: u32,
    pub system: &'a str,
    pub messages: &'a [ChatMessage],
    pub stream: bool,
}

/// `POST /v1/chat/completions` body (OpenAI), streaming only.
#[derive(Debug, Clone, Serialize)]
pub struct OpenAiStreamRequest<'a> {
    pub model: &'a str,
    pub max_tokens: u32,
    pub messages: Vec<OpenAiMessage<'a>>,
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenAiMessage<'a> {
    pub role: &'a str,
    pub content: &'a str,
}

/// Body posted to the n8n workflow webhook.
#[derive(Debug, Clone, Serialize)]
pub struct N8nRequest<'a> {
    pub messages: &'a [ChatMessage],
    pub mode: ForgeMode,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mode_defaults_to_chat() {
        let req: ForgeRequest =
            serde_json::from_value(json!({"messages": [{"role": "user", "content": "hi"}]}))
                .unwrap();
        assert_eq!(req.mode, ForgeMode::Chat);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_rejects_unknown_role_and_mode() {
        assert!(serde_json::from_value::<ForgeRequest>(
            json!({"messages": [{"role": "system", "content": "x"}]})
        )
        .is_err());
        assert!(serde_json::from_value::<ForgeRequest>(
            json!({"messages": [{"role": "user", "content": "x"}], "mode": "yolo"})
        )
        .is_err());
    }

    #[test]
    fn test_validate_bounds() {
        let empty = ForgeRequest {
            messages: vec![],
            mode: ForgeMode::Chat,
        };
        assert!(matches!(empty.validate(), Err(GatewayError::BadRequest(_))));

        let long = ForgeRequest {
            messages: vec![
                ChatMessage {
                    role: Role::User,
                    content: "x".into()
                };
                MAX_MESSAGES + 1
            ],
            mode: ForgeMode::Plan,
        };
        assert!(matches!(long.validate(), Err(GatewayError::BadRequest(_))));
    }

    #[test]
    fn test_anthropic_body_shape() {
        let messages = vec![ChatMessage {
            role: Role::User,
            content: "hi".into(),
        }];
        let body = AnthropicStreamRequest {
            model: "claude-test",
            max_tokens: 16,
            system: ForgeMode::Chat.system_prompt(),
            messages: &messages,
            stream: true,
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["messages"][0], json!({"role": "user", "content": "hi"}));
        assert_eq!(v["stream"], json!(true));
    }
}
