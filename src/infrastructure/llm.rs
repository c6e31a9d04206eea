use crate::domain::llm::{ChatRequest, ChatResponse, ChatRole, ResponseFormat, TokenUsage};
use crate::domain::ports::ChatProvider;
use crate::infrastructure::http::HttpSettings;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com/v1";
const ANTHROPIC_DEFAULT_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_MAX_TOKENS: u32 = 4096;

fn role_name(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    }
}

/// OpenAI-compatible chat-completions binding. Also serves self-hosted or
/// proxied endpoints via a custom base URL.
pub struct OpenAiProvider {
    client: ClientWithMiddleware,
    api_key: String,
    base_url: String,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>, http: &HttpSettings) -> Self {
        Self {
            client: http.build_client(),
            api_key: api_key.into(),
            base_url: base_url.unwrap_or_else(|| OPENAI_DEFAULT_BASE.to_string()),
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let messages: Vec<_> = request
            .messages
            .iter()
            .map(|m| json!({"role": role_name(m.role), "content": m.content}))
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
        });
        if request.response_format == Some(ResponseFormat::JsonObject) {
            body["response_format"] = json!({"type": "json_object"});
        }

        debug!("OpenAiProvider: POST chat/completions model={}", request.model);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("openai request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("openai returned {status}: {text}"));
        }

        let parsed: OpenAiResponse = response
            .json()
            .await
            .context("openai response was not valid JSON")?;
        let content = parsed
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| anyhow!("openai response had no choices"))?;

        Ok(ChatResponse {
            content,
            usage: parsed.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            }),
        })
    }

    fn supports_json_mode(&self) -> bool {
        true
    }
}

/// Anthropic messages-API binding. No JSON mode; the gateway extracts JSON
/// from the text body instead.
pub struct AnthropicProvider {
    client: ClientWithMiddleware,
    api_key: String,
    base_url: String,
}

#[derive(Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    usage: Option<AnthropicUsage>,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>, http: &HttpSettings) -> Self {
        Self {
            client: http.build_client(),
            api_key: api_key.into(),
            base_url: base_url.unwrap_or_else(|| ANTHROPIC_DEFAULT_BASE.to_string()),
        }
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        // Anthropic takes the system prompt as a top-level field.
        let system: String = request
            .messages
            .iter()
            .filter(|m| m.role == ChatRole::System)
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n");
        let messages: Vec<_> = request
            .messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(|m| json!({"role": role_name(m.role), "content": m.content}))
            .collect();

        let mut body = json!({
            "model": request.model,
            "max_tokens": ANTHROPIC_MAX_TOKENS,
            "messages": messages,
            "temperature": request.temperature,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }

        debug!("AnthropicProvider: POST v1/messages model={}", request.model);
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .context("anthropic request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("anthropic returned {status}: {text}"));
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .context("anthropic response was not valid JSON")?;
        let content = parsed
            .content
            .first()
            .map(|block| block.text.clone())
            .ok_or_else(|| anyhow!("anthropic response had no content blocks"))?;

        Ok(ChatResponse {
            content,
            usage: parsed.usage.map(|u| TokenUsage {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
            }),
        })
    }
}
