use crate::domain::errors::GatewayError;
use crate::domain::llm::{ChatMessage, ChatRequest, ChatResponse, ModelConfig, ResponseFormat};
use crate::domain::llm::Provider;
use crate::domain::ports::ChatProvider;
use prometheus::{IntCounter, Registry};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Structured-output contract for `call_structured`. `validate` is the guard
/// hook (e.g. rejecting an empty `ticker_signals` list); `fallback` is the
/// zero-valued instance returned when every retry fails and no default
/// factory was supplied.
pub trait StructuredOutput: DeserializeOwned {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    fn fallback() -> Self;
}

/// Call/retry counters. Each gateway owns its registry so test instances
/// never collide.
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Arc<Registry>,
    calls_total: IntCounter,
    retries_total: IntCounter,
    parse_failures_total: IntCounter,
    fallbacks_total: IntCounter,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let calls_total =
            IntCounter::new("llm_calls_total", "Total LLM calls issued").expect("counter");
        let retries_total =
            IntCounter::new("llm_retries_total", "Total LLM call retries").expect("counter");
        let parse_failures_total = IntCounter::new(
            "llm_parse_failures_total",
            "Structured responses that failed parsing or the guard",
        )
        .expect("counter");
        let fallbacks_total = IntCounter::new(
            "llm_fallbacks_total",
            "Structured calls that degraded to the default value",
        )
        .expect("counter");

        for counter in [
            &calls_total,
            &retries_total,
            &parse_failures_total,
            &fallbacks_total,
        ] {
            let _ = registry.register(Box::new(counter.clone()));
        }

        Self {
            registry: Arc::new(registry),
            calls_total,
            retries_total,
            parse_failures_total,
            fallbacks_total,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn calls(&self) -> u64 {
        self.calls_total.get()
    }

    pub fn retries(&self) -> u64 {
        self.retries_total.get()
    }

    pub fn parse_failures(&self) -> u64 {
        self.parse_failures_total.get()
    }

    pub fn fallbacks(&self) -> u64 {
        self.fallbacks_total.get()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Uniform call-and-parse interface over the registered LLM providers.
pub struct ModelGateway {
    providers: HashMap<Provider, Arc<dyn ChatProvider>>,
    metrics: GatewayMetrics,
    max_retries: usize,
    backoff_base: Duration,
}

impl ModelGateway {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            metrics: GatewayMetrics::new(),
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
        }
    }

    pub fn register(&mut self, provider: Provider, binding: Arc<dyn ChatProvider>) {
        self.providers.insert(provider, binding);
    }

    pub fn with_provider(mut self, provider: Provider, binding: Arc<dyn ChatProvider>) -> Self {
        self.register(provider, binding);
        self
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    /// Single provider call. Requests JSON mode only when the binding
    /// supports it; otherwise the format hint is dropped.
    pub async fn call(
        &self,
        model: &ModelConfig,
        messages: Vec<ChatMessage>,
        temperature: f64,
        response_format: Option<ResponseFormat>,
    ) -> Result<ChatResponse, GatewayError> {
        let binding = self
            .providers
            .get(&model.provider)
            .ok_or_else(|| GatewayError::UnknownProvider {
                name: model.provider.to_string(),
            })?;

        let format = match response_format {
            Some(ResponseFormat::JsonObject) if binding.supports_json_mode() => {
                Some(ResponseFormat::JsonObject)
            }
            Some(ResponseFormat::JsonObject) => None,
            other => other,
        };

        self.metrics.calls_total.inc();

        binding
            .chat(ChatRequest {
                model: model.model.clone(),
                messages,
                temperature,
                response_format: format,
            })
            .await
            .map_err(|e| GatewayError::Transport {
                provider: model.provider.to_string(),
                model: model.model.clone(),
                reason: e.to_string(),
            })
    }

    /// Call-and-coerce with bounded retry. Transport failures, JSON parse
    /// failures, and guard rejections are retried with 1s/2s/4s backoff; on
    /// exhaustion the default factory (or `T::fallback`) is returned, so the
    /// result always validates or is the declared default.
    pub async fn call_structured<T: StructuredOutput>(
        &self,
        model: &ModelConfig,
        messages: Vec<ChatMessage>,
        temperature: f64,
        default_factory: Option<Box<dyn Fn() -> T + Send + Sync>>,
    ) -> T {
        let mut last_error = String::new();

        for attempt in 0..self.max_retries {
            if attempt > 0 {
                self.metrics.retries_total.inc();
                let backoff = self.backoff_base * (1u32 << (attempt - 1));
                tokio::time::sleep(backoff).await;
            }

            let response = match self
                .call(
                    model,
                    messages.clone(),
                    temperature,
                    Some(ResponseFormat::JsonObject),
                )
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!("Gateway: call attempt {} failed: {}", attempt + 1, e);
                    last_error = e.to_string();
                    continue;
                }
            };

            match parse_structured::<T>(&response.content) {
                Ok(value) => return value,
                Err(e) => {
                    self.metrics.parse_failures_total.inc();
                    debug!("Gateway: structured parse attempt {} failed: {}", attempt + 1, e);
                    last_error = e.to_string();
                }
            }
        }

        self.metrics.fallbacks_total.inc();
        warn!(
            "Gateway: structured call exhausted {} attempts ({}), returning default",
            self.max_retries, last_error
        );
        match default_factory {
            Some(factory) => factory(),
            None => T::fallback(),
        }
    }
}

impl Default for ModelGateway {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_structured<T: StructuredOutput>(body: &str) -> Result<T, GatewayError> {
    let raw = extract_json_object(body).ok_or_else(|| GatewayError::Parse {
        reason: "no JSON object found in response body".to_string(),
    })?;

    let value: T = serde_json::from_str(&raw).map_err(|e| GatewayError::Parse {
        reason: e.to_string(),
    })?;

    value
        .validate()
        .map_err(|reason| GatewayError::GuardRejected { reason })?;

    Ok(value)
}

/// Finds the first JSON object in a model response body. Prefers the whole
/// body, then fenced code blocks, then the first balanced `{...}` span
/// (brace matching that ignores string literals and escapes).
pub fn extract_json_object(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.starts_with('{') && serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return Some(trimmed.to_string());
    }

    if let Some(fenced) = extract_fenced_block(trimmed) {
        if let Some(obj) = first_balanced_object(fenced) {
            return Some(obj.to_string());
        }
    }

    first_balanced_object(trimmed).map(str::to_string)
}

fn extract_fenced_block(body: &str) -> Option<&str> {
    let start = body.find("```")?;
    let after_fence = &body[start + 3..];
    // Skip an optional language tag on the fence line.
    let content_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let content = &after_fence[content_start..];
    let end = content.find("```")?;
    Some(&content[..end])
}

fn first_balanced_object(body: &str) -> Option<&str> {
    let start = body.find('{')?;
    let bytes = body.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &body[start..start + offset + 1];
                    if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
                        return Some(candidate);
                    }
                    return None;
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Probe {
        items: Vec<String>,
    }

    impl StructuredOutput for Probe {
        fn validate(&self) -> Result<(), String> {
            if self.items.is_empty() {
                return Err("items must be non-empty".to_string());
            }
            Ok(())
        }

        fn fallback() -> Self {
            Probe { items: vec![] }
        }
    }

    struct QueueProvider {
        responses: Mutex<Vec<Result<String, String>>>,
    }

    #[async_trait]
    impl ChatProvider for QueueProvider {
        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse> {
            let next = self.responses.lock().unwrap().remove(0);
            match next {
                Ok(content) => Ok(ChatResponse {
                    content,
                    usage: None,
                }),
                Err(e) => anyhow::bail!(e),
            }
        }

        fn supports_json_mode(&self) -> bool {
            true
        }
    }

    fn gateway_with(responses: Vec<Result<String, String>>) -> ModelGateway {
        ModelGateway::new().with_provider(
            Provider::OpenAi,
            Arc::new(QueueProvider {
                responses: Mutex::new(responses),
            }),
        )
    }

    #[test]
    fn extracts_plain_object() {
        let body = r#"{"a": 1}"#;
        assert_eq!(extract_json_object(body).unwrap(), body);
    }

    #[test]
    fn extracts_from_fenced_block() {
        let body = "Here you go:\n```json\n{\"a\": [1, 2]}\n```\nanything else";
        assert_eq!(extract_json_object(body).unwrap(), "{\"a\": [1, 2]}");
    }

    #[test]
    fn extracts_first_object_from_prose() {
        let body = "The answer is {\"key\": \"va{lue}\"} as requested.";
        assert_eq!(extract_json_object(body).unwrap(), "{\"key\": \"va{lue}\"}");
    }

    #[test]
    fn braces_inside_strings_are_ignored() {
        let body = r#"prefix {"text": "open { brace \" and } close", "n": 2} suffix"#;
        let extracted = extract_json_object(body).unwrap();
        let value: serde_json::Value = serde_json::from_str(&extracted).unwrap();
        assert_eq!(value["n"], 2);
    }

    #[test]
    fn no_object_yields_none() {
        assert!(extract_json_object("just words").is_none());
        assert!(extract_json_object("unbalanced { \"a\": 1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_list_guard_triggers_retry() {
        let gateway = gateway_with(vec![
            Ok(r#"{"items": []}"#.to_string()),
            Ok(r#"{"items": []}"#.to_string()),
            Ok(r#"{"items": ["AAPL"]}"#.to_string()),
        ]);

        let probe: Probe = gateway
            .call_structured(&ModelConfig::default(), vec![ChatMessage::user("go")], 0.2, None)
            .await;

        assert_eq!(probe.items, vec!["AAPL".to_string()]);
        assert_eq!(gateway.metrics().retries(), 2);
        assert_eq!(gateway.metrics().parse_failures(), 2);
        assert_eq!(gateway.metrics().fallbacks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fall_back_to_default() {
        let gateway = gateway_with(vec![
            Err("timeout".to_string()),
            Ok("no json here".to_string()),
            Ok(r#"{"items": []}"#.to_string()),
        ]);

        let probe: Probe = gateway
            .call_structured(
                &ModelConfig::default(),
                vec![ChatMessage::user("go")],
                0.2,
                Some(Box::new(|| Probe {
                    items: vec!["default".to_string()],
                })),
            )
            .await;

        assert_eq!(probe.items, vec!["default".to_string()]);
        assert_eq!(gateway.metrics().fallbacks(), 1);
    }

    #[tokio::test]
    async fn unknown_provider_is_final() {
        let gateway = ModelGateway::new();
        let err = gateway
            .call(
                &ModelConfig::default(),
                vec![ChatMessage::user("hi")],
                0.0,
                None,
            )
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
