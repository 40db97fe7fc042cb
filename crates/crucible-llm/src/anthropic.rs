//! Anthropic messages backend.
//!
//! Streams `/v1/messages` SSE. Tool-use input arrives as
//! `content_block_start` / `input_json_delta` / `content_block_stop`
//! sequences; the partial JSON is accumulated per block and a complete
//! `ToolCall` is emitted at block stop. The system prompt is lifted out
//! of the history into the top-level `system` parameter.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{instrument, warn};

use crucible_core::errors::ProviderError;
use crucible_core::messages::{ChatMessage, ChatRole};
use crucible_core::provider::{ProviderKind, ProviderRecord, ProviderStrategy};
use crucible_core::secrets::SecretStore;
use crucible_core::stream::{ChatEvent, ChatStream};
use crucible_core::tool::ToolDefinition;

use crate::sse::SseBuffer;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u64 = 4096;

/// Anthropic has no model-listing endpoint on all deployments; serve a
/// static list.
const STATIC_MODELS: &[&str] = &[
    "claude-3-5-sonnet-20241022",
    "claude-3-5-haiku-20241022",
    "claude-3-opus-20240229",
    "claude-3-sonnet-20240229",
    "claude-3-haiku-20240307",
];

/// Interprets the message stream's data payloads, accumulating the
/// current tool-use block.
#[derive(Default)]
pub struct StreamState {
    current_tool: Option<String>,
    input_json: String,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_data(&mut self, data: &str) -> Vec<ChatEvent> {
        let chunk: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "skipping unparseable message chunk");
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        match chunk["type"].as_str() {
            Some("content_block_delta") => match chunk["delta"]["type"].as_str() {
                Some("text_delta") => {
                    if let Some(text) = chunk["delta"]["text"].as_str() {
                        events.push(ChatEvent::Text {
                            content: text.to_owned(),
                        });
                    }
                }
                Some("input_json_delta") => {
                    if let Some(partial) = chunk["delta"]["partial_json"].as_str() {
                        self.input_json.push_str(partial);
                    }
                }
                _ => {}
            },
            Some("content_block_start") => {
                if chunk["content_block"]["type"] == "tool_use" {
                    self.current_tool = chunk["content_block"]["name"]
                        .as_str()
                        .map(String::from);
                    self.input_json.clear();
                }
            }
            Some("content_block_stop") => {
                if let Some(tool_name) = self.current_tool.take() {
                    let raw = std::mem::take(&mut self.input_json);
                    let args = if raw.is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&raw).unwrap_or(Value::String(raw))
                    };
                    events.push(ChatEvent::ToolCall { tool_name, args });
                }
            }
            _ => {}
        }
        events
    }
}

pub struct AnthropicStrategy {
    client: reqwest::Client,
    secrets: Arc<dyn SecretStore>,
}

impl AnthropicStrategy {
    pub fn new(client: reqwest::Client, secrets: Arc<dyn SecretStore>) -> Self {
        Self { client, secrets }
    }

    fn base_url(provider: &ProviderRecord) -> String {
        provider
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string()
    }

    async fn api_key(&self, provider: &ProviderRecord) -> Result<SecretString, ProviderError> {
        let key_ref = provider
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::MissingApiKey(provider.name.clone()))?;
        let secret = self
            .secrets
            .retrieve(key_ref)
            .await
            .map_err(|e| ProviderError::Secret(e.to_string()))?
            .ok_or_else(|| ProviderError::MissingApiKey(provider.name.clone()))?;
        Ok(SecretString::from(secret))
    }

    /// System messages become the top-level `system` param; the rest keep
    /// their roles (tool results are folded into user turns, which is the
    /// closest mapping the messages API offers for our flat history).
    fn split_history(history: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
        let system = history
            .iter()
            .find(|m| m.role == ChatRole::System)
            .map(|m| m.content.clone());

        let messages = history
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(|m| {
                let role = match m.role {
                    ChatRole::Assistant => "assistant",
                    _ => "user",
                };
                json!({"role": role, "content": m.content})
            })
            .collect();

        (system, messages)
    }

    fn convert_tools(tools: &[ToolDefinition]) -> Option<Vec<Value>> {
        if tools.is_empty() {
            return None;
        }
        Some(
            tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters
                    })
                })
                .collect(),
        )
    }
}

#[async_trait]
impl ProviderStrategy for AnthropicStrategy {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn is_valid(&self, provider: &ProviderRecord) -> bool {
        // The model list is static, so connectivity is checked with a
        // minimal one-token message.
        let key = match self.api_key(provider).await {
            Ok(key) => key,
            Err(e) => {
                warn!(provider = %provider.name, error = %e, "Anthropic connection check failed");
                return false;
            }
        };
        let url = format!("{}/v1/messages", Self::base_url(provider));
        let body = json!({
            "model": STATIC_MODELS[STATIC_MODELS.len() - 1],
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "Hi"}]
        });
        match self
            .client
            .post(&url)
            .header("x-api-key", key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(provider = %provider.name, error = %e, "Anthropic connection check failed");
                false
            }
        }
    }

    async fn is_model_ready(&self, provider: &ProviderRecord, model: &str) -> bool {
        self.list_models(provider)
            .await
            .map(|models| models.iter().any(|m| m == model))
            .unwrap_or(false)
    }

    async fn list_models(&self, _provider: &ProviderRecord) -> Result<Vec<String>, ProviderError> {
        Ok(STATIC_MODELS.iter().map(|m| (*m).to_string()).collect())
    }

    #[instrument(skip_all, fields(provider = %provider.name, model = %model))]
    async fn chat(
        &self,
        provider: &ProviderRecord,
        model: &str,
        history: &[ChatMessage],
        tools: &[ToolDefinition],
        config: &Value,
    ) -> Result<ChatStream, ProviderError> {
        let key = self.api_key(provider).await?;
        let url = format!("{}/v1/messages", Self::base_url(provider));

        let (system, messages) = Self::split_history(history);
        let max_tokens = config["max_tokens"].as_u64().unwrap_or(DEFAULT_MAX_TOKENS);

        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": max_tokens,
            "stream": true,
        });
        if let Some(system) = system {
            body["system"] = Value::String(system);
        }
        if let Some(tools) = Self::convert_tools(tools) {
            body["tools"] = Value::Array(tools);
        }
        if let Some(extra) = config.as_object() {
            for (k, v) in extra {
                body[k] = v.clone();
            }
        }

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<ChatEvent, ProviderError>>(64);
        drop(tokio::spawn(async move {
            let mut bytes = resp.bytes_stream();
            let mut buffer = SseBuffer::new();
            let mut state = StreamState::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::Stream(e.to_string()))).await;
                        return;
                    }
                };
                let text = String::from_utf8_lossy(&chunk);
                for (_, data) in buffer.push(&text) {
                    for event in state.handle_data(&data) {
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                }
            }

            if let Some((_, data)) = buffer.finish() {
                for event in state.handle_data(&data) {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
        }));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
