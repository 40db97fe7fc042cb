//! OpenAI-compatible chat completions backend.
//!
//! Streams `/v1/chat/completions` SSE. The backend delivers tool-call
//! arguments in fragments tagged by index; fragments are buffered per
//! index and complete `ToolCall` events are emitted only when the turn
//! finishes. Malformed argument JSON is passed through as a raw string.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument, warn};

use crucible_core::errors::ProviderError;
use crucible_core::messages::{ChatMessage, ChatRole};
use crucible_core::provider::{ProviderKind, ProviderRecord, ProviderStrategy};
use crucible_core::secrets::SecretStore;
use crucible_core::stream::{ChatEvent, ChatStream};
use crucible_core::tool::ToolDefinition;

use crate::sse::SseBuffer;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Buffers tool-call argument fragments per index until the turn completes.
#[derive(Default)]
pub struct ToolCallAccumulator {
    pending: BTreeMap<u64, PendingCall>,
}

#[derive(Default)]
struct PendingCall {
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one streamed fragment.
    pub fn push_fragment(&mut self, index: u64, name: Option<&str>, arguments: Option<&str>) {
        let entry = self.pending.entry(index).or_default();
        if let Some(name) = name {
            entry.name.push_str(name);
        }
        if let Some(arguments) = arguments {
            entry.arguments.push_str(arguments);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Emit completed calls in index order. Empty arguments become `{}`;
    /// arguments that fail to parse are passed through as the raw string.
    pub fn flush(&mut self) -> Vec<ChatEvent> {
        std::mem::take(&mut self.pending)
            .into_values()
            .map(|call| {
                let args = if call.arguments.is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&call.arguments)
                        .unwrap_or(Value::String(call.arguments))
                };
                ChatEvent::ToolCall {
                    tool_name: call.name,
                    args,
                }
            })
            .collect()
    }
}

/// Incremental interpreter for the completion stream's data payloads.
#[derive(Default)]
pub struct StreamState {
    accumulator: ToolCallAccumulator,
    finished: bool,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpret one SSE data payload, returning events ready to emit.
    pub fn handle_data(&mut self, data: &str) -> Vec<ChatEvent> {
        if data.trim() == "[DONE]" {
            return self.finish();
        }

        let chunk: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "skipping unparseable completion chunk");
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        let delta = &chunk["choices"][0]["delta"];

        if let Some(content) = delta["content"].as_str() {
            if !content.is_empty() {
                events.push(ChatEvent::Text {
                    content: content.to_owned(),
                });
            }
        }

        if let Some(calls) = delta["tool_calls"].as_array() {
            for fragment in calls {
                let index = fragment["index"].as_u64().unwrap_or(0);
                self.accumulator.push_fragment(
                    index,
                    fragment["function"]["name"].as_str(),
                    fragment["function"]["arguments"].as_str(),
                );
            }
        }

        events
    }

    /// The turn is complete: emit buffered tool calls exactly once.
    pub fn finish(&mut self) -> Vec<ChatEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        self.accumulator.flush()
    }
}

pub struct OpenAiStrategy {
    client: reqwest::Client,
    secrets: Arc<dyn SecretStore>,
}

impl OpenAiStrategy {
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

    fn convert_history(history: &[ChatMessage]) -> Vec<Value> {
        let mut messages = Vec::with_capacity(history.len());
        // Tool results carry no call id in our history; ids are assigned
        // here and consumed in order, which matches how the orchestrator
        // appends results directly after the assistant turn.
        let mut pending_ids: VecDeque<String> = VecDeque::new();
        let mut next_id = 0usize;

        for msg in history {
            match (msg.role, &msg.tool_calls) {
                (ChatRole::Assistant, Some(calls)) => {
                    let rendered: Vec<Value> = calls
                        .iter()
                        .map(|call| {
                            let id = format!("call_{next_id}");
                            next_id += 1;
                            pending_ids.push_back(id.clone());
                            let arguments = match &call.args {
                                Value::String(raw) => raw.clone(),
                                other => other.to_string(),
                            };
                            json!({
                                "id": id,
                                "type": "function",
                                "function": {"name": call.tool_name, "arguments": arguments}
                            })
                        })
                        .collect();
                    messages.push(json!({
                        "role": "assistant",
                        "content": msg.content,
                        "tool_calls": rendered
                    }));
                }
                (ChatRole::Tool, _) => {
                    let id = pending_ids
                        .pop_front()
                        .unwrap_or_else(|| "call_0".to_string());
                    messages.push(json!({
                        "role": "tool",
                        "tool_call_id": id,
                        "content": msg.content
                    }));
                }
                (role, _) => {
                    let role = match role {
                        ChatRole::System => "system",
                        ChatRole::User => "user",
                        ChatRole::Assistant => "assistant",
                        ChatRole::Tool => unreachable!("handled above"),
                    };
                    messages.push(json!({"role": role, "content": msg.content}));
                }
            }
        }
        messages
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
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters
                        }
                    })
                })
                .collect(),
        )
    }
}

#[async_trait]
impl ProviderStrategy for OpenAiStrategy {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn is_valid(&self, provider: &ProviderRecord) -> bool {
        match self.list_models(provider).await {
            Ok(_) => true,
            Err(e) => {
                warn!(provider = %provider.name, error = %e, "OpenAI connection check failed");
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

    #[instrument(skip(self, provider), fields(provider = %provider.name))]
    async fn list_models(&self, provider: &ProviderRecord) -> Result<Vec<String>, ProviderError> {
        let key = self.api_key(provider).await?;
        let url = format!("{}/models", Self::base_url(provider));

        let resp = self
            .client
            .get(&url)
            .bearer_auth(key.expose_secret())
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Stream(e.to_string()))?;
        Ok(body["data"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["id"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default())
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
        let url = format!("{}/chat/completions", Self::base_url(provider));

        let mut body = json!({
            "model": model,
            "messages": Self::convert_history(history),
            "stream": true,
        });
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
            .bearer_auth(key.expose_secret())
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
            // Stream ended without [DONE]: still emit buffered tool calls.
            for event in state.finish() {
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
            debug!("completion stream finished");
        }));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
