//! Ollama backend: NDJSON streaming against a local daemon.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{instrument, warn};

use crucible_core::errors::ProviderError;
use crucible_core::messages::{ChatMessage, ChatRole};
use crucible_core::provider::{ProviderKind, ProviderRecord, ProviderStrategy};
use crucible_core::secrets::SecretStore;
use crucible_core::stream::{ChatEvent, ChatStream};
use crucible_core::tool::ToolDefinition;

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Interpret one NDJSON line from `/api/chat`. Returns events plus
/// whether the stream signalled completion.
pub fn handle_line(line: &str) -> (Vec<ChatEvent>, bool) {
    if line.trim().is_empty() {
        return (Vec::new(), false);
    }
    let chunk: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to parse Ollama chunk");
            return (Vec::new(), false);
        }
    };

    let done = chunk["done"].as_bool().unwrap_or(false);
    let mut events = Vec::new();

    if let Some(content) = chunk["message"]["content"].as_str() {
        if !content.is_empty() {
            events.push(ChatEvent::Text {
                content: content.to_owned(),
            });
        }
    }
    // Ollama delivers tool calls whole, never fragmented.
    if let Some(calls) = chunk["message"]["tool_calls"].as_array() {
        for call in calls {
            if let Some(name) = call["function"]["name"].as_str() {
                events.push(ChatEvent::ToolCall {
                    tool_name: name.to_owned(),
                    args: call["function"]["arguments"].clone(),
                });
            }
        }
    }

    (events, done)
}

pub struct OllamaStrategy {
    client: reqwest::Client,
}

impl OllamaStrategy {
    /// Ollama needs no credentials; the secret store is accepted for
    /// constructor symmetry with the other strategies.
    pub fn new(client: reqwest::Client, _secrets: Arc<dyn SecretStore>) -> Self {
        Self { client }
    }

    fn base_url(provider: &ProviderRecord) -> String {
        provider
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string()
    }

    fn convert_history(history: &[ChatMessage]) -> Vec<Value> {
        history
            .iter()
            .map(|m| {
                let role = match m.role {
                    ChatRole::System => "system",
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                    ChatRole::Tool => "tool",
                };
                json!({"role": role, "content": m.content})
            })
            .collect()
    }
}

#[async_trait]
impl ProviderStrategy for OllamaStrategy {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    async fn is_valid(&self, provider: &ProviderRecord) -> bool {
        match self.list_models(provider).await {
            Ok(_) => true,
            Err(e) => {
                warn!(provider = %provider.name, error = %e, "Ollama connection check failed");
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
        let url = format!("{}/api/tags", Self::base_url(provider));
        let resp = self
            .client
            .get(&url)
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
        Ok(body["models"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["name"].as_str().map(String::from))
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
        let url = format!("{}/api/chat", Self::base_url(provider));

        let mut body = json!({
            "model": model,
            "messages": Self::convert_history(history),
            "stream": true,
        });
        if !tools.is_empty() {
            let rendered: Vec<Value> = tools
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
                .collect();
            body["tools"] = Value::Array(rendered);
        }
        if let Some(extra) = config.as_object() {
            body["options"] = Value::Object(extra.clone());
        }

        let resp = self
            .client
            .post(&url)
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
            let mut buffer = String::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::Stream(e.to_string()))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // Process complete lines, keep the trailing partial.
                while let Some(pos) = buffer.find('\n') {
                    let line: String = buffer.drain(..=pos).collect();
                    let (events, done) = handle_line(&line);
                    for event in events {
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    if done {
                        return;
                    }
                }
            }

            let (events, _) = handle_line(&buffer);
            for event in events {
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
        }));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
