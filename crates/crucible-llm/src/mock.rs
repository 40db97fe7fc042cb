//! Scripted provider strategy for deterministic testing without API calls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use serde_json::Value;

use crucible_core::errors::ProviderError;
use crucible_core::messages::ChatMessage;
use crucible_core::provider::{ProviderKind, ProviderRecord, ProviderStrategy};
use crucible_core::stream::{ChatEvent, ChatStream};
use crucible_core::tool::ToolDefinition;

/// Pre-programmed outcome for one `chat` call.
pub enum MockChat {
    /// Yield this event sequence.
    Events(Vec<ChatEvent>),
    /// Fail the `chat` call itself.
    Error(ProviderError),
    /// Yield events, then an error item mid-stream.
    EventsThenError(Vec<ChatEvent>, ProviderError),
}

impl MockChat {
    /// Convenience: a plain text response streamed as one chunk.
    pub fn text(text: &str) -> Self {
        Self::Events(vec![ChatEvent::Text {
            content: text.to_owned(),
        }])
    }

    /// Convenience: a single tool call.
    pub fn tool_call(tool_name: &str, args: Value) -> Self {
        Self::Events(vec![ChatEvent::ToolCall {
            tool_name: tool_name.to_owned(),
            args,
        }])
    }
}

/// Mock strategy returning pre-programmed responses in sequence.
pub struct MockStrategy {
    kind: ProviderKind,
    responses: Mutex<VecDeque<MockChat>>,
    call_count: AtomicUsize,
    models: Vec<String>,
    last_history: Mutex<Option<Vec<ChatMessage>>>,
}

impl MockStrategy {
    pub fn new(responses: Vec<MockChat>) -> Self {
        Self {
            kind: ProviderKind::OpenAi,
            responses: Mutex::new(responses.into()),
            call_count: AtomicUsize::new(0),
            models: vec!["mock-model".into()],
            last_history: Mutex::new(None),
        }
    }

    pub fn with_kind(mut self, kind: ProviderKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// The history passed to the most recent `chat` call.
    pub fn last_history(&self) -> Option<Vec<ChatMessage>> {
        self.last_history.lock().clone()
    }
}

#[async_trait]
impl ProviderStrategy for MockStrategy {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn is_valid(&self, _provider: &ProviderRecord) -> bool {
        true
    }

    async fn is_model_ready(&self, _provider: &ProviderRecord, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    async fn list_models(&self, _provider: &ProviderRecord) -> Result<Vec<String>, ProviderError> {
        Ok(self.models.clone())
    }

    async fn chat(
        &self,
        _provider: &ProviderRecord,
        _model: &str,
        history: &[ChatMessage],
        _tools: &[ToolDefinition],
        _config: &Value,
    ) -> Result<ChatStream, ProviderError> {
        let _ = self.call_count.fetch_add(1, Ordering::SeqCst);
        *self.last_history.lock() = Some(history.to_vec());

        let next = self.responses.lock().pop_front();
        match next {
            Some(MockChat::Events(events)) => {
                let items: Vec<Result<ChatEvent, ProviderError>> =
                    events.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(items)))
            }
            Some(MockChat::EventsThenError(events, error)) => {
                let mut items: Vec<Result<ChatEvent, ProviderError>> =
                    events.into_iter().map(Ok).collect();
                items.push(Err(error));
                Ok(Box::pin(stream::iter(items)))
            }
            Some(MockChat::Error(e)) => Err(e),
            None => Err(ProviderError::InvalidRequest(format!(
                "MockStrategy: no response configured for call {}",
                self.call_count()
            ))),
        }
    }
}
