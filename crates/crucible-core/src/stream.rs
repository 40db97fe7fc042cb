use std::pin::Pin;

use futures::Stream;
use serde_json::Value;

use crate::errors::ProviderError;

/// Events yielded by a provider chat stream. Contract:
///
/// - The sequence is finite and not restartable.
/// - `Text` chunks arrive as the backend streams them.
/// - `ToolCall` events are emitted only once the call's arguments are
///   complete; backends that fragment arguments buffer them internally.
/// - Malformed argument JSON is passed through as a raw string value
///   rather than failing the stream.
#[derive(Clone, Debug, PartialEq)]
pub enum ChatEvent {
    Text { content: String },
    ToolCall { tool_name: String, args: Value },
}

/// A lazily evaluated, finite sequence of chat events.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatEvent, ProviderError>> + Send>>;
