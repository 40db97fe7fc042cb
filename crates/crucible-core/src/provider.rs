//! Provider records and the strategy seam each backend family implements.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProviderError;
use crate::ids::ProviderId;
use crate::messages::ChatMessage;
use crate::stream::ChatStream;
use crate::tool::ToolDefinition;

/// Closed set of supported backend families.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Ollama,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Ollama => "ollama",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = ProviderError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ProviderError::UnsupportedKind(other.to_owned())),
        }
    }
}

/// A configured connection to a model backend family.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRecord {
    pub id: ProviderId,
    pub name: String,
    pub kind: ProviderKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Secret-store reference, never the credential itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// One chat contract over heterogeneous model backends.
///
/// `chat` returns a finite, non-restartable stream; transient failures are
/// absorbed by the retry decorator in `crucible-llm`, not here.
#[async_trait]
pub trait ProviderStrategy: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Whether the configured connection works at all.
    async fn is_valid(&self, provider: &ProviderRecord) -> bool;

    /// Whether the named model is available on this connection.
    async fn is_model_ready(&self, provider: &ProviderRecord, model: &str) -> bool;

    async fn list_models(&self, provider: &ProviderRecord) -> Result<Vec<String>, ProviderError>;

    async fn chat(
        &self,
        provider: &ProviderRecord,
        model: &str,
        history: &[ChatMessage],
        tools: &[ToolDefinition],
        config: &Value,
    ) -> Result<ChatStream, ProviderError>;
}
