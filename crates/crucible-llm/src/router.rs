//! Provider dispatch and the retry wrapper around chat connections.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::instrument;

use crucible_core::errors::ProviderError;
use crucible_core::messages::ChatMessage;
use crucible_core::provider::{ProviderKind, ProviderRecord, ProviderStrategy};
use crucible_core::secrets::SecretStore;
use crucible_core::stream::ChatStream;
use crucible_core::tool::ToolDefinition;

use crate::anthropic::AnthropicStrategy;
use crate::ollama::OllamaStrategy;
use crate::openai::OpenAiStrategy;
use crate::retry::{retry_with_backoff, RetryConfig};

/// Dispatches chat/model operations to the strategy for a record's
/// declared kind, wrapping every chat connection attempt in
/// retry-with-full-jitter. One HTTP client is shared across strategies.
pub struct ProviderRouter {
    strategies: HashMap<ProviderKind, Arc<dyn ProviderStrategy>>,
    retry: RetryConfig,
}

impl ProviderRouter {
    /// Construct with all production strategies registered.
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        let client = reqwest::Client::new();
        let mut strategies: HashMap<ProviderKind, Arc<dyn ProviderStrategy>> = HashMap::new();
        let _ = strategies.insert(
            ProviderKind::OpenAi,
            Arc::new(OpenAiStrategy::new(client.clone(), Arc::clone(&secrets))),
        );
        let _ = strategies.insert(
            ProviderKind::Anthropic,
            Arc::new(AnthropicStrategy::new(client.clone(), Arc::clone(&secrets))),
        );
        let _ = strategies.insert(
            ProviderKind::Ollama,
            Arc::new(OllamaStrategy::new(client, secrets)),
        );
        Self {
            strategies,
            retry: RetryConfig::default(),
        }
    }

    /// Construct from explicit strategies (tests swap in mocks here).
    pub fn from_strategies(
        strategies: Vec<Arc<dyn ProviderStrategy>>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            strategies: strategies.into_iter().map(|s| (s.kind(), s)).collect(),
            retry,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Replace or add a strategy.
    pub fn register(&mut self, strategy: Arc<dyn ProviderStrategy>) {
        let _ = self.strategies.insert(strategy.kind(), strategy);
    }

    fn strategy(&self, kind: ProviderKind) -> Result<&Arc<dyn ProviderStrategy>, ProviderError> {
        self.strategies
            .get(&kind)
            .ok_or_else(|| ProviderError::UnsupportedKind(kind.to_string()))
    }

    /// Open a chat stream against the record's backend. The connection
    /// attempt retries with exponential backoff and full jitter; once a
    /// stream is handed out it is committed and never restarted.
    #[instrument(skip_all, fields(provider = %provider.name, kind = %provider.kind, model))]
    pub async fn chat(
        &self,
        provider: &ProviderRecord,
        model: &str,
        history: &[ChatMessage],
        tools: &[ToolDefinition],
        config: &Value,
    ) -> Result<ChatStream, ProviderError> {
        let strategy = self.strategy(provider.kind)?;
        retry_with_backoff(&self.retry, ProviderError::is_retryable, || {
            strategy.chat(provider, model, history, tools, config)
        })
        .await
    }

    pub async fn is_valid(&self, provider: &ProviderRecord) -> Result<bool, ProviderError> {
        Ok(self.strategy(provider.kind)?.is_valid(provider).await)
    }

    pub async fn is_model_ready(
        &self,
        provider: &ProviderRecord,
        model: &str,
    ) -> Result<bool, ProviderError> {
        Ok(self
            .strategy(provider.kind)?
            .is_model_ready(provider, model)
            .await)
    }

    pub async fn list_models(
        &self,
        provider: &ProviderRecord,
    ) -> Result<Vec<String>, ProviderError> {
        self.strategy(provider.kind)?.list_models(provider).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockChat, MockStrategy};
    use crucible_core::ids::ProviderId;
    use crucible_core::stream::ChatEvent;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    fn record(kind: ProviderKind) -> ProviderRecord {
        ProviderRecord {
            id: ProviderId::new(),
            name: "test".into(),
            kind,
            base_url: None,
            api_key: None,
            enabled: true,
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn dispatches_by_kind() {
        let mock = Arc::new(MockStrategy::new(vec![MockChat::text("hello")]));
        let router = ProviderRouter::from_strategies(vec![mock.clone()], fast_retry());

        let mut stream = router
            .chat(&record(ProviderKind::OpenAi), "m", &[], &[], &json!({}))
            .await
            .unwrap();
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event, ChatEvent::Text { content: "hello".into() });
    }

    #[tokio::test]
    async fn unknown_kind_fails_immediately() {
        let router = ProviderRouter::from_strategies(vec![], fast_retry());
        let err = router
            .chat(&record(ProviderKind::Anthropic), "m", &[], &[], &json!({}))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProviderError::UnsupportedKind(_)));
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let mock = Arc::new(MockStrategy::new(vec![
            MockChat::Error(ProviderError::Server { status: 503, body: "1".into() }),
            MockChat::Error(ProviderError::Server { status: 503, body: "2".into() }),
            MockChat::text("recovered"),
        ]));
        let router = ProviderRouter::from_strategies(vec![mock.clone()], fast_retry());

        let result = router
            .chat(&record(ProviderKind::OpenAi), "m", &[], &[], &json!({}))
            .await;
        assert!(result.is_ok());
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let mock = Arc::new(MockStrategy::new(vec![
            MockChat::Error(ProviderError::NotFound("no such model".into())),
            MockChat::text("unreachable"),
        ]));
        let router = ProviderRouter::from_strategies(vec![mock.clone()], fast_retry());

        let err = router
            .chat(&record(ProviderKind::OpenAi), "m", &[], &[], &json!({}))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProviderError::NotFound(_)));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_reraises_last_error() {
        let failures: Vec<MockChat> = (0..4)
            .map(|n| {
                MockChat::Error(ProviderError::Server {
                    status: 500,
                    body: format!("f{n}"),
                })
            })
            .collect();
        let mock = Arc::new(MockStrategy::new(failures));
        let router = ProviderRouter::from_strategies(vec![mock.clone()], fast_retry());

        let err = router
            .chat(&record(ProviderKind::OpenAi), "m", &[], &[], &json!({}))
            .await
            .err()
            .unwrap();
        match err {
            ProviderError::Server { body, .. } => assert_eq!(body, "f3"),
            other => panic!("expected server error, got {other:?}"),
        }
        assert_eq!(mock.call_count(), 4);
    }

    #[tokio::test]
    async fn list_models_delegates() {
        let mock = Arc::new(MockStrategy::new(vec![]));
        let router = ProviderRouter::from_strategies(vec![mock], fast_retry());
        let models = router
            .list_models(&record(ProviderKind::OpenAi))
            .await
            .unwrap();
        assert_eq!(models, vec!["mock-model"]);
        assert!(router
            .is_model_ready(&record(ProviderKind::OpenAi), "mock-model")
            .await
            .unwrap());
    }
}
