use std::time::Duration;

/// Typed error hierarchy for provider chat operations.
/// Classifies errors as non-retryable (clear client faults) or retryable.
///
/// The default policy is safe-retry: anything without a clear non-retryable
/// signal (HTTP 400/401/403/404) is treated as retryable, preferring a
/// spurious retry over dropped work.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProviderError {
    // Non-retryable
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unsupported provider type: {0}")]
    UnsupportedKind(String),
    #[error("missing API key reference for provider {0}")]
    MissingApiKey(String),

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("stream interrupted: {0}")]
    Stream(String),

    // Collaborator failures
    #[error("secret store error: {0}")]
    Secret(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Auth(_)
                | Self::InvalidRequest(_)
                | Self::NotFound(_)
                | Self::UnsupportedKind(_)
                | Self::MissingApiKey(_)
        )
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::UnsupportedKind(_) => "unsupported_kind",
            Self::MissingApiKey(_) => "missing_api_key",
            Self::RateLimited { .. } => "rate_limited",
            Self::Server { .. } => "server_error",
            Self::Network(_) => "network_error",
            Self::Stream(_) => "stream_interrupted",
            Self::Secret(_) => "secret_store",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            400 => Self::InvalidRequest(body),
            401 | 403 => Self::Auth(body),
            404 => Self::NotFound(body),
            429 => Self::RateLimited { retry_after: None },
            _ => Self::Server { status, body },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_retryable_classification() {
        assert!(!ProviderError::Auth("bad key".into()).is_retryable());
        assert!(!ProviderError::InvalidRequest("bad".into()).is_retryable());
        assert!(!ProviderError::NotFound("gone".into()).is_retryable());
        assert!(!ProviderError::UnsupportedKind("acme".into()).is_retryable());
        assert!(!ProviderError::MissingApiKey("p".into()).is_retryable());
    }

    #[test]
    fn retryable_by_default() {
        assert!(ProviderError::RateLimited { retry_after: None }.is_retryable());
        assert!(ProviderError::Server { status: 500, body: "err".into() }.is_retryable());
        assert!(ProviderError::Network("tcp".into()).is_retryable());
        assert!(ProviderError::Stream("eof".into()).is_retryable());
        assert!(ProviderError::Secret("down".into()).is_retryable());
    }

    #[test]
    fn from_status_mapping() {
        assert!(!ProviderError::from_status(400, "bad request".into()).is_retryable());
        assert!(!ProviderError::from_status(401, "unauthorized".into()).is_retryable());
        assert!(!ProviderError::from_status(403, "forbidden".into()).is_retryable());
        assert!(!ProviderError::from_status(404, "missing".into()).is_retryable());
        assert!(ProviderError::from_status(429, "rate limited".into()).is_retryable());
        assert!(ProviderError::from_status(500, "internal".into()).is_retryable());
        assert!(ProviderError::from_status(502, "bad gateway".into()).is_retryable());
        // Unmapped statuses default to retryable server errors
        assert!(ProviderError::from_status(418, "teapot".into()).is_retryable());
    }

    #[test]
    fn suggested_delay_only_for_rate_limit() {
        let rl = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
        };
        assert_eq!(rl.suggested_delay(), Some(Duration::from_secs(5)));

        let se = ProviderError::Server { status: 500, body: "err".into() };
        assert_eq!(se.suggested_delay(), None);
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(ProviderError::Auth("x".into()).error_kind(), "auth");
        assert_eq!(
            ProviderError::RateLimited { retry_after: None }.error_kind(),
            "rate_limited"
        );
        assert_eq!(ProviderError::Stream("x".into()).error_kind(), "stream_interrupted");
    }
}
