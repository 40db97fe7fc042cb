use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// The filter argument is a directive string like `info` or
/// `crucible_engine=debug,info`; `RUST_LOG` overrides it when set.
/// With `json` set, output is line-delimited JSON for log shippers.
///
/// Calling this twice is a no-op (the second set_global_default fails and
/// is ignored) so tests may call it freely.
pub fn init_logging(default_filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let result = if json {
        tracing::subscriber::set_global_default(
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .finish(),
        )
    } else {
        tracing::subscriber::set_global_default(
            tracing_subscriber::fmt().with_env_filter(filter).finish(),
        )
    };

    if result.is_err() {
        tracing::debug!("global tracing subscriber already set");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_logging("info", false);
        init_logging("debug", true);
        // Second call must not panic; logging still works.
        tracing::info!("telemetry test log line");
    }
}
