use tracing_subscriber::{prelude::*, EnvFilter, Layer, Registry};

/// Selects JSON log lines instead of the compact human format.
pub const LOG_FORMAT_ENV: &str = "HARBOR_LOG_FORMAT";

fn json_requested(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("json"))
}

/// Installs the global subscriber; `RUST_LOG` filters, defaulting to `info`.
pub async fn init() {
    let format = std::env::var(LOG_FORMAT_ENV).ok();
    let logger: Box<dyn Layer<Registry> + Send + Sync> = if json_requested(format.as_deref()) {
        tracing_subscriber::fmt::layer().json().with_current_span(true).boxed()
    } else {
        tracing_subscriber::fmt::layer().compact().boxed()
    };
    let env_filter = EnvFilter::try_from_default_env()
        .or(EnvFilter::try_new("info"))
        .unwrap_or_default();

    let collector = Registry::default().with(logger).with(env_filter);
    if tracing::subscriber::set_global_default(collector).is_err() {
        tracing::debug!("global tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_is_opt_in() {
        assert!(json_requested(Some("JSON")));
        assert!(!json_requested(Some("compact")));
        assert!(!json_requested(None));
    }
}
