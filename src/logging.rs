//! Tracing subscriber setup.

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{Result, ResultExt as _};

/// Install the global subscriber. `RUST_LOG` wins over `cfg.level`.
///
/// Fails (rather than panicking) when a subscriber is already installed or
/// the JSON log file cannot be opened.
pub fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .ctx_config(&format!("invalid log level {:?}", cfg.level))?;

    let registry = tracing_subscriber::registry().with(filter);

    if cfg.json_stdout {
        let json_layer = tracing_subscriber::fmt::layer().json();
        registry.with(json_layer).try_init().ctx_config("install subscriber")
    } else if !cfg.json_log_file.is_empty() {
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.json_log_file)
            .ctx_config(&format!("open json log file {}", cfg.json_log_file))?;
        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::sync::Mutex::new(log_file));
        let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        registry
            .with(file_layer)
            .with(console_layer)
            .try_init()
            .ctx_config("install subscriber")
    } else {
        let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        registry.with(console_layer).try_init().ctx_config("install subscriber")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unopenable_log_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = LoggingConfig {
            json_log_file: dir.path().join("missing").join("log.jsonl").display().to_string(),
            ..LoggingConfig::default()
        };
        let err = init_logging(&cfg).unwrap_err();
        assert!(matches!(err, crate::error::FishoilError::Config(_)));
    }
}
