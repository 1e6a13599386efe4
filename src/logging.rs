//! Tracing subscriber setup.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{NatError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit one JSON object per event instead of compact text.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

fn default_level() -> String {
    "info".into()
}

impl LoggingConfig {
    pub(crate) fn filter(&self) -> EnvFilter {
        // RUST_LOG wins over the configured level.
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let registry = tracing_subscriber::registry().with(config.filter());
    let installed = if config.json {
        registry
            .with(fmt::layer().json())
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).compact())
            .try_init()
    };
    installed.map_err(|err| NatError::Config(format!("failed to init tracing: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_info_text() {
        let cfg: LoggingConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, LoggingConfig::default());
        assert_eq!(cfg.level, "info");
        assert!(!cfg.json);
    }

    #[test]
    fn second_init_is_an_error() {
        // Keep the process-wide subscriber on the captured test writer.
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let cfg = LoggingConfig {
            level: "debug".into(),
            json: true,
        };
        let err = init_logging(&cfg).unwrap_err();
        assert!(err.to_string().starts_with("configuration error: failed to init tracing"));
    }
}
