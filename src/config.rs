use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{NatError, Result};
use crate::flywheel::DfwElasticsearchConfig;
use crate::logging::LoggingConfig;
use crate::providers::LlmConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub data_flywheel: Option<DfwElasticsearchConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Named LLM providers, each validated against its model's gated fields.
    #[serde(default)]
    pub llms: BTreeMap<String, LlmConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(raw)
            .map_err(|err| NatError::Config(format!("failed to parse configuration: {}", err.message())))?;
        if let Some(dfw) = &cfg.telemetry.data_flywheel {
            dfw.batch.validate()?;
        }
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_env_or_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = Self::from_file(path)?;
        if let Ok(level) = env::var("NAT_LOG_LEVEL") {
            cfg.logging.level = level;
        }
        if let Ok(json) = env::var("NAT_LOG_JSON") {
            if let Ok(parsed) = json.parse::<bool>() {
                cfg.logging.json = parsed;
            }
        }
        if let Some(dfw) = cfg.telemetry.data_flywheel.as_mut() {
            if let Ok(endpoint) = env::var("NAT_DFW_ENDPOINT") {
                dfw.endpoint = endpoint;
            }
            if let Ok(index) = env::var("NAT_DFW_INDEX") {
                dfw.index = index;
            }
            if let Ok(username) = env::var("NAT_DFW_USERNAME") {
                dfw.username = Some(username);
            }
            if let Ok(password) = env::var("NAT_DFW_PASSWORD") {
                dfw.password = Some(password);
            }
        }
        Ok(cfg)
    }

    pub fn llm(&self, name: &str) -> Result<&LlmConfig> {
        self.llms
            .get(name)
            .ok_or_else(|| NatError::Config(format!("no llm named '{name}' is configured")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn loads_and_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[llms.planner]\n_type='nim'\nmodel_name='nvidia/nvidia-nemotron-nano-9b-v2'\nthinking=true\n\
             [logging]\nlevel='warn'\n\
             [telemetry.data_flywheel]\nclient_id='ci'\nindex='flywheel'\nendpoint='http://localhost:9200'\nbatch_size=10"
        )
        .unwrap();

        env::set_var("NAT_DFW_INDEX", "flywheel-test");
        env::set_var("NAT_LOG_JSON", "true");
        let cfg = AppConfig::from_env_or_file(file.path()).unwrap();
        env::remove_var("NAT_DFW_INDEX");
        env::remove_var("NAT_LOG_JSON");

        let planner = cfg.llm("planner").unwrap();
        assert_eq!(planner.thinking_system_prompt(), Some("/think"));
        assert_eq!(planner.sampling().temperature, Some(0.0));
        assert_eq!(cfg.logging.level, "warn");
        assert!(cfg.logging.json);

        let dfw = cfg.telemetry.data_flywheel.unwrap();
        assert_eq!(dfw.index, "flywheel-test");
        assert_eq!(dfw.batch.batch_size, 10);
        assert_eq!(dfw.batch.max_queue_size, 1000);
    }

    #[test]
    fn gating_errors_surface_as_config_errors() {
        let err = AppConfig::from_toml_str(
            "[llms.writer]\n_type='openai'\nmodel_name='gpt-5'\ntemperature=0.2\n",
        )
        .unwrap_err();
        assert!(matches!(err, NatError::Config(_)));
        assert!(err
            .to_string()
            .contains("temperature is not supported for model_name: gpt-5"));
    }

    #[test]
    fn zero_batch_size_fails_at_load() {
        let err = AppConfig::from_toml_str(
            "[telemetry.data_flywheel]\nclient_id='ci'\nindex='flywheel'\nendpoint='http://localhost:9200'\nbatch_size=0\n",
        )
        .unwrap_err();
        assert!(matches!(err, NatError::Config(_)));
        assert!(err.to_string().contains("batch_size must be greater than 0"));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = AppConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, AppConfig::default());
        assert!(cfg.llm("missing").is_err());
    }
}
