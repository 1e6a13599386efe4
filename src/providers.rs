//! LLM provider configuration.
//!
//! Every provider has a plain `*Params` struct that mirrors the configuration
//! file and a validated [`ModelConfig`] wrapper. The wrapper can only be built
//! through [`ModelConfig::new`] (or deserialization, which calls it), so its
//! gated sampling fields always hold their post-validation values.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{NatError, Result};
use crate::fields::{thinking_system_prompt, SamplingParams};
use crate::gating::ModelIdentity;

/// Retry behaviour shared by every provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryParams {
    #[serde(default = "default_num_retries")]
    pub num_retries: u32,
    #[serde(default = "default_retry_status_codes")]
    pub retry_on_status_codes: Vec<u16>,
    #[serde(default = "default_retry_errors")]
    pub retry_on_errors: Vec<String>,
}

impl Default for RetryParams {
    fn default() -> Self {
        Self {
            num_retries: default_num_retries(),
            retry_on_status_codes: default_retry_status_codes(),
            retry_on_errors: default_retry_errors(),
        }
    }
}

fn default_num_retries() -> u32 {
    5
}

fn default_retry_status_codes() -> Vec<u16> {
    vec![429, 500, 502, 503]
}

fn default_retry_errors() -> Vec<String> {
    vec!["Too Many Requests".into()]
}

/// Provider-specific parameters that carry gated sampling fields.
pub trait ProviderParams: ModelIdentity {
    /// Value of the `_type` tag in configuration files.
    const TYPE_NAME: &'static str;

    fn model_name(&self) -> &str;
    fn sampling(&self) -> &SamplingParams;
    fn sampling_mut(&mut self) -> &mut SamplingParams;
    fn retry(&self) -> &RetryParams;

    /// Constraints beyond the gated fields.
    fn check_constraints(&self) -> Result<()> {
        Ok(())
    }
}

fn check_positive(field: &str, value: Option<u32>) -> Result<()> {
    match value {
        Some(0) => Err(NatError::Config(format!("{field} must be greater than 0"))),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NimModelParams {
    #[serde(alias = "model")]
    pub model_name: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(flatten)]
    pub sampling: SamplingParams,
    #[serde(flatten)]
    pub retry: RetryParams,
}

impl ModelIdentity for NimModelParams {
    fn model_attribute(&self, key: &str) -> Option<&str> {
        match key {
            "model_name" => Some(&self.model_name),
            _ => None,
        }
    }
}

impl ProviderParams for NimModelParams {
    const TYPE_NAME: &'static str = "nim";

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn sampling(&self) -> &SamplingParams {
        &self.sampling
    }

    fn sampling_mut(&mut self) -> &mut SamplingParams {
        &mut self.sampling
    }

    fn retry(&self) -> &RetryParams {
        &self.retry
    }

    fn check_constraints(&self) -> Result<()> {
        check_positive("max_tokens", self.max_tokens)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAIModelParams {
    #[serde(alias = "model")]
    pub model_name: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(flatten)]
    pub sampling: SamplingParams,
    #[serde(flatten)]
    pub retry: RetryParams,
}

impl ModelIdentity for OpenAIModelParams {
    fn model_attribute(&self, key: &str) -> Option<&str> {
        match key {
            "model_name" => Some(&self.model_name),
            _ => None,
        }
    }
}

impl ProviderParams for OpenAIModelParams {
    const TYPE_NAME: &'static str = "openai";

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn sampling(&self) -> &SamplingParams {
        &self.sampling
    }

    fn sampling_mut(&mut self) -> &mut SamplingParams {
        &mut self.sampling
    }

    fn retry(&self) -> &RetryParams {
        &self.retry
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AzureOpenAIModelParams {
    pub azure_deployment: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_azure_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub azure_endpoint: Option<String>,
    #[serde(flatten)]
    pub sampling: SamplingParams,
    #[serde(flatten)]
    pub retry: RetryParams,
}

fn default_azure_api_version() -> String {
    "2025-04-01-preview".into()
}

impl ModelIdentity for AzureOpenAIModelParams {
    fn model_attribute(&self, key: &str) -> Option<&str> {
        match key {
            "azure_deployment" => Some(&self.azure_deployment),
            _ => None,
        }
    }
}

impl ProviderParams for AzureOpenAIModelParams {
    const TYPE_NAME: &'static str = "azure_openai";

    fn model_name(&self) -> &str {
        &self.azure_deployment
    }

    fn sampling(&self) -> &SamplingParams {
        &self.sampling
    }

    fn sampling_mut(&mut self) -> &mut SamplingParams {
        &mut self.sampling
    }

    fn retry(&self) -> &RetryParams {
        &self.retry
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwsBedrockModelParams {
    #[serde(alias = "model")]
    pub model_name: String,
    #[serde(default = "default_bedrock_tokens")]
    pub max_tokens: Option<u32>,
    /// Maximum input tokens. Only some client frameworks read it.
    #[serde(default = "default_bedrock_tokens")]
    pub context_size: Option<u32>,
    #[serde(default)]
    pub region_name: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub credentials_profile_name: Option<String>,
    #[serde(flatten)]
    pub sampling: SamplingParams,
    #[serde(flatten)]
    pub retry: RetryParams,
}

fn default_bedrock_tokens() -> Option<u32> {
    Some(1024)
}

impl ModelIdentity for AwsBedrockModelParams {
    fn model_attribute(&self, key: &str) -> Option<&str> {
        match key {
            "model_name" => Some(&self.model_name),
            _ => None,
        }
    }
}

impl ProviderParams for AwsBedrockModelParams {
    const TYPE_NAME: &'static str = "aws_bedrock";

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn sampling(&self) -> &SamplingParams {
        &self.sampling
    }

    fn sampling_mut(&mut self) -> &mut SamplingParams {
        &mut self.sampling
    }

    fn retry(&self) -> &RetryParams {
        &self.retry
    }

    fn check_constraints(&self) -> Result<()> {
        check_positive("max_tokens", self.max_tokens)?;
        check_positive("context_size", self.context_size)
    }
}

/// Validated provider configuration. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ModelConfig<P> {
    params: P,
}

pub type NimModelConfig = ModelConfig<NimModelParams>;
pub type OpenAIModelConfig = ModelConfig<OpenAIModelParams>;
pub type AzureOpenAIModelConfig = ModelConfig<AzureOpenAIModelParams>;
pub type AwsBedrockModelConfig = ModelConfig<AwsBedrockModelParams>;

impl<P: ProviderParams> ModelConfig<P> {
    pub fn new(mut params: P) -> Result<Self> {
        let sampling = params.sampling().validate(&params)?;
        *params.sampling_mut() = sampling;
        params.check_constraints()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &P {
        &self.params
    }

    pub fn model_name(&self) -> &str {
        self.params.model_name()
    }

    pub fn sampling(&self) -> &SamplingParams {
        self.params.sampling()
    }

    pub fn retry(&self) -> &RetryParams {
        self.params.retry()
    }

    pub fn thinking_system_prompt(&self) -> Option<&'static str> {
        thinking_system_prompt(&self.params, self.params.sampling().thinking)
    }

    pub fn into_params(self) -> P {
        self.params
    }
}

macro_rules! impl_try_from_params {
    ($($params:ty),+ $(,)?) => {
        $(
            impl TryFrom<$params> for ModelConfig<$params> {
                type Error = NatError;

                fn try_from(params: $params) -> Result<Self> {
                    Self::new(params)
                }
            }
        )+
    };
}

impl_try_from_params!(
    NimModelParams,
    OpenAIModelParams,
    AzureOpenAIModelParams,
    AwsBedrockModelParams,
);

impl<'de, P> Deserialize<'de> for ModelConfig<P>
where
    P: ProviderParams + Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let params = P::deserialize(deserializer)?;
        Self::new(params).map_err(serde::de::Error::custom)
    }
}

/// Any configured LLM provider, tagged by `_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type", rename_all = "snake_case")]
pub enum LlmConfig {
    Nim(NimModelConfig),
    Openai(OpenAIModelConfig),
    AzureOpenai(AzureOpenAIModelConfig),
    AwsBedrock(AwsBedrockModelConfig),
}

impl LlmConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            LlmConfig::Nim(_) => NimModelParams::TYPE_NAME,
            LlmConfig::Openai(_) => OpenAIModelParams::TYPE_NAME,
            LlmConfig::AzureOpenai(_) => AzureOpenAIModelParams::TYPE_NAME,
            LlmConfig::AwsBedrock(_) => AwsBedrockModelParams::TYPE_NAME,
        }
    }

    pub fn model_name(&self) -> &str {
        match self {
            LlmConfig::Nim(cfg) => cfg.model_name(),
            LlmConfig::Openai(cfg) => cfg.model_name(),
            LlmConfig::AzureOpenai(cfg) => cfg.model_name(),
            LlmConfig::AwsBedrock(cfg) => cfg.model_name(),
        }
    }

    pub fn sampling(&self) -> &SamplingParams {
        match self {
            LlmConfig::Nim(cfg) => cfg.sampling(),
            LlmConfig::Openai(cfg) => cfg.sampling(),
            LlmConfig::AzureOpenai(cfg) => cfg.sampling(),
            LlmConfig::AwsBedrock(cfg) => cfg.sampling(),
        }
    }

    pub fn retry(&self) -> &RetryParams {
        match self {
            LlmConfig::Nim(cfg) => cfg.retry(),
            LlmConfig::Openai(cfg) => cfg.retry(),
            LlmConfig::AzureOpenai(cfg) => cfg.retry(),
            LlmConfig::AwsBedrock(cfg) => cfg.retry(),
        }
    }

    pub fn thinking_system_prompt(&self) -> Option<&'static str> {
        match self {
            LlmConfig::Nim(cfg) => cfg.thinking_system_prompt(),
            LlmConfig::Openai(cfg) => cfg.thinking_system_prompt(),
            LlmConfig::AzureOpenai(cfg) => cfg.thinking_system_prompt(),
            LlmConfig::AwsBedrock(cfg) => cfg.thinking_system_prompt(),
        }
    }
}
