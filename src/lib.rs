//! Model-aware configuration for LLM-backed agent workflows.
//!
//! The crate provides:
//! - Gated fields (`GatedFieldSpec`) that reject, default or pass through a
//!   parameter depending on the configured model name.
//! - Provider configs (`LlmConfig`) whose sampling parameters are validated
//!   once at construction.
//! - A `LanguageModel` abstraction with thinking-prompt injection and retries.
//! - Data flywheel export of LLM spans to Elasticsearch (`flywheel`).

pub mod config;
mod error;
mod fields;
pub mod flywheel;
mod gating;
mod llm;
pub mod logging;
mod message;
mod providers;
mod retry;

pub use config::{AppConfig, TelemetryConfig};
pub use error::{NatError, Result};
pub use fields::{
    temperature_gate, thinking_gate, thinking_system_prompt, top_p_gate, SamplingParams,
};
pub use gating::{
    resolve_model_name, Classification, GatedFieldSpec, GatedFieldSpecBuilder, ModelIdentity,
    ModelPatterns, ResolvedModel, DEFAULT_MODEL_KEYS,
};
pub use llm::{
    build_model, patch_model, LanguageModel, ModelCompletion, OpenAICompatibleClient,
    RetryingModel, StubModel, StubReply, SystemPromptInjector, ThinkingInjector, ThinkingModel,
};
pub use logging::{init_logging, LoggingConfig};
pub use message::{Message, Role};
pub use providers::{
    AwsBedrockModelConfig, AwsBedrockModelParams, AzureOpenAIModelConfig, AzureOpenAIModelParams,
    LlmConfig, ModelConfig, NimModelConfig, NimModelParams, OpenAIModelConfig, OpenAIModelParams,
    ProviderParams, RetryParams,
};
pub use retry::RetryPolicy;
