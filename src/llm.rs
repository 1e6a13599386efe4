//! Chat model abstraction and the layers configured from [`LlmConfig`].

use std::collections::VecDeque;
use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{NatError, Result};
use crate::fields::SamplingParams;
use crate::message::{Message, Role};
use crate::providers::{AzureOpenAIModelConfig, LlmConfig, NimModelConfig, OpenAIModelConfig};
use crate::retry::RetryPolicy;

const NIM_BASE_URL: &str = "https://integrate.api.nvidia.com/v1";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Result of a chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelCompletion {
    pub content: Option<String>,
    pub finish_reason: Option<String>,
}

/// Minimal abstraction around a chat completion provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete_chat(&self, messages: &[Message]) -> Result<ModelCompletion>;
}

#[async_trait]
impl<M: LanguageModel + ?Sized> LanguageModel for Arc<M> {
    async fn complete_chat(&self, messages: &[Message]) -> Result<ModelCompletion> {
        (**self).complete_chat(messages).await
    }
}

#[derive(Clone)]
enum Auth {
    Bearer(String),
    ApiKey(String),
}

/// Client for any endpoint speaking the OpenAI chat completions protocol.
#[derive(Clone)]
pub struct OpenAICompatibleClient {
    http: reqwest::Client,
    provider: &'static str,
    url: String,
    auth: Auth,
    model: Option<String>,
    sampling: SamplingParams,
    max_tokens: Option<u32>,
    seed: Option<u64>,
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .map_err(|err| NatError::LanguageModel(format!("http client error: {err}")))
}

fn api_key(configured: Option<&String>, env_var: &str, provider: &str) -> Result<String> {
    configured
        .cloned()
        .or_else(|| env::var(env_var).ok())
        .ok_or_else(|| {
            NatError::LanguageModel(format!(
                "missing {provider} API key: set `api_key` or {env_var}"
            ))
        })
}

impl OpenAICompatibleClient {
    pub fn from_nim(cfg: &NimModelConfig) -> Result<Self> {
        let params = cfg.params();
        let base_url = params.base_url.as_deref().unwrap_or(NIM_BASE_URL);
        Ok(Self {
            http: http_client()?,
            provider: "nim",
            url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            auth: Auth::Bearer(api_key(params.api_key.as_ref(), "NVIDIA_API_KEY", "NIM")?),
            model: Some(params.model_name.clone()),
            sampling: *cfg.sampling(),
            max_tokens: params.max_tokens,
            seed: None,
        })
    }

    pub fn from_openai(cfg: &OpenAIModelConfig) -> Result<Self> {
        let params = cfg.params();
        let base_url = params.base_url.as_deref().unwrap_or(OPENAI_BASE_URL);
        Ok(Self {
            http: http_client()?,
            provider: "openai",
            url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            auth: Auth::Bearer(api_key(params.api_key.as_ref(), "OPENAI_API_KEY", "OpenAI")?),
            model: Some(params.model_name.clone()),
            sampling: *cfg.sampling(),
            max_tokens: None,
            seed: params.seed,
        })
    }

    pub fn from_azure(cfg: &AzureOpenAIModelConfig) -> Result<Self> {
        let params = cfg.params();
        let endpoint = params
            .azure_endpoint
            .clone()
            .or_else(|| env::var("AZURE_OPENAI_ENDPOINT").ok())
            .ok_or_else(|| {
                NatError::LanguageModel(
                    "missing Azure endpoint: set `azure_endpoint` or AZURE_OPENAI_ENDPOINT".into(),
                )
            })?;
        Ok(Self {
            http: http_client()?,
            provider: "azure_openai",
            url: format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                endpoint.trim_end_matches('/'),
                params.azure_deployment,
                params.api_version
            ),
            auth: Auth::ApiKey(api_key(
                params.api_key.as_ref(),
                "AZURE_OPENAI_API_KEY",
                "Azure OpenAI",
            )?),
            model: None,
            sampling: *cfg.sampling(),
            max_tokens: None,
            seed: None,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Request body for `messages`. Gated fields that are unset are omitted.
    pub fn payload(&self, messages: &[Message]) -> Value {
        let mut body = Map::new();
        if let Some(model) = &self.model {
            body.insert("model".into(), json!(model));
        }
        body.insert(
            "messages".into(),
            Value::Array(
                messages
                    .iter()
                    .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
                    .collect(),
            ),
        );
        if let Some(temperature) = self.sampling.temperature {
            body.insert("temperature".into(), json!(temperature));
        }
        if let Some(top_p) = self.sampling.top_p {
            body.insert("top_p".into(), json!(top_p));
        }
        if let Some(max_tokens) = self.max_tokens {
            body.insert("max_completion_tokens".into(), json!(max_tokens));
        }
        if let Some(seed) = self.seed {
            body.insert("seed".into(), json!(seed));
        }
        Value::Object(body)
    }
}

#[async_trait]
impl LanguageModel for OpenAICompatibleClient {
    async fn complete_chat(&self, messages: &[Message]) -> Result<ModelCompletion> {
        let mut builder = self.http.post(&self.url);
        builder = match &self.auth {
            Auth::Bearer(key) => builder.bearer_auth(key),
            Auth::ApiKey(key) => builder.header("api-key", key),
        };
        let resp = builder
            .json(&self.payload(messages))
            .send()
            .await
            .map_err(|err| {
                NatError::LanguageModel(format!("{} request error: {err}", self.provider))
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(NatError::Http {
                provider: self.provider.to_string(),
                status,
                body,
            });
        }

        let body: ChatResponse = resp.json().await.map_err(|err| {
            NatError::LanguageModel(format!("{} response parse error: {err}", self.provider))
        })?;
        let first = body.choices.into_iter().next().ok_or_else(|| {
            NatError::LanguageModel(format!("{} returned no choices", self.provider))
        })?;

        Ok(ModelCompletion {
            content: first.message.content,
            finish_reason: first.finish_reason,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// A scripted reply for [`StubModel`].
#[derive(Debug, Clone)]
pub enum StubReply {
    Text(String),
    Status(u16, String),
}

/// A deterministic model used for tests and demos. Records every request.
pub struct StubModel {
    replies: Mutex<VecDeque<StubReply>>,
    received: Mutex<Vec<Vec<Message>>>,
}

impl StubModel {
    pub fn new(responses: Vec<String>) -> Arc<Self> {
        Self::scripted(responses.into_iter().map(StubReply::Text).collect())
    }

    pub fn scripted(replies: Vec<StubReply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            received: Mutex::new(Vec::new()),
        })
    }

    /// Message lists seen so far, oldest first.
    pub fn received(&self) -> Vec<Vec<Message>> {
        self.received
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl LanguageModel for StubModel {
    async fn complete_chat(&self, messages: &[Message]) -> Result<ModelCompletion> {
        self.received
            .lock()
            .map_err(|_| NatError::LanguageModel("stub model poisoned".into()))?
            .push(messages.to_vec());
        let reply = self
            .replies
            .lock()
            .map_err(|_| NatError::LanguageModel("stub model poisoned".into()))?
            .pop_front()
            .ok_or_else(|| {
                NatError::LanguageModel("StubModel ran out of scripted responses".into())
            })?;

        match reply {
            StubReply::Text(content) => Ok(ModelCompletion {
                content: Some(content),
                finish_reason: Some("stop".into()),
            }),
            StubReply::Status(status, body) => Err(NatError::Http {
                provider: "stub".into(),
                status,
                body,
            }),
        }
    }
}

/// Rewrites the messages of every call before they reach the model.
pub trait ThinkingInjector: Send + Sync {
    fn system_prompt(&self) -> &str;
    fn inject(&self, messages: &[Message]) -> Vec<Message>;
}

/// Prepends the thinking prompt as a system message.
#[derive(Debug, Clone)]
pub struct SystemPromptInjector {
    system_prompt: String,
}

impl SystemPromptInjector {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
        }
    }
}

impl ThinkingInjector for SystemPromptInjector {
    fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    fn inject(&self, messages: &[Message]) -> Vec<Message> {
        let mut injected = Vec::with_capacity(messages.len() + 1);
        injected.push(Message::new(Role::System, self.system_prompt.clone()));
        injected.extend_from_slice(messages);
        injected
    }
}

pub struct ThinkingModel<M, I = SystemPromptInjector> {
    inner: M,
    injector: I,
}

impl<M: LanguageModel, I: ThinkingInjector> ThinkingModel<M, I> {
    pub fn new(inner: M, injector: I) -> Self {
        Self { inner, injector }
    }
}

#[async_trait]
impl<M: LanguageModel, I: ThinkingInjector> LanguageModel for ThinkingModel<M, I> {
    async fn complete_chat(&self, messages: &[Message]) -> Result<ModelCompletion> {
        let injected = self.injector.inject(messages);
        self.inner.complete_chat(&injected).await
    }
}

pub struct RetryingModel<M> {
    inner: M,
    policy: RetryPolicy,
}

impl<M: LanguageModel> RetryingModel<M> {
    pub fn new(inner: M, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<M: LanguageModel> LanguageModel for RetryingModel<M> {
    async fn complete_chat(&self, messages: &[Message]) -> Result<ModelCompletion> {
        self.policy
            .retry(|_| self.inner.complete_chat(messages))
            .await
    }
}

/// Layers thinking injection (when the config yields a prompt) and retries
/// around `model`.
pub fn patch_model(model: Arc<dyn LanguageModel>, cfg: &LlmConfig) -> Arc<dyn LanguageModel> {
    let mut model = model;
    if let Some(prompt) = cfg.thinking_system_prompt() {
        debug!(model = cfg.model_name(), prompt, "injecting thinking prompt");
        model = Arc::new(ThinkingModel::new(model, SystemPromptInjector::new(prompt)));
    }
    Arc::new(RetryingModel::new(model, RetryPolicy::from_params(cfg.retry())))
}

/// Builds the HTTP client for `cfg` with its configured layers.
pub fn build_model(cfg: &LlmConfig) -> Result<Arc<dyn LanguageModel>> {
    let client: Arc<dyn LanguageModel> = match cfg {
        LlmConfig::Nim(c) => Arc::new(OpenAICompatibleClient::from_nim(c)?),
        LlmConfig::Openai(c) => Arc::new(OpenAICompatibleClient::from_openai(c)?),
        LlmConfig::AzureOpenai(c) => Arc::new(OpenAICompatibleClient::from_azure(c)?),
        LlmConfig::AwsBedrock(_) => {
            return Err(NatError::LanguageModel(format!(
                "no chat client available for provider `{}`",
                cfg.type_name()
            )))
        }
    };
    Ok(patch_model(client, cfg))
}
