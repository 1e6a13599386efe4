use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{NatError, Result};

pub const EVENT_TYPE: &str = "nat.event_type";
pub const EVENT_TIMESTAMP: &str = "nat.event_timestamp";
pub const FRAMEWORK: &str = "nat.framework";
pub const PROVIDER_HINT: &str = "nat.llm.provider";
pub const INPUT_VALUE: &str = "input.value";
pub const METADATA: &str = "nat.metadata";
pub const SUBSPAN_NAME: &str = "nat.subspan.name";
pub const FUNCTION_NAME: &str = "nat.function.name";
pub const RESPONSE_ID: &str = "response.id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanContext {
    pub trace_id: String,
    pub span_id: String,
}

/// A finished span as emitted by the workflow tracer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub name: String,
    #[serde(default)]
    pub context: Option<SpanContext>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub end_time: Option<i64>,
}

impl Span {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            context: None,
            attributes: Map::new(),
            start_time: 0,
            end_time: None,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key).filter(|v| !v.is_null())
    }

    /// String attribute, with enum-like values (numbers, bools) rendered as text.
    pub fn attribute_str(&self, key: &str) -> Option<String> {
        match self.attribute(key)? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageInfo {
    pub token_usage: TokenUsage,
    pub num_llm_calls: u64,
    pub seconds_between_calls: f64,
}

fn count(span: &Span, key: &str) -> u64 {
    span.attribute(key).and_then(Value::as_u64).unwrap_or(0)
}

pub fn extract_token_usage(span: &Span) -> TokenUsage {
    TokenUsage {
        prompt_tokens: count(span, "llm.token_count.prompt"),
        completion_tokens: count(span, "llm.token_count.completion"),
        total_tokens: count(span, "llm.token_count.total"),
    }
}

pub fn extract_usage_info(span: &Span) -> UsageInfo {
    UsageInfo {
        token_usage: extract_token_usage(span),
        num_llm_calls: count(span, "nat.usage.num_llm_calls"),
        seconds_between_calls: span
            .attribute("nat.usage.seconds_between_calls")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
    }
}

/// Event timestamp in whole seconds. Fractions are truncated; anything
/// unparseable yields 0.
pub fn extract_timestamp(span: &Span) -> i64 {
    let parsed = match span.attribute(EVENT_TIMESTAMP) {
        None => Some(0.0),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };
    match parsed.filter(|ts| ts.is_finite()) {
        Some(ts) => ts.trunc() as i64,
        None => {
            warn!(span = %span.name, "invalid timestamp in span, using 0");
            0
        }
    }
}

/// Span attributes may carry JSON either inline or as an encoded string.
pub fn deserialize_span_attribute(value: &Value) -> Result<Value> {
    match value {
        Value::Object(_) | Value::Array(_) => Ok(value.clone()),
        Value::String(raw) => serde_json::from_str(raw).map_err(|err| {
            NatError::TraceConversion(format!("failed to parse input_value: {raw}, error: {err}"))
        }),
        other => Err(NatError::TraceConversion(format!(
            "failed to parse input_value: {other}, expected a JSON string, object or array"
        ))),
    }
}
