//! Trace sources decoded from LLM span attributes.

use serde::Deserialize;
use serde_json::{Map, Value};

use super::span::{deserialize_span_attribute, Span};
use crate::error::{NatError, Result};

/// One chat message as recorded by the framework callback handler.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceMessage {
    #[serde(default, rename = "type", alias = "role")]
    pub kind: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub response_metadata: Option<Map<String, Value>>,
    #[serde(default)]
    pub additional_kwargs: Option<Map<String, Value>>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SourceMetadata {
    #[serde(default)]
    pub tools_schema: Option<Vec<Value>>,
    #[serde(default)]
    pub chat_responses: Option<Vec<Value>>,
}

/// Decoded trace source shared by OpenAI-compatible providers.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceSource {
    pub framework: String,
    pub client_id: String,
    pub input_value: Vec<SourceMessage>,
    pub metadata: SourceMetadata,
}

/// Undecoded source fields pulled off a span.
#[derive(Debug, Clone, Copy)]
pub struct RawTraceSource<'a> {
    pub framework: &'a str,
    pub client_id: &'a str,
    pub input_value: Option<&'a Value>,
    pub metadata: Option<&'a Value>,
}

/// A span paired with the source decoded from it and the kind of decoder that matched.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceContainer {
    pub kind: String,
    pub source: TraceSource,
    pub span: Span,
}

fn decode_messages(value: Option<&Value>) -> Result<Vec<SourceMessage>> {
    let value = value.ok_or_else(|| NatError::TraceConversion("input value is required".into()))?;
    let value = match value {
        encoded @ Value::String(_) => deserialize_span_attribute(encoded)?,
        other => other.clone(),
    };
    let items = match value {
        Value::Object(_) => vec![value],
        Value::Array(items) => items,
        other => {
            return Err(NatError::TraceConversion(format!(
                "invalid input_value format: {other}"
            )))
        }
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(_) => Ok(serde_json::from_value(item)?),
            other => Err(NatError::TraceConversion(format!(
                "invalid message format: {other}"
            ))),
        })
        .collect()
}

fn decode_metadata(value: Option<&Value>) -> Result<SourceMetadata> {
    let value = match value {
        None => return Ok(SourceMetadata::default()),
        Some(encoded @ Value::String(_)) => deserialize_span_attribute(encoded)?,
        Some(other) => other.clone(),
    };
    match value {
        Value::Object(_) => Ok(serde_json::from_value(value)?),
        other => Err(NatError::TraceConversion(format!(
            "invalid metadata format: {other}"
        ))),
    }
}

/// Decodes the OpenAI chat message layout. NIM spans share it.
pub fn decode_openai(raw: &RawTraceSource<'_>) -> Result<TraceSource> {
    Ok(TraceSource {
        framework: raw.framework.to_string(),
        client_id: raw.client_id.to_string(),
        input_value: decode_messages(raw.input_value)?,
        metadata: decode_metadata(raw.metadata)?,
    })
}
