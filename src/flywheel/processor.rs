use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::record::{ContractVersion, DfwEsRecord};
use super::registry::TraceAdapterRegistry;
use super::span::{Span, EVENT_TYPE};
use crate::error::Result;

pub const LLM_START: &str = "LLM_START";

/// One stage of the export pipeline.
#[async_trait]
pub trait Processor<In: Send + 'static, Out>: Send + Sync {
    async fn process(&self, item: In) -> Result<Out>;
}

/// Converts `LLM_START` spans into records of type `T`; other spans yield `None`.
pub struct SpanToRecordProcessor<T = DfwEsRecord> {
    registry: Arc<TraceAdapterRegistry>,
    client_id: String,
    _record: PhantomData<fn() -> T>,
}

impl<T> SpanToRecordProcessor<T> {
    pub fn new(registry: Arc<TraceAdapterRegistry>, client_id: impl Into<String>) -> Self {
        Self {
            registry,
            client_id: client_id.into(),
            _record: PhantomData,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[async_trait]
impl<T: Send + 'static> Processor<Span, Option<T>> for SpanToRecordProcessor<T> {
    async fn process(&self, item: Span) -> Result<Option<T>> {
        match item.attribute_str(EVENT_TYPE).as_deref() {
            Some(LLM_START) => self
                .registry
                .span_to_record::<T>(&item, &self.client_id)
                .map(Some),
            other => {
                debug!(event_type = ?other, "skipping span with unsupported event type");
                Ok(None)
            }
        }
    }
}

/// Serializes records for the configured contract version. `None` becomes `{}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordToJsonProcessor {
    version: ContractVersion,
}

impl RecordToJsonProcessor {
    pub fn new(version: ContractVersion) -> Self {
        Self { version }
    }
}

#[async_trait]
impl Processor<Option<DfwEsRecord>, Value> for RecordToJsonProcessor {
    async fn process(&self, item: Option<DfwEsRecord>) -> Result<Value> {
        match item {
            Some(record) => record.to_document(self.version),
            None => Ok(Value::Object(Default::default())),
        }
    }
}

pub fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
    }
}

/// Drops falsy documents (null, `false`, zero, empty strings and containers) from a batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct FalsyBatchFilter;

#[async_trait]
impl Processor<Vec<Value>, Vec<Value>> for FalsyBatchFilter {
    async fn process(&self, item: Vec<Value>) -> Result<Vec<Value>> {
        Ok(item.into_iter().filter(|doc| !is_falsy(doc)).collect())
    }
}
