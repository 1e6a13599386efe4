//! Data flywheel export: LLM spans become Elasticsearch records that feed
//! model customization.
//!
//! The pipeline is `Span -> DfwEsRecord -> JSON document -> batch -> sink`.
//! Which decoder reads a span is decided by [`TraceAdapterRegistry`].

pub mod convert;
pub mod exporter;
pub mod processor;
pub mod record;
pub mod registry;
pub mod source;
pub mod span;

pub use exporter::{
    bulk_body, BatchConfig, DfwElasticsearchConfig, DfwExporter, ElasticsearchSink, ExportStats,
    RecordSink,
};
pub use processor::{FalsyBatchFilter, Processor, RecordToJsonProcessor, SpanToRecordProcessor};
pub use record::{ContractVersion, DfwEsRecord};
pub use registry::TraceAdapterRegistry;
pub use source::{TraceContainer, TraceSource};
pub use span::{deserialize_span_attribute, Span};
