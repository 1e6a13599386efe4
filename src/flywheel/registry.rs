//! Dispatch table from trace source kinds to decoders and record converters.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use super::convert::convert_openai;
use super::record::DfwEsRecord;
use super::source::{decode_openai, RawTraceSource, TraceContainer, TraceSource};
use super::span::{Span, FRAMEWORK, INPUT_VALUE, METADATA, PROVIDER_HINT};
use crate::error::{NatError, Result};

pub const DEFAULT_FRAMEWORK: &str = "langchain";

pub type Decoder = Arc<dyn Fn(&RawTraceSource<'_>) -> Result<TraceSource> + Send + Sync>;
pub type Converter<T> = Arc<dyn Fn(&TraceContainer) -> Result<T> + Send + Sync>;

struct ConverterEntry {
    target: &'static str,
    // Always a `Converter<T>` for the `TypeId` it is keyed under.
    converter: Box<dyn Any + Send + Sync>,
}

impl ConverterEntry {
    fn new<T: 'static>(converter: Converter<T>) -> Self {
        Self {
            target: short_name::<T>(),
            converter: Box::new(converter),
        }
    }
}

struct SourceEntry {
    kind: String,
    decoder: Decoder,
    converters: HashMap<TypeId, ConverterEntry>,
}

/// Last path segment of `T`, or the full name for generic types.
fn short_name<T: ?Sized>() -> &'static str {
    let full = type_name::<T>();
    if full.contains('<') {
        return full;
    }
    full.rsplit("::").next().unwrap_or(full)
}

/// Registered trace sources, tried in registration order when a span carries
/// no provider hint.
#[derive(Default)]
pub struct TraceAdapterRegistry {
    sources: RwLock<Vec<SourceEntry>>,
}

impl TraceAdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `openai` and `nim` sources converting to [`DfwEsRecord`].
    pub fn with_defaults() -> Self {
        let decoder: Decoder = Arc::new(decode_openai);
        let converter: Converter<DfwEsRecord> = Arc::new(convert_openai);
        let sources = ["openai", "nim"]
            .into_iter()
            .map(|kind| SourceEntry {
                kind: kind.to_string(),
                decoder: decoder.clone(),
                converters: HashMap::from([(
                    TypeId::of::<DfwEsRecord>(),
                    ConverterEntry::new(converter.clone()),
                )]),
            })
            .collect();
        Self {
            sources: RwLock::new(sources),
        }
    }

    /// Adds a source kind, or replaces the decoder of an existing one.
    pub fn register_source<D>(&self, kind: &str, decoder: D)
    where
        D: Fn(&RawTraceSource<'_>) -> Result<TraceSource> + Send + Sync + 'static,
    {
        let decoder: Decoder = Arc::new(decoder);
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        match sources.iter_mut().find(|entry| entry.kind == kind) {
            Some(entry) => entry.decoder = decoder,
            None => sources.push(SourceEntry {
                kind: kind.to_string(),
                decoder,
                converters: HashMap::new(),
            }),
        }
        debug!(kind, "registered trace source");
    }

    /// Registers the converter from `kind` to `T`, replacing any earlier one.
    pub fn register_adapter<T, F>(&self, kind: &str, converter: F) -> Result<()>
    where
        T: 'static,
        F: Fn(&TraceContainer) -> Result<T> + Send + Sync + 'static,
    {
        let converter: Converter<T> = Arc::new(converter);
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        let entry = sources
            .iter_mut()
            .find(|entry| entry.kind == kind)
            .ok_or_else(|| {
                NatError::TraceConversion(format!("no trace source registered for kind '{kind}'"))
            })?;
        entry
            .converters
            .insert(TypeId::of::<T>(), ConverterEntry::new(converter));
        debug!(kind, target = short_name::<T>(), "registered trace adapter");
        Ok(())
    }

    /// Removes the `kind -> T` converter. A source left without converters is
    /// removed as well.
    pub fn unregister_adapter<T: 'static>(&self, kind: &str) -> bool {
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        let Some(pos) = sources.iter().position(|entry| entry.kind == kind) else {
            return false;
        };
        let removed = sources[pos].converters.remove(&TypeId::of::<T>()).is_some();
        if sources[pos].converters.is_empty() {
            sources.remove(pos);
        }
        removed
    }

    /// Removes `kind` and all its converters, returning how many converters went.
    pub fn unregister_all_adapters(&self, kind: &str) -> usize {
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        match sources.iter().position(|entry| entry.kind == kind) {
            Some(pos) => sources.remove(pos).converters.len(),
            None => 0,
        }
    }

    pub fn clear(&self) -> usize {
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        sources.drain(..).map(|entry| entry.converters.len()).sum()
    }

    /// `(source kind, target type)` pairs, sorted.
    pub fn list_registered(&self) -> Vec<(String, &'static str)> {
        let sources = self.sources.read().unwrap_or_else(PoisonError::into_inner);
        let mut pairs: Vec<_> = sources
            .iter()
            .flat_map(|entry| {
                entry
                    .converters
                    .values()
                    .map(|conv| (entry.kind.clone(), conv.target))
            })
            .collect();
        pairs.sort();
        pairs
    }

    fn adapter_summary(&self) -> String {
        let names: Vec<String> = self
            .list_registered()
            .into_iter()
            .map(|(kind, target)| format!("{kind} -> {target}"))
            .collect();
        format!("[{}]", names.join(", "))
    }

    /// Decodes the trace source carried by `span`.
    pub fn trace_container(&self, span: &Span, client_id: &str) -> Result<TraceContainer> {
        let framework = span
            .attribute_str(FRAMEWORK)
            .unwrap_or_else(|| DEFAULT_FRAMEWORK.to_string());
        let raw = RawTraceSource {
            framework: &framework,
            client_id,
            input_value: span.attribute(INPUT_VALUE),
            metadata: span.attribute(METADATA),
        };

        let decoders: Vec<(String, Decoder)> = {
            let sources = self.sources.read().unwrap_or_else(PoisonError::into_inner);
            let hinted = span
                .attribute_str(PROVIDER_HINT)
                .and_then(|hint| sources.iter().find(|entry| entry.kind == hint));
            match hinted {
                Some(entry) => vec![(entry.kind.clone(), entry.decoder.clone())],
                None => sources
                    .iter()
                    .map(|entry| (entry.kind.clone(), entry.decoder.clone()))
                    .collect(),
            }
        };

        let mut last_error = None;
        for (kind, decoder) in decoders {
            match decoder(&raw) {
                Ok(source) => {
                    debug!(kind = %kind, framework = %framework, "detected trace source");
                    return Ok(TraceContainer {
                        kind,
                        source,
                        span: span.clone(),
                    });
                }
                Err(err) => last_error = Some(err),
            }
        }

        let original = last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no trace sources registered".into());
        Err(NatError::TraceConversion(format!(
            "Trace source schema detection failed for framework '{framework}'. \
             Span data structure doesn't match any registered trace source schemas. \
             Available registered adapters: {}. Original error: {original}",
            self.adapter_summary()
        )))
    }

    pub fn convert<T: 'static>(&self, container: &TraceContainer) -> Result<T> {
        let converter: Converter<T> = {
            let sources = self.sources.read().unwrap_or_else(PoisonError::into_inner);
            let entry = sources.iter().find(|entry| entry.kind == container.kind);
            let found = entry
                .and_then(|entry| entry.converters.get(&TypeId::of::<T>()))
                .and_then(|conv| conv.converter.downcast_ref::<Converter<T>>())
                .cloned();
            match found {
                Some(converter) => converter,
                None => {
                    let mut available: Vec<&str> = entry
                        .map(|entry| entry.converters.values().map(|c| c.target).collect())
                        .unwrap_or_default();
                    available.sort_unstable();
                    return Err(NatError::TraceConversion(format!(
                        "no converter registered for {} -> {}. Available targets: [{}]",
                        container.kind,
                        short_name::<T>(),
                        available.join(", ")
                    )));
                }
            }
        };
        converter(container)
    }

    /// Decodes `span` and converts it to `T`.
    pub fn span_to_record<T: 'static>(&self, span: &Span, client_id: &str) -> Result<T> {
        let container = self.trace_container(span, client_id)?;
        self.convert(&container)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn llm_span(provider: Option<&str>) -> Span {
        let span = Span::new("llm")
            .with_attribute(INPUT_VALUE, json!([{"type": "human", "content": "hi"}]))
            .with_attribute(
                METADATA,
                json!({"chat_responses": [{"message": {"content": "hello"}}]}),
            );
        match provider {
            Some(p) => span.with_attribute(PROVIDER_HINT, p),
            None => span,
        }
    }

    #[test]
    fn defaults_list_both_sources() {
        let registry = TraceAdapterRegistry::with_defaults();
        assert_eq!(
            registry.list_registered(),
            vec![
                ("nim".to_string(), "DfwEsRecord"),
                ("openai".to_string(), "DfwEsRecord")
            ]
        );
    }

    #[test]
    fn provider_hint_selects_source() {
        let registry = TraceAdapterRegistry::with_defaults();
        let container = registry.trace_container(&llm_span(Some("nim")), "ci").unwrap();
        assert_eq!(container.kind, "nim");
        assert_eq!(container.source.framework, DEFAULT_FRAMEWORK);

        let container = registry.trace_container(&llm_span(None), "ci").unwrap();
        assert_eq!(container.kind, "openai");

        let container = registry
            .trace_container(&llm_span(Some("unknown")), "ci")
            .unwrap();
        assert_eq!(container.kind, "openai");
    }

    #[test]
    fn detection_failure_lists_adapters() {
        let registry = TraceAdapterRegistry::with_defaults();
        let span = Span::new("llm").with_attribute(FRAMEWORK, "llama_index");
        let err = registry.trace_container(&span, "ci").unwrap_err().to_string();
        assert!(err.contains("Trace source schema detection failed for framework 'llama_index'"));
        assert!(err.contains("nim -> DfwEsRecord"));
        assert!(err.contains("input value is required"));
    }

    #[test]
    fn missing_converter_names_available_targets() {
        let registry = TraceAdapterRegistry::with_defaults();
        let container = registry.trace_container(&llm_span(None), "ci").unwrap();
        let err = registry.convert::<String>(&container).unwrap_err().to_string();
        assert!(err.contains("openai -> String"));
        assert!(err.contains("[DfwEsRecord]"));
    }

    #[test]
    fn custom_adapters_and_removal() {
        let registry = TraceAdapterRegistry::with_defaults();
        registry
            .register_adapter::<String, _>("openai", |c| Ok(c.source.client_id.clone()))
            .unwrap();
        let container = registry.trace_container(&llm_span(None), "client-7").unwrap();
        assert_eq!(registry.convert::<String>(&container).unwrap(), "client-7");

        assert!(registry
            .register_adapter::<String, _>("bedrock", |_| Ok(String::new()))
            .is_err());

        assert!(registry.unregister_adapter::<String>("openai"));
        assert!(!registry.unregister_adapter::<String>("openai"));
        assert_eq!(registry.unregister_all_adapters("nim"), 1);
        assert_eq!(registry.unregister_all_adapters("nim"), 0);
        assert_eq!(registry.clear(), 1);
        assert!(registry.list_registered().is_empty());
    }

    #[test]
    fn generic_targets_keep_full_type_name() {
        let registry = TraceAdapterRegistry::with_defaults();
        registry
            .register_adapter::<Vec<String>, _>("nim", |c| Ok(vec![c.kind.clone()]))
            .unwrap();
        let names: Vec<&str> = registry
            .list_registered()
            .into_iter()
            .filter(|(kind, _)| kind == "nim")
            .map(|(_, target)| target)
            .collect();
        assert!(names.contains(&"DfwEsRecord"));
        assert!(names.contains(&type_name::<Vec<String>>()));
        assert!(type_name::<Vec<String>>().ends_with("Vec<alloc::string::String>"));

        let container = registry.trace_container(&llm_span(Some("nim")), "ci").unwrap();
        assert_eq!(registry.convert::<Vec<String>>(&container).unwrap(), vec!["nim"]);
    }

    #[test]
    fn last_converter_removal_drops_source() {
        let registry = TraceAdapterRegistry::with_defaults();
        assert!(registry.unregister_adapter::<DfwEsRecord>("openai"));
        let container = registry.trace_container(&llm_span(None), "ci").unwrap();
        assert_eq!(container.kind, "nim");
    }
}
