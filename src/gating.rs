//! Model-gated configuration fields.
//!
//! A gated field is an optional configuration value whose legality depends on
//! the model a configuration refers to. The model is found by probing an
//! ordered list of attribute names (`model_name`, `model`, `azure_deployment`)
//! and classified against a list of case-insensitive regular expressions:
//! - an explicit value on an unsupported model is rejected,
//! - an absent value on a supported (or unidentifiable) model takes the
//!   field's default.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::error::{NatError, Result};

/// Attribute names probed, in order, to identify the configured model.
pub const DEFAULT_MODEL_KEYS: &[&str] = &["model_name", "model", "azure_deployment"];

/// Read access to the string attributes that may identify a model.
pub trait ModelIdentity {
    /// Returns the attribute named `key` if the record has one.
    fn model_attribute(&self, key: &str) -> Option<&str>;
}

impl ModelIdentity for HashMap<String, String> {
    fn model_attribute(&self, key: &str) -> Option<&str> {
        self.get(key).map(String::as_str)
    }
}

impl ModelIdentity for BTreeMap<String, String> {
    fn model_attribute(&self, key: &str) -> Option<&str> {
        self.get(key).map(String::as_str)
    }
}

/// The attribute that identified the model and its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedModel<'a> {
    pub key: &'a str,
    pub name: &'a str,
}

/// Returns the first key whose attribute is present and non-empty.
pub fn resolve_model_name<'a, I, K>(identity: &'a I, keys: &'a [K]) -> Option<ResolvedModel<'a>>
where
    I: ModelIdentity + ?Sized,
    K: AsRef<str>,
{
    keys.iter().find_map(|key| {
        let key = key.as_ref();
        identity
            .model_attribute(key)
            .filter(|name| !name.is_empty())
            .map(|name| ResolvedModel { key, name })
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Supported,
    Unsupported,
    /// No identifying attribute was present.
    Unknown,
}

/// Which side of the support decision the patterns describe.
#[derive(Debug, Clone)]
pub enum ModelPatterns {
    /// Models matching any pattern support the field; all others do not.
    Supported(Vec<Regex>),
    /// Models matching any pattern do not support the field. An empty list
    /// supports every model.
    Unsupported(Vec<Regex>),
}

impl ModelPatterns {
    pub fn supported<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self::Supported(compile_patterns(patterns)?))
    }

    pub fn unsupported<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self::Unsupported(compile_patterns(patterns)?))
    }

    pub fn classify(&self, model_name: &str) -> Classification {
        match self {
            ModelPatterns::Supported(patterns) => {
                if patterns.iter().any(|p| p.is_match(model_name)) {
                    Classification::Supported
                } else {
                    Classification::Unsupported
                }
            }
            ModelPatterns::Unsupported(patterns) => {
                if patterns.iter().any(|p| p.is_match(model_name)) {
                    Classification::Unsupported
                } else {
                    Classification::Supported
                }
            }
        }
    }
}

fn compile_patterns<I, S>(patterns: I) -> Result<Vec<Regex>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    patterns
        .into_iter()
        .map(|pattern| {
            let pattern = pattern.as_ref();
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|err| {
                    NatError::InvalidGateSpec(format!("invalid model pattern `{pattern}`: {err}"))
                })
        })
        .collect()
}

/// Definition of one gated field, fixed when the owning config type is defined.
#[derive(Debug, Clone)]
pub struct GatedFieldSpec<T> {
    field_name: String,
    default_if_supported: Option<T>,
    keys: Vec<String>,
    patterns: ModelPatterns,
}

impl<T: Clone + fmt::Debug> GatedFieldSpec<T> {
    pub fn builder(field_name: impl Into<String>, patterns: ModelPatterns) -> GatedFieldSpecBuilder<T> {
        GatedFieldSpecBuilder {
            field_name: field_name.into(),
            default_if_supported: None,
            keys: DEFAULT_MODEL_KEYS.iter().map(|k| k.to_string()).collect(),
            patterns,
        }
    }

    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    pub fn default_if_supported(&self) -> Option<&T> {
        self.default_if_supported.as_ref()
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn patterns(&self) -> &ModelPatterns {
        &self.patterns
    }

    pub fn classify_for<I: ModelIdentity + ?Sized>(&self, identity: &I) -> Classification {
        match resolve_model_name(identity, &self.keys) {
            Some(model) => self.patterns.classify(model.name),
            None => Classification::Unknown,
        }
    }

    /// Applies the gating rules to the raw value supplied for this field.
    ///
    /// Returns the value the field should hold after construction.
    pub fn validate<I: ModelIdentity + ?Sized>(&self, identity: &I, raw: Option<T>) -> Result<Option<T>> {
        if let Some(model) = resolve_model_name(identity, &self.keys) {
            if self.patterns.classify(model.name) == Classification::Unsupported {
                return match raw {
                    Some(_) => Err(NatError::GatingViolation {
                        field: self.field_name.clone(),
                        key: model.key.to_string(),
                        model: model.name.to_string(),
                    }),
                    None => Ok(None),
                };
            }
        }

        match raw {
            Some(value) => Ok(Some(value)),
            None => {
                debug!(
                    field = %self.field_name,
                    default = ?self.default_if_supported,
                    "applying gated field default"
                );
                Ok(self.default_if_supported.clone())
            }
        }
    }
}

pub struct GatedFieldSpecBuilder<T> {
    field_name: String,
    default_if_supported: Option<T>,
    keys: Vec<String>,
    patterns: ModelPatterns,
}

impl<T> GatedFieldSpecBuilder<T> {
    pub fn default_if_supported(mut self, value: T) -> Self {
        self.default_if_supported = Some(value);
        self
    }

    /// Replaces the default model keys.
    pub fn keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> Result<GatedFieldSpec<T>> {
        if self.field_name.is_empty() {
            return Err(NatError::InvalidGateSpec("field_name must be provided".into()));
        }
        if self.keys.is_empty() {
            return Err(NatError::InvalidGateSpec(format!(
                "keys must be non-empty for gated field `{}`",
                self.field_name
            )));
        }
        Ok(GatedFieldSpec {
            field_name: self.field_name,
            default_if_supported: self.default_if_supported,
            keys: self.keys,
            patterns: self.patterns,
        })
    }
}
