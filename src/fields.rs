//! Gated sampling fields shared by every LLM provider config.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{NatError, Result};
use crate::gating::{resolve_model_name, GatedFieldSpec, ModelIdentity, ModelPatterns, DEFAULT_MODEL_KEYS};

const GPT5_PATTERN: &str = r"gpt-?5";
// The two Nemotron families take different thinking prompts.
const NVIDIA_NEMOTRON_PATTERN: &str = r"^nvidia/nvidia.*nemotron";
const LLAMA_NEMOTRON_PATTERN: &str = r"^nvidia/llama.*nemotron";

pub const UNIT_MIN: f64 = 0.0;
pub const UNIT_MAX: f64 = 1.0;

static TEMPERATURE: LazyLock<GatedFieldSpec<f64>> = LazyLock::new(|| {
    GatedFieldSpec::builder(
        "temperature",
        ModelPatterns::unsupported([GPT5_PATTERN]).expect("static temperature pattern"),
    )
    .default_if_supported(0.0)
    .build()
    .expect("static temperature gate")
});

static TOP_P: LazyLock<GatedFieldSpec<f64>> = LazyLock::new(|| {
    GatedFieldSpec::builder(
        "top_p",
        ModelPatterns::unsupported([GPT5_PATTERN]).expect("static top_p pattern"),
    )
    .default_if_supported(1.0)
    .build()
    .expect("static top_p gate")
});

static THINKING: LazyLock<GatedFieldSpec<bool>> = LazyLock::new(|| {
    GatedFieldSpec::builder(
        "thinking",
        ModelPatterns::supported([NVIDIA_NEMOTRON_PATTERN, LLAMA_NEMOTRON_PATTERN])
            .expect("static thinking patterns"),
    )
    .build()
    .expect("static thinking gate")
});

static NVIDIA_NEMOTRON: LazyLock<Regex> = LazyLock::new(|| case_insensitive(NVIDIA_NEMOTRON_PATTERN));
static LLAMA_NEMOTRON: LazyLock<Regex> = LazyLock::new(|| case_insensitive(LLAMA_NEMOTRON_PATTERN));

fn case_insensitive(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .expect("static nemotron pattern")
}

/// Sampling temperature, unsupported on gpt-5 class models.
pub fn temperature_gate() -> &'static GatedFieldSpec<f64> {
    &TEMPERATURE
}

/// Nucleus sampling, unsupported on gpt-5 class models.
pub fn top_p_gate() -> &'static GatedFieldSpec<f64> {
    &TOP_P
}

/// Thinking toggle, only supported on Nemotron models.
pub fn thinking_gate() -> &'static GatedFieldSpec<bool> {
    &THINKING
}

fn check_unit_range(field: &str, value: Option<f64>) -> Result<()> {
    match value {
        Some(v) if !(UNIT_MIN..=UNIT_MAX).contains(&v) => Err(NatError::RangeViolation {
            field: field.to_string(),
            value: v,
            min: UNIT_MIN,
            max: UNIT_MAX,
        }),
        _ => Ok(()),
    }
}

/// Sampling parameters as supplied by the caller, before or after gating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Sampling temperature in [0, 1]. Defaults to 0.0 when the model supports it.
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Top-p for distribution sampling. Defaults to 1.0 when the model supports it.
    #[serde(default)]
    pub top_p: Option<f64>,
    /// Whether to enable thinking. Never sent to the provider as a parameter.
    #[serde(default, skip_serializing)]
    pub thinking: Option<bool>,
}

impl SamplingParams {
    /// Gates every field against the model `identity` names, then range-checks
    /// the numeric fields that survived gating.
    pub fn validate<I: ModelIdentity + ?Sized>(self, identity: &I) -> Result<Self> {
        let temperature = temperature_gate().validate(identity, self.temperature)?;
        check_unit_range(temperature_gate().field_name(), temperature)?;

        let top_p = top_p_gate().validate(identity, self.top_p)?;
        check_unit_range(top_p_gate().field_name(), top_p)?;

        let thinking = thinking_gate().validate(identity, self.thinking)?;

        Ok(Self {
            temperature,
            top_p,
            thinking,
        })
    }
}

/// System prompt that switches thinking on or off for the identified model.
///
/// Nemotron models served under `nvidia/nvidia-*` use `/think` and
/// `/no_think`; `nvidia/llama-*` Nemotron models use `detailed thinking on|off`.
/// Returns `None` when `thinking` is unset or the model belongs to neither family.
pub fn thinking_system_prompt<I: ModelIdentity + ?Sized>(
    identity: &I,
    thinking: Option<bool>,
) -> Option<&'static str> {
    let enabled = thinking?;
    let model = resolve_model_name(identity, DEFAULT_MODEL_KEYS)?;
    if NVIDIA_NEMOTRON.is_match(model.name) {
        Some(if enabled { "/think" } else { "/no_think" })
    } else if LLAMA_NEMOTRON.is_match(model.name) {
        Some(if enabled {
            "detailed thinking on"
        } else {
            "detailed thinking off"
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn model(key: &str, name: &str) -> HashMap<String, String> {
        HashMap::from([(key.to_string(), name.to_string())])
    }

    fn sampling(temperature: Option<f64>, top_p: Option<f64>, thinking: Option<bool>) -> SamplingParams {
        SamplingParams {
            temperature,
            top_p,
            thinking,
        }
    }

    #[test]
    fn gpt5_rejects_explicit_temperature() {
        for name in ["gpt-5", "gpt5-mini", "azure/GPT-5-chat"] {
            let err = sampling(Some(0.3), None, None)
                .validate(&model("model_name", name))
                .unwrap_err();
            assert_eq!(
                err.to_string(),
                format!("temperature is not supported for model_name: {name}")
            );
        }
    }

    #[test]
    fn gpt5_rejects_explicit_top_p() {
        let err = sampling(None, Some(0.9), None)
            .validate(&model("model", "gpt-5"))
            .unwrap_err();
        assert_eq!(err.to_string(), "top_p is not supported for model: gpt-5");
    }

    #[test]
    fn gpt5_leaves_absent_fields_unset() {
        let params = sampling(None, None, None)
            .validate(&model("model_name", "gpt-5"))
            .unwrap();
        assert_eq!(params, SamplingParams::default());
    }

    #[test]
    fn supported_models_receive_defaults() {
        let params = sampling(None, None, None)
            .validate(&model("model_name", "gpt-4o"))
            .unwrap();
        assert_eq!(params.temperature, Some(0.0));
        assert_eq!(params.top_p, Some(1.0));
        assert_eq!(params.thinking, None);
    }

    #[test]
    fn explicit_values_are_preserved() {
        let params = sampling(Some(0.7), Some(0.25), None)
            .validate(&model("azure_deployment", "gpt-4o-deploy"))
            .unwrap();
        assert_eq!(params.temperature, Some(0.7));
        assert_eq!(params.top_p, Some(0.25));
    }

    #[test]
    fn out_of_range_values_are_rejected_after_gating() {
        let err = sampling(Some(1.5), None, None)
            .validate(&model("model_name", "gpt-4o"))
            .unwrap_err();
        assert!(matches!(err, NatError::RangeViolation { ref field, .. } if field == "temperature"));

        let err = sampling(None, Some(-0.1), None)
            .validate(&HashMap::new())
            .unwrap_err();
        assert!(matches!(err, NatError::RangeViolation { ref field, .. } if field == "top_p"));

        assert!(sampling(Some(f64::NAN), None, None)
            .validate(&HashMap::new())
            .is_err());
    }

    #[test]
    fn gating_error_wins_over_range_error() {
        let err = sampling(Some(7.0), None, None)
            .validate(&model("model_name", "gpt-5"))
            .unwrap_err();
        assert!(matches!(err, NatError::GatingViolation { .. }));
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let params = sampling(Some(0.0), Some(1.0), None)
            .validate(&model("model_name", "gpt-4o"))
            .unwrap();
        assert_eq!(params.temperature, Some(0.0));
        assert_eq!(params.top_p, Some(1.0));
    }

    #[test]
    fn nvidia_nemotron_thinking_prompts() {
        let identity = model("model_name", "nvidia/nvidia-nemotron-8b");
        let on = sampling(None, None, Some(true)).validate(&identity).unwrap();
        assert_eq!(thinking_system_prompt(&identity, on.thinking), Some("/think"));
        let off = sampling(None, None, Some(false)).validate(&identity).unwrap();
        assert_eq!(thinking_system_prompt(&identity, off.thinking), Some("/no_think"));
    }

    #[test]
    fn llama_nemotron_thinking_prompts_case_insensitive() {
        let identity = model("model_name", "NVIDIA/LLaMa-3.1-Nemotron");
        let on = sampling(None, None, Some(true)).validate(&identity).unwrap();
        assert_eq!(
            thinking_system_prompt(&identity, on.thinking),
            Some("detailed thinking on")
        );

        let identity = model("model_name", "nvidia/llama-nemotron");
        assert_eq!(
            thinking_system_prompt(&identity, Some(false)),
            Some("detailed thinking off")
        );
    }

    #[test]
    fn thinking_default_remains_unset_on_supported_model() {
        let identity = model("model_name", "nvidia/llama-nemotron");
        let params = sampling(None, None, None).validate(&identity).unwrap();
        assert_eq!(params.thinking, None);
        assert_eq!(thinking_system_prompt(&identity, params.thinking), None);
    }

    #[test]
    fn thinking_rejected_on_other_models() {
        let identity = model("model_name", "gpt-4o");
        let params = sampling(None, None, None).validate(&identity).unwrap();
        assert_eq!(params.thinking, None);
        assert_eq!(thinking_system_prompt(&identity, params.thinking), None);

        let err = sampling(None, None, Some(true)).validate(&identity).unwrap_err();
        assert_eq!(err.to_string(), "thinking is not supported for model_name: gpt-4o");
    }

    #[test]
    fn thinking_detected_through_fallback_keys() {
        let identity = model("model", "nvidia/nvidia-some-nemotron");
        assert_eq!(thinking_system_prompt(&identity, Some(false)), Some("/no_think"));

        let identity = model("azure_deployment", "nvidia/llama3-nemotron");
        assert_eq!(
            thinking_system_prompt(&identity, Some(true)),
            Some("detailed thinking on")
        );
    }

    #[test]
    fn no_identifying_key_keeps_thinking_without_prompt() {
        let identity: HashMap<String, String> = HashMap::new();
        let params = sampling(None, None, Some(true)).validate(&identity).unwrap();
        assert_eq!(params.thinking, Some(true));
        assert_eq!(params.temperature, Some(0.0));
        assert_eq!(params.top_p, Some(1.0));
        assert_eq!(thinking_system_prompt(&identity, params.thinking), None);
    }
}
