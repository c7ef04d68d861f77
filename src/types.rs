//! Common type definitions used throughout the engine

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};
use crate::model::ModelFamily;

pub(crate) const DEFAULT_MAX_LENGTH: usize = 50;
pub(crate) const DEFAULT_TEMPERATURE: f64 = 0.7;
pub(crate) const DEFAULT_TOP_K: usize = 50;
pub(crate) const DEFAULT_TOP_P: f64 = 0.95;

/// Floating point width a generation model is loaded at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NumericPrecision {
    #[default]
    Float32,
    Float16,
    BFloat16,
    Float64,
}

impl NumericPrecision {
    /// Parse a precision name. Accepts torch-style names with or without the
    /// `torch.` prefix and the usual short spellings.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim().to_lowercase();
        let name = name.strip_prefix("torch.").unwrap_or(&name);
        match name {
            "float32" | "float" | "fp32" | "f32" => Some(NumericPrecision::Float32),
            "float16" | "half" | "fp16" | "f16" => Some(NumericPrecision::Float16),
            "bfloat16" | "bf16" => Some(NumericPrecision::BFloat16),
            "float64" | "double" | "fp64" | "f64" => Some(NumericPrecision::Float64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NumericPrecision::Float32 => "float32",
            NumericPrecision::Float16 => "float16",
            NumericPrecision::BFloat16 => "bfloat16",
            NumericPrecision::Float64 => "float64",
        }
    }

    pub fn dtype(&self) -> candle_core::DType {
        match self {
            NumericPrecision::Float32 => candle_core::DType::F32,
            NumericPrecision::Float16 => candle_core::DType::F16,
            NumericPrecision::BFloat16 => candle_core::DType::BF16,
            NumericPrecision::Float64 => candle_core::DType::F64,
        }
    }
}

impl fmt::Display for NumericPrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for NumericPrecision {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for NumericPrecision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(NumericPrecision::parse(&name).unwrap_or_else(|| {
            tracing::warn!(precision = %name, "Unrecognized numeric precision, using float32");
            NumericPrecision::default()
        }))
    }
}

/// Generation parameters carried by a descriptor. Unknown keys are ignored and
/// missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParameters {
    #[serde(alias = "torch_dtype")]
    pub numeric_precision: NumericPrecision,
    pub max_length: usize,
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            numeric_precision: NumericPrecision::default(),
            max_length: DEFAULT_MAX_LENGTH,
            temperature: DEFAULT_TEMPERATURE,
            top_k: DEFAULT_TOP_K,
            top_p: DEFAULT_TOP_P,
        }
    }
}

impl GenerationParameters {
    pub fn validate(&self) -> Result<()> {
        if self.max_length == 0 {
            return Err(EngineError::validation("max_length", "must be a positive integer"));
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(EngineError::validation("temperature", "must be a positive number"));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(EngineError::validation("top_p", "must be in (0, 1]"));
        }
        Ok(())
    }
}

/// Where to load a model from and how to run it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescriptor {
    pub locator: String,
    pub parameters: GenerationParameters,
}

impl ModelDescriptor {
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            parameters: GenerationParameters::default(),
        }
    }

    pub fn with_parameters(mut self, parameters: GenerationParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn family(&self) -> ModelFamily {
        ModelFamily::from_locator(&self.locator)
    }

    pub fn validate(&self) -> Result<()> {
        if self.locator.trim().is_empty() {
            return Err(EngineError::validation("model.locator", "must not be empty"));
        }
        self.parameters.validate()
    }
}

/// Remove the first of `keys` present in `map`.
fn take_any(map: &mut Map<String, Value>, keys: &[&str]) -> Option<Value> {
    keys.iter().find_map(|key| map.remove(*key))
}

fn take_locator(map: &mut Map<String, Value>, keys: &[&str]) -> std::result::Result<String, String> {
    match take_any(map, keys) {
        Some(Value::String(locator)) => Ok(locator),
        Some(other) => Err(format!("model {} must be a string, got {other}", keys[0])),
        None => Err(format!("missing field `{}`", keys[0])),
    }
}

/// Parameters from `map`, naming the offending key when one has the wrong type.
fn take_parameters(map: &mut Map<String, Value>, keys: &[&str]) -> std::result::Result<GenerationParameters, String> {
    let Some(value) = take_any(map, keys) else {
        return Ok(GenerationParameters::default());
    };
    serde_json::from_value(value.clone()).map_err(|e| {
        let field = value.as_object().and_then(|params| {
            params.iter().find_map(|(key, v)| {
                let single = Value::Object(Map::from_iter([(key.clone(), v.clone())]));
                serde_json::from_value::<GenerationParameters>(single)
                    .is_err()
                    .then(|| key.clone())
            })
        });
        match field {
            Some(field) => format!("invalid model parameter `{field}`: {e}"),
            None => format!("invalid model parameters: {e}"),
        }
    })
}

impl ModelDescriptor {
    /// Accepts the flat `{locator, parameters}` shape (with `url`/`path` and
    /// `params` aliases) and the legacy `{id, description}` shape, where the
    /// description is a bare locator or `{url, params}`.
    fn from_json(value: Value) -> std::result::Result<Self, String> {
        let Value::Object(mut map) = value else {
            return Err(format!("model descriptor must be an object, got {value}"));
        };

        match map.remove("description") {
            Some(Value::String(locator)) => Ok(ModelDescriptor::new(locator)),
            Some(Value::Object(mut detail)) => Ok(ModelDescriptor {
                locator: take_locator(&mut detail, &["url"])?,
                parameters: take_parameters(&mut detail, &["params"])?,
            }),
            Some(other) => Err(format!(
                "model description must be a locator or an object with a url, got {other}"
            )),
            None => Ok(ModelDescriptor {
                locator: take_locator(&mut map, &["locator", "url", "path"])?,
                parameters: take_parameters(&mut map, &["parameters", "params"])?,
            }),
        }
    }
}

impl<'de> Deserialize<'de> for ModelDescriptor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        ModelDescriptor::from_json(value).map_err(serde::de::Error::custom)
    }
}

/// Dialogue history as a flat token sequence
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct ConversationState(Vec<u32>);

impl ConversationState {
    pub fn new(tokens: Vec<u32>) -> Self {
        Self(tokens)
    }

    pub fn tokens(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_tokens(self) -> Vec<u32> {
        self.0
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StateRepr {
    Flat(Vec<u32>),
    Batched(Vec<Vec<u32>>),
}

impl<'de> Deserialize<'de> for ConversationState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match StateRepr::deserialize(deserializer)? {
            StateRepr::Flat(tokens) => Ok(ConversationState(tokens)),
            StateRepr::Batched(mut rows) if rows.len() <= 1 => {
                Ok(ConversationState(rows.pop().unwrap_or_default()))
            }
            StateRepr::Batched(rows) => Err(serde::de::Error::custom(format!(
                "conversation state must hold a single sequence, got {}",
                rows.len()
            ))),
        }
    }
}

/// Index of the predicted class
pub type ClassificationResult = usize;

/// Text produced by the generator plus the state to feed into the next turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationOutput {
    pub text: String,
    pub state: Option<ConversationState>,
}

/// Result of the sentiment-routed pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteOutcome {
    pub classification: ClassificationResult,
    pub reply: String,
}
