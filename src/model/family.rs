//! Model family dispatch from a locator string

use std::fmt;

use serde::Serialize;

/// Behavioural category of a model, decided from its locator alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    /// Encoder with a classification head (DistilBERT).
    SequenceClassification,
    /// Multi-turn dialogue decoder (DialoGPT).
    Conversational,
    /// Any other decoder-only causal LM (GPT-2 style).
    CausalGeneration,
}

/// Checked in order; the first marker found in the locator wins.
const FAMILY_MARKERS: &[(&str, ModelFamily)] = &[
    ("distilbert", ModelFamily::SequenceClassification),
    ("dialogpt", ModelFamily::Conversational),
];

impl ModelFamily {
    /// Resolve the family for a locator by case-insensitive substring match.
    pub fn from_locator(locator: &str) -> Self {
        let normalized = locator.trim().to_lowercase();
        FAMILY_MARKERS
            .iter()
            .find(|(marker, _)| normalized.contains(marker))
            .map(|(_, family)| *family)
            .unwrap_or(ModelFamily::CausalGeneration)
    }

    pub fn is_generative(&self) -> bool {
        !matches!(self, ModelFamily::SequenceClassification)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFamily::SequenceClassification => "sequence_classification",
            ModelFamily::Conversational => "conversational",
            ModelFamily::CausalGeneration => "causal_generation",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
