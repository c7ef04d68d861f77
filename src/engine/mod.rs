//! Engine module providing the classification and generation stages and the
//! sentiment router built on top of them

mod builder;
mod engine;
mod router;

pub use builder::EngineBuilder;
pub use engine::{EngineHealth, InferenceEngine};
pub use router::Router;

use crate::{
    error::Result,
    types::{ClassificationResult, ConversationState, GenerationOutput, ModelDescriptor},
};

/// Predicts a class index for a piece of text.
#[async_trait::async_trait]
pub trait Classifier: Send + Sync {
    /// Classify `text` with the model named by `descriptor`. Ties between
    /// logits resolve to the lowest class index.
    async fn classify(&self, text: &str, descriptor: &ModelDescriptor) -> Result<ClassificationResult>;
}

/// Produces text in reply to a prompt.
#[async_trait::async_trait]
pub trait Generator: Send + Sync {
    /// Generate with the model named by `descriptor`. `state` continues a
    /// conversation and is only meaningful for conversational models;
    /// `device` overrides the default device.
    async fn generate(
        &self,
        text: &str,
        descriptor: &ModelDescriptor,
        state: Option<ConversationState>,
        device: Option<String>,
    ) -> Result<GenerationOutput>;
}
