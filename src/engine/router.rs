use std::sync::Arc;

use tracing::{debug, info_span, Instrument};

use super::{Classifier, Generator};
use crate::config::RouterConfig;
use crate::error::{PipelineStage, Result};
use crate::types::{ModelDescriptor, RouteOutcome};

/// Class the sentiment model assigns to positive text.
const POSITIVE_CLASS: usize = 1;

/// Sentiment-routed response generation: classify the message, then reply
/// with the conversational model for positive text and the generic
/// decoder for everything else.
pub struct Router {
    classifier: Arc<dyn Classifier>,
    generator: Arc<dyn Generator>,
    config: RouterConfig,
}

impl Router {
    pub fn new(classifier: Arc<dyn Classifier>, generator: Arc<dyn Generator>, config: RouterConfig) -> Self {
        Self {
            classifier,
            generator,
            config,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Descriptor the router replies with for a given class.
    pub fn select(&self, class: usize) -> &ModelDescriptor {
        if class == POSITIVE_CLASS {
            &self.config.conversational
        } else {
            &self.config.generic
        }
    }

    pub async fn route(&self, text: &str) -> Result<RouteOutcome> {
        let classification = self
            .classifier
            .classify(text, &self.config.classifier)
            .instrument(info_span!("classify_stage"))
            .await
            .map_err(|e| e.in_stage(PipelineStage::Classification))?;

        let descriptor = self.select(classification);
        debug!(classification, locator = %descriptor.locator, "Routing to generator");

        let output = self
            .generator
            .generate(text, descriptor, None, None)
            .instrument(info_span!("generate_stage", locator = %descriptor.locator))
            .await
            .map_err(|e| e.in_stage(PipelineStage::Generation))?;

        Ok(RouteOutcome {
            classification,
            reply: output.text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{RecordingGenerator, StubClassifier};
    use crate::error::EngineError;

    fn router(class: std::result::Result<usize, String>, generator: Arc<RecordingGenerator>) -> Router {
        Router::new(Arc::new(StubClassifier(class)), generator, RouterConfig::default())
    }

    #[tokio::test]
    async fn test_positive_class_uses_conversational_model() {
        let generator = Arc::new(RecordingGenerator::default());
        let outcome = router(Ok(1), generator.clone()).route("I love this!").await.unwrap();

        assert_eq!(outcome.classification, 1);
        assert_eq!(outcome.reply, "reply from models/DialoGPT-medium");
        assert_eq!(generator.locators(), vec!["models/DialoGPT-medium"]);

        let calls = generator.calls.lock();
        let (text, descriptor, state) = &calls[0];
        assert_eq!(text, "I love this!");
        assert_eq!(descriptor.parameters.temperature, 5.0);
        assert!(state.is_none());
    }

    #[tokio::test]
    async fn test_other_classes_use_generic_model() {
        for class in [0, 2] {
            let generator = Arc::new(RecordingGenerator::default());
            let outcome = router(Ok(class), generator.clone()).route("meh").await.unwrap();
            assert_eq!(outcome.classification, class);
            assert_eq!(generator.locators(), vec!["models/gpt2"]);
            assert_eq!(generator.calls.lock()[0].1.parameters.top_p, 0.85);
        }
    }

    #[tokio::test]
    async fn test_failures_name_their_stage() {
        let generator = Arc::new(RecordingGenerator::default());
        let err = router(Err("no weights".to_string()), generator.clone())
            .route("hi")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Pipeline {
                stage: PipelineStage::Classification,
                ..
            }
        ));
        assert!(generator.locators().is_empty());

        let err = router(Ok(0), Arc::new(RecordingGenerator::failing()))
            .route("hi")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Pipeline {
                stage: PipelineStage::Generation,
                ..
            }
        ));
        assert!(matches!(err.root(), EngineError::Generation { .. }));
    }
}
