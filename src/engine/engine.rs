use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use super::{Classifier, Generator, Router};
use crate::{
    config::EngineConfig,
    device::{DeviceManager, DeviceStats},
    error::{EngineError, Result},
    metrics::{MetricsCollector, MetricsSnapshot},
    model::{ModelFamily, ModelKey, ModelManager},
    processing::{InferenceQueue, QueueStatsSnapshot},
    types::{ClassificationResult, ConversationState, GenerationOutput, ModelDescriptor},
};

/// Runs classification and generation jobs: resolves the device, admits the
/// job to the queue, and executes it on the blocking pool against a cached
/// model.
pub struct InferenceEngine {
    pub(super) config: Arc<EngineConfig>,
    pub(super) devices: Arc<DeviceManager>,
    pub(super) models: Arc<ModelManager>,
    pub(super) queue: Arc<InferenceQueue>,
    pub(super) metrics: Arc<MetricsCollector>,
}

/// Point-in-time view of the engine for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub cached_models: Vec<ModelKey>,
    pub devices: Vec<DeviceStats>,
    pub queue: QueueStatsSnapshot,
    pub metrics: MetricsSnapshot,
}

impl InferenceEngine {
    /// Create a new engine builder
    pub fn builder() -> super::EngineBuilder {
        super::EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn models(&self) -> &ModelManager {
        &self.models
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Sentiment router over this engine, using the configured descriptors.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new(self.clone(), self.clone(), self.config.router.clone())
    }

    pub fn health(&self) -> EngineHealth {
        let status = if self.queue.is_shut_down() { "shutting_down" } else { "ok" };
        EngineHealth {
            status,
            version: crate::VERSION,
            uptime_secs: self.metrics.uptime().as_secs(),
            cached_models: self.models.cached_keys(),
            devices: self.devices.stats(),
            queue: self.queue.stats(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Stop admitting work, cancel running jobs and drop cached models.
    pub fn shutdown(&self) {
        info!("Shutting down inference engine");
        self.queue.shutdown();
        self.models.clear();
    }

    /// Record the outcome of a stage call.
    pub fn record<T>(&self, operation: &'static str, start: Instant, result: &Result<T>) {
        match result {
            Ok(_) => self.metrics.record_success(operation, start.elapsed()),
            Err(e) => self.metrics.record_error(operation, e.kind(), start.elapsed()),
        }
    }

    async fn run_classify(&self, text: &str, descriptor: &ModelDescriptor) -> Result<ClassificationResult> {
        descriptor.validate()?;
        if descriptor.family() != ModelFamily::SequenceClassification {
            return Err(EngineError::Classification {
                message: format!(
                    "'{}' is a {} model, not a sequence classifier",
                    descriptor.locator,
                    descriptor.family()
                ),
                source: None,
            });
        }

        let slot = self.devices.resolve(None)?;
        let models = self.models.clone();
        let descriptor = descriptor.clone();
        let text = text.to_string();
        let job_slot = slot.clone();
        self.queue
            .submit("classify", &slot, move |_cancel| {
                let model = models.get_or_load(&descriptor, &job_slot)?;
                let runtime = model.as_classifier().ok_or_else(|| EngineError::Classification {
                    message: format!("'{}' did not load as a classifier", descriptor.locator),
                    source: None,
                })?;
                runtime.classify(&text)
            })
            .await
    }

    async fn run_generate(
        &self,
        text: &str,
        descriptor: &ModelDescriptor,
        state: Option<ConversationState>,
        device: Option<String>,
    ) -> Result<GenerationOutput> {
        descriptor.validate()?;
        if !descriptor.family().is_generative() {
            return Err(EngineError::Generation {
                message: format!("'{}' is a sequence classification model", descriptor.locator),
                source: None,
            });
        }

        let slot = self.devices.resolve(device.as_deref())?;
        let models = self.models.clone();
        let descriptor = descriptor.clone();
        let text = text.to_string();
        let job_slot = slot.clone();
        self.queue
            .submit("generate", &slot, move |cancel| {
                let model = models.get_or_load(&descriptor, &job_slot)?;
                let runtime = model.as_generator().ok_or_else(|| EngineError::Generation {
                    message: format!("'{}' did not load as a generator", descriptor.locator),
                    source: None,
                })?;
                runtime.generate(&text, &descriptor.parameters, state, cancel)
            })
            .await
    }
}

#[async_trait::async_trait]
impl Classifier for InferenceEngine {
    async fn classify(&self, text: &str, descriptor: &ModelDescriptor) -> Result<ClassificationResult> {
        let start = Instant::now();
        let result = self
            .run_classify(text, descriptor)
            .await
            .map_err(EngineError::into_classification);
        self.record("classify", start, &result);
        if let Ok(class) = &result {
            debug!(locator = %descriptor.locator, class, "Classified");
        }
        result
    }
}

#[async_trait::async_trait]
impl Generator for InferenceEngine {
    async fn generate(
        &self,
        text: &str,
        descriptor: &ModelDescriptor,
        state: Option<ConversationState>,
        device: Option<String>,
    ) -> Result<GenerationOutput> {
        let start = Instant::now();
        let result = self
            .run_generate(text, descriptor, state, device)
            .await
            .map_err(EngineError::into_generation);
        self.record("generate", start, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineBuilder;
    use crate::model::testing::ScriptedSource;
    use std::time::Duration;

    fn engine_with(source: Arc<ScriptedSource>, config: EngineConfig) -> Arc<InferenceEngine> {
        Arc::new(
            EngineBuilder::new()
                .with_config(config)
                .with_model_source(source)
                .build()
                .unwrap(),
        )
    }

    fn engine(source: Arc<ScriptedSource>) -> Arc<InferenceEngine> {
        engine_with(source, EngineConfig::default())
    }

    fn sst2() -> ModelDescriptor {
        ModelDescriptor::new("models/distilbert-sst2")
    }

    #[tokio::test]
    async fn test_classify_loads_once_and_reuses_model() {
        let source = Arc::new(ScriptedSource::new(vec![0.2, 1.5]));
        let engine = engine(source.clone());

        assert_eq!(engine.classify("I love this!", &sst2()).await.unwrap(), 1);
        assert_eq!(engine.classify("good day", &sst2()).await.unwrap(), 1);
        assert_eq!(source.loads(), 1);
        assert_eq!(engine.models().len(), 1);

        let metrics = engine.metrics().snapshot();
        assert_eq!(metrics.operations["classify"].total_requests, 2);
        assert_eq!(metrics.operations["classify"].total_errors, 0);
    }

    #[tokio::test]
    async fn test_classify_rejects_generative_descriptor() {
        let source = Arc::new(ScriptedSource::new(vec![1.0, 0.0]));
        let err = engine(source.clone())
            .classify("hello", &ModelDescriptor::new("models/gpt2"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Classification { .. }));
        assert_eq!(source.loads(), 0);
    }

    #[tokio::test]
    async fn test_conversation_continues_from_state() {
        let engine = engine(Arc::new(ScriptedSource::default()));
        let dialog = ModelDescriptor::new("models/DialoGPT-medium");

        let first = engine.generate("hello", &dialog, None, None).await.unwrap();
        assert_eq!(first.text, "i am fine");
        let state = first.state.unwrap();

        let second = engine
            .generate("how are you", &dialog, Some(state.clone()), None)
            .await
            .unwrap();
        assert_eq!(second.text, "i am fine");
        assert!(second.state.unwrap().len() > state.len());
    }

    #[tokio::test]
    async fn test_single_turn_generation_returns_no_state() {
        let engine = engine(Arc::new(ScriptedSource::default()));
        let output = engine
            .generate("hello world", &ModelDescriptor::new("models/gpt2"), None, Some("cpu".to_string()))
            .await
            .unwrap();
        assert!(output.text.starts_with("hello world"));
        assert!(output.state.is_none());
    }

    #[tokio::test]
    async fn test_generate_errors_are_generation_errors() {
        let source = Arc::new(ScriptedSource::default());
        let engine = engine(source.clone());

        let err = engine.generate("hi", &sst2(), None, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Generation { .. }));

        let err = engine
            .generate("hi", &ModelDescriptor::new("models/broken-gpt2"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Generation { .. }));
        assert!(err.to_string().contains("broken-gpt2"));

        // A failed load is retried on the next request.
        let _ = engine
            .generate("hi", &ModelDescriptor::new("models/broken-gpt2"), None, None)
            .await;
        assert_eq!(source.loads(), 2);

        let err = engine
            .generate("hi", &ModelDescriptor::new("models/gpt2"), None, Some("tpu".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { ref field, .. } if field == "device"));

        let generate = &engine.metrics().snapshot().operations["generate"];
        assert_eq!(generate.total_errors, 4);
        assert_eq!(generate.error_types["generation"], 3);
    }

    #[tokio::test]
    async fn test_slow_load_times_out() {
        let source = Arc::new(ScriptedSource {
            delay: Duration::from_millis(1500),
            ..Default::default()
        });
        let mut config = EngineConfig::default();
        config.processing.timeout_secs = 1;
        let engine = engine_with(source, config);

        let err = engine
            .generate("hi", &ModelDescriptor::new("models/gpt2"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_router_over_engine() {
        let engine = engine(Arc::new(ScriptedSource::new(vec![0.0, 3.0, 1.0])));
        let mut router_config = engine.config().router.clone();
        router_config.classifier = sst2();
        let router = Router::new(engine.clone(), engine.clone(), router_config);

        let outcome = router.route("I love this!").await.unwrap();
        assert_eq!(outcome.classification, 1);
        assert_eq!(outcome.reply, "i am fine");
    }

    #[tokio::test]
    async fn test_shutdown_refuses_work() {
        let engine = engine(Arc::new(ScriptedSource::new(vec![1.0])));
        engine.classify("hello", &sst2()).await.unwrap();
        engine.shutdown();

        assert!(engine.models().is_empty());
        assert_eq!(engine.health().status, "shutting_down");
        let err = engine.classify("hello", &sst2()).await.unwrap_err();
        assert!(matches!(err, EngineError::Shutdown));
    }
}
