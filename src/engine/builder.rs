use std::sync::Arc;

use tracing::info;

use crate::{
    config::EngineConfig,
    device::DeviceManager,
    error::Result,
    metrics::MetricsCollector,
    model::{ModelLoader, ModelManager, ModelSource},
    processing::InferenceQueue,
};

use super::engine::InferenceEngine;

/// Builder for constructing an InferenceEngine instance
pub struct EngineBuilder {
    config: Option<EngineConfig>,
    source: Option<Arc<dyn ModelSource>>,
}

impl EngineBuilder {
    /// Create a new builder instance
    pub fn new() -> Self {
        Self {
            config: None,
            source: None,
        }
    }

    /// Set the engine configuration
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build models with `source` instead of reading them from disk.
    pub fn with_model_source(mut self, source: Arc<dyn ModelSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Build the engine instance
    pub fn build(self) -> Result<InferenceEngine> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let devices = DeviceManager::new(&config.device.default, config.processing.concurrency_per_device)?;
        let source = self.source.unwrap_or_else(|| Arc::new(ModelLoader::new()));
        let models = ModelManager::new(source, config.cache.enabled);
        let queue = InferenceQueue::new(config.processing.queue_size, config.processing.timeout());

        info!(
            default_device = %devices.default_spec(),
            queue_size = config.processing.queue_size,
            timeout_secs = config.processing.timeout_secs,
            cache = config.cache.enabled,
            "Inference engine ready"
        );

        Ok(InferenceEngine {
            config: Arc::new(config),
            devices: Arc::new(devices),
            models: Arc::new(models),
            queue: Arc::new(queue),
            metrics: Arc::new(MetricsCollector::new()),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
