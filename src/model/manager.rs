use std::sync::Arc;
use std::time::Instant;

use candle_core::Device;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::family::ModelFamily;
use super::loader::{LoadedModel, ModelLoader};
use crate::device::DeviceSlot;
use crate::error::Result;
use crate::types::{ModelDescriptor, NumericPrecision};

/// Something that can build a model for a descriptor.
pub trait ModelSource: Send + Sync {
    fn load(&self, descriptor: &ModelDescriptor, device: &Device) -> Result<LoadedModel>;
}

impl ModelSource for ModelLoader {
    fn load(&self, descriptor: &ModelDescriptor, device: &Device) -> Result<LoadedModel> {
        ModelLoader::load(self, descriptor, device)
    }
}

/// Identity of a cached model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ModelKey {
    pub locator: String,
    pub family: ModelFamily,
    pub precision: NumericPrecision,
    pub device: String,
}

impl ModelKey {
    pub fn new(descriptor: &ModelDescriptor, device: &str) -> Self {
        let family = descriptor.family();
        // Classifiers load at float32 whatever the descriptor asks for.
        let precision = match family {
            ModelFamily::SequenceClassification => NumericPrecision::Float32,
            _ => descriptor.parameters.numeric_precision,
        };
        Self {
            locator: descriptor.locator.trim().to_string(),
            family,
            precision,
            device: device.to_string(),
        }
    }
}

type Entry = Arc<Mutex<Option<Arc<LoadedModel>>>>;

/// Construct-once, share-read cache of loaded models.
///
/// Concurrent requests for the same key wait on a single construction and
/// share the result. A failed construction leaves the key empty so the next
/// request retries. All methods block and belong on the blocking pool.
pub struct ModelManager {
    source: Arc<dyn ModelSource>,
    entries: DashMap<ModelKey, Entry>,
    enabled: bool,
}

impl ModelManager {
    pub fn new(source: Arc<dyn ModelSource>, enabled: bool) -> Self {
        Self {
            source,
            entries: DashMap::new(),
            enabled,
        }
    }

    pub fn get_or_load(&self, descriptor: &ModelDescriptor, slot: &DeviceSlot) -> Result<Arc<LoadedModel>> {
        if !self.enabled {
            return self.construct(descriptor, slot).map(Arc::new);
        }

        let key = ModelKey::new(descriptor, &slot.label());
        // Clone the entry out so the map shard is not locked during loading.
        let entry = self.entries.entry(key.clone()).or_default().clone();
        let mut cell = entry.lock();
        if let Some(model) = cell.as_ref() {
            debug!(locator = %key.locator, device = %key.device, "Model cache hit");
            return Ok(model.clone());
        }

        let model = Arc::new(self.construct(descriptor, slot)?);
        *cell = Some(model.clone());
        Ok(model)
    }

    fn construct(&self, descriptor: &ModelDescriptor, slot: &DeviceSlot) -> Result<LoadedModel> {
        let start = Instant::now();
        match self.source.load(descriptor, slot.device()) {
            Ok(model) => {
                info!(
                    locator = %descriptor.locator,
                    family = %model.family(),
                    device = %slot.label(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Model ready"
                );
                Ok(model)
            }
            Err(e) => {
                warn!(locator = %descriptor.locator, error = %e, "Model construction failed");
                Err(e)
            }
        }
    }

    pub fn is_cached(&self, descriptor: &ModelDescriptor, device: &str) -> bool {
        self.entries
            .get(&ModelKey::new(descriptor, device))
            .is_some_and(|entry| entry.lock().is_some())
    }

    /// Drop one cached model. Returns whether anything was cached.
    pub fn evict(&self, descriptor: &ModelDescriptor, device: &str) -> bool {
        self.entries
            .remove(&ModelKey::new(descriptor, device))
            .is_some_and(|(_, entry)| entry.lock().is_some())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of models currently loaded.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.value().lock().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of the loaded models.
    pub fn cached_keys(&self) -> Vec<ModelKey> {
        self.entries
            .iter()
            .filter(|e| e.value().lock().is_some())
            .map(|e| e.key().clone())
            .collect()
    }
}
