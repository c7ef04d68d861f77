use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use candle_core::Device;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::error::{EngineError, Result};

/// A device named by the caller: `cpu`, `cuda`, `cuda:N`, `metal` or `metal:N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceSpec {
    fn create(&self) -> Result<Device> {
        let device = match self {
            DeviceSpec::Cpu => Ok(Device::Cpu),
            DeviceSpec::Cuda(ordinal) => Device::new_cuda(*ordinal),
            DeviceSpec::Metal(ordinal) => Device::new_metal(*ordinal),
        };
        device.map_err(|e| EngineError::DeviceUnavailable {
            device: self.to_string(),
            message: e.to_string(),
        })
    }
}

impl FromStr for DeviceSpec {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase();
        let (kind, ordinal) = match normalized.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal.parse::<usize>().map_err(|_| {
                    EngineError::validation("device", format!("invalid device ordinal in '{s}'"))
                })?;
                (kind, ordinal)
            }
            None => (normalized.as_str(), 0),
        };

        match kind {
            "cpu" if !normalized.contains(':') => Ok(DeviceSpec::Cpu),
            "cuda" | "gpu" => Ok(DeviceSpec::Cuda(ordinal)),
            "metal" | "mps" => Ok(DeviceSpec::Metal(ordinal)),
            _ => Err(EngineError::validation(
                "device",
                format!("unknown device '{s}', expected cpu, cuda[:N] or metal[:N]"),
            )),
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Cpu => f.write_str("cpu"),
            DeviceSpec::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            DeviceSpec::Metal(ordinal) => write!(f, "metal:{ordinal}"),
        }
    }
}

/// A resolved device and the permits bounding concurrent work on it.
#[derive(Clone)]
pub struct DeviceSlot {
    spec: DeviceSpec,
    device: Device,
    permits: Arc<Semaphore>,
    concurrency: usize,
}

impl fmt::Debug for DeviceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSlot")
            .field("spec", &self.spec)
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl DeviceSlot {
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn label(&self) -> String {
        self.spec.to_string()
    }

    /// Wait for a turn on this device. The permit is held for the whole job.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Shutdown)
    }

    pub fn busy(&self) -> usize {
        self.concurrency - self.permits.available_permits()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStats {
    pub device: String,
    pub busy: usize,
    pub concurrency: usize,
}

/// Resolves device names to candle devices, once per device.
pub struct DeviceManager {
    default: DeviceSpec,
    concurrency: usize,
    slots: DashMap<DeviceSpec, DeviceSlot>,
}

impl DeviceManager {
    pub fn new(default: &str, concurrency: usize) -> Result<Self> {
        if concurrency == 0 {
            return Err(EngineError::Configuration {
                parameter: "processing.concurrency_per_device".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        let default = default.parse::<DeviceSpec>().map_err(|e| EngineError::Configuration {
            parameter: "device.default".to_string(),
            message: e.to_string(),
        })?;
        info!(%default, concurrency, "Device manager ready");

        Ok(Self {
            default,
            concurrency,
            slots: DashMap::new(),
        })
    }

    pub fn default_spec(&self) -> DeviceSpec {
        self.default
    }

    /// Resolve a requested device name, or the default when none is given.
    /// A device that fails to initialise is not remembered.
    pub fn resolve(&self, requested: Option<&str>) -> Result<DeviceSlot> {
        let spec = match requested {
            Some(name) => name.parse()?,
            None => self.default,
        };
        if let Some(slot) = self.slots.get(&spec) {
            return Ok(slot.clone());
        }

        let device = spec.create()?;
        let slot = self
            .slots
            .entry(spec)
            .or_insert_with(|| {
                debug!(device = %spec, "Initialised device");
                DeviceSlot {
                    spec,
                    device,
                    permits: Arc::new(Semaphore::new(self.concurrency)),
                    concurrency: self.concurrency,
                }
            })
            .clone();
        Ok(slot)
    }

    pub fn stats(&self) -> Vec<DeviceStats> {
        let mut stats: Vec<_> = self
            .slots
            .iter()
            .map(|slot| DeviceStats {
                device: slot.label(),
                busy: slot.busy(),
                concurrency: self.concurrency,
            })
            .collect();
        stats.sort_by(|a, b| a.device.cmp(&b.device));
        stats
    }
}
