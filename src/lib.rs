//! Droid inference - sentiment-routed text classification and generation
//!
//! This crate serves local pretrained models over HTTP: a sequence classifier,
//! conversational and single-turn decoders, and a router that picks the
//! decoder from the sentiment of the incoming message.

use std::fmt;

// Public modules
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod model;
pub mod processing;
pub mod server;
pub mod types;
pub mod utils;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-exports for public API
pub use config::EngineConfig;
pub use engine::{Classifier, EngineBuilder, Generator, InferenceEngine, Router};
pub use error::{EngineError, Result};
pub use metrics::MetricsCollector;
pub use model::ModelFamily;
pub use types::{ConversationState, GenerationOutput, GenerationParameters, ModelDescriptor, RouteOutcome};

/// Feature detection for supported backends
pub struct Features {
    /// Whether CUDA support is compiled in and a device answered
    pub cuda: bool,
    /// Number of detected CUDA devices
    pub cuda_devices: usize,
    /// Whether Metal support is compiled in and a device answered
    pub metal: bool,
}

impl Features {
    /// Detect available features at runtime
    pub fn detect() -> Self {
        #[cfg(feature = "cuda")]
        let (cuda, cuda_devices) = {
            let count = (0..8).take_while(|&i| candle_core::Device::new_cuda(i).is_ok()).count();
            (count > 0, count)
        };

        #[cfg(not(feature = "cuda"))]
        let (cuda, cuda_devices) = (false, 0);

        #[cfg(feature = "metal")]
        let metal = candle_core::Device::new_metal(0).is_ok();

        #[cfg(not(feature = "metal"))]
        let metal = false;

        Self {
            cuda,
            cuda_devices,
            metal,
        }
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CUDA support: {}", if self.cuda { "yes" } else { "no" })?;
        if self.cuda {
            writeln!(f, "CUDA devices: {}", self.cuda_devices)?;
        }
        writeln!(f, "Metal support: {}", if self.metal { "yes" } else { "no" })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_detection() {
        let features = Features::detect();
        let report = features.to_string();
        assert!(report.contains("CUDA support"));
        assert!(report.contains("Metal support"));
        #[cfg(not(feature = "cuda"))]
        assert_eq!(features.cuda_devices, 0);
    }

    #[test]
    fn test_version_number() {
        assert!(!VERSION.is_empty());
    }
}
