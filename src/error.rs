use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

type BoxError = Box<dyn StdError + Send + Sync>;

/// Which pipeline stage failed inside the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Classification,
    Generation,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::Classification => f.write_str("classification"),
            PipelineStage::Generation => f.write_str("generation"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to load model from '{locator}': {message}")]
    ModelLoad {
        locator: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Device '{device}' unavailable: {message}")]
    DeviceUnavailable { device: String, message: String },

    #[error("Classification failed: {message}")]
    Classification {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Generation failed: {message}")]
    Generation {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Inference failed: {message}")]
    Inference {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Pipeline failed during {stage}: {source}")]
    Pipeline {
        stage: PipelineStage,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Invalid value for '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    #[error("Inference queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Configuration error for {parameter}: {message}")]
    Configuration { parameter: String, message: String },

    #[error("Job cancelled before completion")]
    Cancelled,

    #[error("Engine is shutting down")]
    Shutdown,
}

impl EngineError {
    pub fn model_load(locator: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::ModelLoad {
            locator: locator.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn inference(message: impl Into<String>) -> Self {
        EngineError::Inference {
            message: message.into(),
            source: None,
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Wrap any failure as a classification-stage error. Errors that already
    /// describe a boundary condition (bad input, timeouts, saturation) pass
    /// through so the HTTP layer can still tell them apart.
    pub fn into_classification(self) -> Self {
        match self {
            e @ (EngineError::Classification { .. }
            | EngineError::Validation { .. }
            | EngineError::Timeout { .. }
            | EngineError::QueueFull { .. }
            | EngineError::Cancelled
            | EngineError::Shutdown) => e,
            other => EngineError::Classification {
                message: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }

    /// Generation-stage counterpart of [`EngineError::into_classification`].
    pub fn into_generation(self) -> Self {
        match self {
            e @ (EngineError::Generation { .. }
            | EngineError::Validation { .. }
            | EngineError::Timeout { .. }
            | EngineError::QueueFull { .. }
            | EngineError::Cancelled
            | EngineError::Shutdown) => e,
            other => EngineError::Generation {
                message: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }

    pub fn in_stage(self, stage: PipelineStage) -> Self {
        EngineError::Pipeline {
            stage,
            source: Box::new(self),
        }
    }

    /// Short snake_case name of the innermost error, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self.root() {
            EngineError::ModelLoad { .. } => "model_load",
            EngineError::DeviceUnavailable { .. } => "device_unavailable",
            EngineError::Classification { .. } => "classification",
            EngineError::Generation { .. } => "generation",
            EngineError::Inference { .. } => "inference",
            EngineError::Pipeline { .. } => "pipeline",
            EngineError::Validation { .. } => "validation",
            EngineError::Timeout { .. } => "timeout",
            EngineError::QueueFull { .. } => "queue_full",
            EngineError::Configuration { .. } => "configuration",
            EngineError::Cancelled => "cancelled",
            EngineError::Shutdown => "shutdown",
        }
    }

    /// The innermost error, looking through pipeline wrappers.
    pub fn root(&self) -> &EngineError {
        match self {
            EngineError::Pipeline { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<candle_core::Error> for EngineError {
    fn from(e: candle_core::Error) -> Self {
        EngineError::Inference {
            message: format!("tensor operation failed: {e}"),
            source: Some(Box::new(e)),
        }
    }
}

/// Classification of errors for the boundary layer.
pub(crate) trait ErrorExt {
    /// Whether the caller sent something we refused before doing model work.
    fn is_client_error(&self) -> bool;
    /// Whether the same request could succeed if retried later.
    fn is_retryable(&self) -> bool;
}

impl ErrorExt for EngineError {
    fn is_client_error(&self) -> bool {
        matches!(self.root(), EngineError::Validation { .. })
    }

    fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            EngineError::Timeout { .. } | EngineError::QueueFull { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = EngineError::model_load("models/gpt2", "config.json not found");
        assert_eq!(
            error.to_string(),
            "Failed to load model from 'models/gpt2': config.json not found"
        );
    }

    #[test]
    fn test_pipeline_names_stage() {
        let error = EngineError::Generation {
            message: "boom".to_string(),
            source: None,
        }
        .in_stage(PipelineStage::Generation);
        assert!(error.to_string().starts_with("Pipeline failed during generation"));
    }

    #[test]
    fn test_stage_wrapping_keeps_boundary_errors() {
        let timeout = EngineError::Timeout {
            operation: "generate".to_string(),
            duration: Duration::from_secs(1),
        };
        assert!(matches!(timeout.into_generation(), EngineError::Timeout { .. }));

        let load = EngineError::model_load("x", "missing").into_classification();
        assert!(matches!(load, EngineError::Classification { .. }));
        assert!(load.source().is_some());
    }

    #[test]
    fn test_error_classification() {
        let error = EngineError::validation("text", "missing").in_stage(PipelineStage::Classification);
        assert!(error.is_client_error());
        assert!(!error.is_retryable());

        assert_eq!(error.kind(), "validation");

        let error = EngineError::QueueFull { capacity: 4 };
        assert_eq!(error.kind(), "queue_full");
        assert!(error.is_retryable());
        assert!(!error.is_client_error());
    }
}
