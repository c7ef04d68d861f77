use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::device::DeviceSpec;
use crate::error::{EngineError, Result};
use crate::types::{GenerationParameters, ModelDescriptor, NumericPrecision};

/// Config file read when no path is given, if it exists.
pub const DEFAULT_CONFIG_FILE: &str = "droid.toml";
/// Prefix of environment overrides; `__` separates nested keys.
pub const ENV_PREFIX: &str = "DROID_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub processing: ProcessingConfig,
    pub device: DeviceConfig,
    pub router: RouterConfig,
    pub cache: CacheConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Jobs admitted at once, queued or running. Extra requests get 503.
    pub queue_size: usize,
    /// Jobs allowed to run concurrently on one device.
    pub concurrency_per_device: usize,
    /// Deadline for a single job, including model loading.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device used when a request names none.
    pub default: String,
}

/// Models used by the sentiment-routed pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub classifier: ModelDescriptor,
    /// Used when the classifier predicts class 1.
    pub conversational: ModelDescriptor,
    /// Used for every other class.
    pub generic: ModelDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: LogLevel,
    pub log_spans: bool,
    pub json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            queue_size: 64,
            concurrency_per_device: 1,
            timeout_secs: 120,
        }
    }
}

impl ProcessingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            default: "cpu".to_string(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            classifier: ModelDescriptor::new("models/distilbert-base-uncased-finetuned-sst-2-english")
                .with_parameters(GenerationParameters {
                    numeric_precision: NumericPrecision::Float16,
                    ..Default::default()
                }),
            conversational: ModelDescriptor::new("models/DialoGPT-medium").with_parameters(
                GenerationParameters {
                    temperature: 5.0,
                    max_length: 150,
                    ..Default::default()
                },
            ),
            generic: ModelDescriptor::new("models/gpt2").with_parameters(GenerationParameters {
                temperature: 0.8,
                max_length: 128,
                top_p: 0.85,
                ..Default::default()
            }),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_spans: false,
            json: false,
        }
    }
}

impl EngineConfig {
    /// Layered load: compiled defaults, then the TOML file (`path`, or
    /// `droid.toml` when present), then `DROID_` environment variables.
    /// An explicit path that does not exist is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) if !path.is_file() => {
                return Err(EngineError::Configuration {
                    parameter: "config".to_string(),
                    message: format!("config file '{}' not found", path.display()),
                });
            }
            Some(path) => Toml::file(path),
            None => Toml::file(DEFAULT_CONFIG_FILE),
        };

        let config: Self = Self::figment()
            .merge(file)
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(figment_error)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with a TOML document. No environment lookup.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Self = Self::figment()
            .merge(Toml::string(toml))
            .extract()
            .map_err(figment_error)?;
        config.validate()?;
        Ok(config)
    }

    fn figment() -> Figment {
        Figment::new().merge(Serialized::defaults(Self::default()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(config_error("server.host", "must not be empty"));
        }
        if self.processing.queue_size == 0 {
            return Err(config_error("processing.queue_size", "must be at least 1"));
        }
        if self.processing.concurrency_per_device == 0 {
            return Err(config_error("processing.concurrency_per_device", "must be at least 1"));
        }
        if self.processing.timeout_secs == 0 {
            return Err(config_error("processing.timeout_secs", "must be at least 1"));
        }
        self.device
            .default
            .parse::<DeviceSpec>()
            .map_err(|e| config_error("device.default", e.to_string()))?;

        for (name, descriptor) in [
            ("router.classifier", &self.router.classifier),
            ("router.conversational", &self.router.conversational),
            ("router.generic", &self.router.generic),
        ] {
            descriptor
                .validate()
                .map_err(|e| config_error(name, e.to_string()))?;
        }
        Ok(())
    }
}

fn config_error(parameter: &str, message: impl Into<String>) -> EngineError {
    EngineError::Configuration {
        parameter: parameter.to_string(),
        message: message.into(),
    }
}

fn figment_error(e: figment::Error) -> EngineError {
    let parameter = if e.path.is_empty() {
        "config".to_string()
    } else {
        e.path.join(".")
    };
    EngineError::Configuration {
        parameter,
        message: e.to_string(),
    }
}
