use std::sync::Once;

use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    EnvFilter,
};

use crate::config::MonitoringConfig;
use crate::error::{EngineError, Result};

static INIT: Once = Once::new();

/// Logging configuration options
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level, unless `RUST_LOG` is set
    pub level: Level,
    /// Whether to log span open/close events
    pub log_spans: bool,
    /// Emit one JSON object per line instead of human readable text
    pub json: bool,
    /// Whether to include source code locations
    pub source_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            log_spans: false,
            json: false,
            source_location: false,
        }
    }
}

impl From<&MonitoringConfig> for LogConfig {
    fn from(monitoring: &MonitoringConfig) -> Self {
        Self {
            level: monitoring.log_level.into(),
            log_spans: monitoring.log_spans,
            json: monitoring.json,
            ..Default::default()
        }
    }
}

/// Install the global subscriber. Only the first call has any effect.
pub fn setup_logging(config: LogConfig) -> Result<()> {
    let mut result = Ok(());

    INIT.call_once(|| {
        result = setup_logging_internal(config);
    });

    result
}

fn setup_logging_internal(config: LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::from_level(config.level).into()));

    let span_events = if config.log_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_thread_ids(true)
        .with_target(true)
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_span_events(span_events);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| EngineError::Configuration {
        parameter: "monitoring".to_string(),
        message: format!("failed to set global subscriber: {e}"),
    })
}
