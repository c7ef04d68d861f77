//! Process-wide helpers

mod logging;

pub use logging::{setup_logging, LogConfig};
