//! Bounded hand-off from async request handling to blocking inference

mod queue;

pub use queue::{InferenceQueue, QueueStatsSnapshot};
