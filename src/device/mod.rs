//! Device resolution and per-device concurrency limits

mod manager;

pub use manager::{DeviceManager, DeviceSlot, DeviceSpec, DeviceStats};
