//! Utility modules shared by the capture pipeline

pub mod throttle;

pub use throttle::LogThrottler;
