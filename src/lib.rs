//! capture-encoder - V4L2 capture with multi-consumer fan-out
//!
//! Frames are captured into a small pool of device buffers and handed, by slot
//! index, to every attached consumer (preview, managed-codec encoders, direct
//! hardware encoders). A slot goes back to the device once every consumer it
//! was delivered to has finished with it.

pub mod config;
pub mod control;
pub mod error;
pub mod utils;
pub mod video;

pub use error::{CaptureError, Result};
