//! Video capture pipeline
//!
//! Device access ([`device`], [`v4l2`], [`virtual_device`]), buffer and channel
//! pools, the completion tracker, processing units and the session that ties
//! them together.

pub mod buffer_pool;
pub mod channel;
pub mod convert;
pub mod device;
pub mod encoder;
pub mod format;
pub mod frame;
pub mod poll_loop;
pub mod session;
pub mod stats;
pub mod tracker;
pub mod unit;
pub mod v4l2;
pub mod virtual_device;

pub use buffer_pool::{BufferPool, BufferSlot, SlotTable};
pub use channel::{ChannelAllocator, ChannelId, ChannelLease};
pub use device::{CaptureDevice, VideoDeviceInfo};
pub use format::{Format, PixelFormat, Resolution};
pub use frame::{FrameDescriptor, FrameLease};
pub use session::{CaptureSession, SessionState, StartRequest};
pub use stats::{PipelineStats, UnitStats};
pub use tracker::CompletionTracker;
pub use unit::{ConsumerDescriptor, ProcessingUnit, UnitKind, UnitState};
