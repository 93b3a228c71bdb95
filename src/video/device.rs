//! Capture device abstraction and V4L2 device enumeration
//!
//! [`CaptureDevice`] is the device-control surface the pipeline drives: format
//! negotiation, buffer requests, export, streaming and the queue/dequeue pair.
//! [`super::v4l2::V4l2Device`] implements it over V4L2 ioctls and
//! [`super::virtual_device::VirtualDevice`] in memory.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use v4l::capability::Flags;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

use super::format::{Format, PixelFormat, Resolution};
use crate::error::{CaptureError, Result};

/// Capabilities reported by a capture device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceCaps {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub video_capture: bool,
    pub video_capture_mplane: bool,
    pub streaming: bool,
    /// Pixel formats the device enumerates, in device order
    pub formats: Vec<PixelFormat>,
}

impl DeviceCaps {
    pub fn can_capture(&self) -> bool {
        (self.video_capture || self.video_capture_mplane) && self.streaming
    }
}

/// Memory backing one device buffer
///
/// The device writes a slot only while the slot is queued to it; consumers
/// read it only while the slot is in flight. Implementations therefore hand
/// out a shared slice without further locking.
pub trait SlotMemory: Send + Sync {
    fn as_slice(&self) -> &[u8];

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One buffer returned by [`CaptureDevice::request_buffers`]
#[derive(Clone)]
pub struct SlotMapping {
    pub index: u32,
    pub length: u32,
    pub memory: Arc<dyn SlotMemory>,
}

impl fmt::Debug for SlotMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotMapping")
            .field("index", &self.index)
            .field("length", &self.length)
            .finish()
    }
}

/// Handle of an exported buffer, importable by hardware accelerators
#[derive(Debug)]
pub struct ExportHandle {
    index: u32,
    fd: Option<OwnedFd>,
}

impl ExportHandle {
    /// DMA-BUF handle exported by the driver
    pub fn dmabuf(index: u32, fd: OwnedFd) -> Self {
        Self {
            index,
            fd: Some(fd),
        }
    }

    /// Handle for memory that has no file descriptor (heap backed devices)
    pub fn memory(index: u32) -> Self {
        Self { index, fd: None }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }
}

/// A filled buffer taken off the device queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: u32,
    pub sequence: u32,
    pub timestamp: Duration,
}

/// Failure of one readiness wait / dequeue attempt
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("timed out waiting for a frame")]
    Timeout,
    #[error("wait interrupted")]
    Interrupted,
    #[error("dequeue failed: {0}")]
    Failed(String),
    #[error("device lost: {0}")]
    DeviceLost(String),
}

impl PollError {
    /// Classify an errno from a wait or dequeue call
    pub fn from_errno(errno: i32, context: &str) -> Self {
        match errno {
            libc::EINTR => PollError::Interrupted,
            libc::EAGAIN => PollError::Timeout,
            libc::ENXIO | libc::ENODEV | libc::EIO | libc::EPIPE | libc::ESHUTDOWN => {
                PollError::DeviceLost(format!("{}: errno {}", context, errno))
            }
            _ => PollError::Failed(format!("{}: errno {}", context, errno)),
        }
    }

    /// Transient errors are retried without counting toward the fault budget
    pub fn is_transient(&self) -> bool {
        matches!(self, PollError::Timeout | PollError::Interrupted)
    }
}

/// Device-control surface consumed by the capture pipeline
pub trait CaptureDevice: Send + Sync {
    /// Human readable device name for logs
    fn name(&self) -> &str;

    fn query_capabilities(&self) -> Result<DeviceCaps>;

    /// Choose a format from the device's enumerated formats and sizes
    fn negotiate_format(&self, preferred: &[PixelFormat], target: Resolution) -> Result<Format>;

    /// Apply a format and return the effective one the device settled on
    fn set_format(&self, format: &Format) -> Result<Format>;

    fn set_frame_rate(&self, fps: u32) -> Result<()>;

    /// Request and map `count` buffers; the device may grant fewer
    fn request_buffers(&self, count: u32) -> Result<Vec<SlotMapping>>;

    fn export_buffer(&self, index: u32) -> Result<ExportHandle>;

    /// Unmap and free all buffers
    fn release_buffers(&self) -> Result<()>;

    fn stream_on(&self) -> Result<()>;

    fn stream_off(&self) -> Result<()>;

    /// Wait up to `timeout` for a filled buffer and take it off the queue
    fn dequeue(&self, timeout: Duration) -> std::result::Result<DequeuedBuffer, PollError>;

    /// Hand a slot back to the device
    fn queue(&self, index: u32) -> Result<()>;
}

/// Information about a video device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoDeviceInfo {
    /// Device path (e.g., /dev/video0)
    pub path: PathBuf,
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub capture: bool,
    /// Supported pixel formats with their discrete sizes
    pub formats: Vec<FormatInfo>,
}

/// Information about a supported format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatInfo {
    pub format: PixelFormat,
    pub resolutions: Vec<Resolution>,
    pub description: String,
}

/// Query one device node with the v4l crate
pub fn query_device(path: impl AsRef<Path>) -> Result<VideoDeviceInfo> {
    let path = path.as_ref();
    let device = Device::with_path(path)
        .map_err(|e| CaptureError::Device(format!("Failed to open device {:?}: {}", path, e)))?;
    let caps = device
        .query_caps()
        .map_err(|e| CaptureError::Device(format!("Failed to query capabilities: {}", e)))?;

    let capture = caps.capabilities.contains(Flags::VIDEO_CAPTURE)
        || caps.capabilities.contains(Flags::VIDEO_CAPTURE_MPLANE);

    let mut formats = Vec::new();
    let descs = device
        .enum_formats()
        .map_err(|e| CaptureError::Device(format!("Failed to enumerate formats: {}", e)))?;
    for desc in descs {
        match PixelFormat::from_fourcc(desc.fourcc) {
            Some(format) => formats.push(FormatInfo {
                format,
                resolutions: discrete_sizes(&device, desc.fourcc),
                description: desc.description.clone(),
            }),
            None => debug!(
                "Skipping unsupported format: {:?} ({})",
                desc.fourcc, desc.description
            ),
        }
    }

    Ok(VideoDeviceInfo {
        path: path.to_path_buf(),
        driver: caps.driver,
        card: caps.card,
        bus_info: caps.bus,
        capture,
        formats,
    })
}

/// Discrete frame sizes for a format, in device order
pub(crate) fn discrete_sizes(device: &Device, fourcc: FourCC) -> Vec<Resolution> {
    match device.enum_framesizes(fourcc) {
        Ok(sizes) => sizes
            .into_iter()
            .filter_map(|size| match size.size {
                v4l::framesize::FrameSizeEnum::Discrete(d) => {
                    Some(Resolution::new(d.width, d.height))
                }
                v4l::framesize::FrameSizeEnum::Stepwise(_) => None,
            })
            .collect(),
        Err(e) => {
            debug!("Failed to enumerate frame sizes for {:?}: {}", fourcc, e);
            Vec::new()
        }
    }
}

/// Enumerate all video capture devices under /dev
pub fn list_video_devices() -> Result<Vec<VideoDeviceInfo>> {
    info!("Enumerating video devices...");

    let mut paths: Vec<PathBuf> = std::fs::read_dir("/dev")?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("video"))
        })
        .collect();
    paths.sort();

    let mut devices = Vec::new();
    for path in paths {
        match query_device(&path) {
            Ok(info) if info.capture => {
                info!(
                    "Found capture device: {} ({}) - {} formats",
                    info.card,
                    info.driver,
                    info.formats.len()
                );
                devices.push(info);
            }
            Ok(_) => debug!("Skipping non-capture device: {:?}", path),
            Err(e) => debug!("Failed to query {:?}: {}", path, e),
        }
    }

    info!("Found {} video capture devices", devices.len());
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_error_classification() {
        assert_eq!(PollError::from_errno(libc::EINTR, "poll"), PollError::Interrupted);
        assert_eq!(PollError::from_errno(libc::EAGAIN, "dqbuf"), PollError::Timeout);
        assert!(matches!(
            PollError::from_errno(libc::ENODEV, "dqbuf"),
            PollError::DeviceLost(_)
        ));
        assert!(matches!(
            PollError::from_errno(libc::EINVAL, "dqbuf"),
            PollError::Failed(_)
        ));
        assert!(PollError::Timeout.is_transient());
        assert!(!PollError::Failed(String::new()).is_transient());
    }

    #[test]
    fn test_caps_can_capture() {
        let caps = DeviceCaps {
            video_capture_mplane: true,
            streaming: true,
            ..Default::default()
        };
        assert!(caps.can_capture());
        assert!(!DeviceCaps::default().can_capture());
    }

    #[test]
    fn test_memory_export_handle() {
        let handle = ExportHandle::memory(2);
        assert_eq!(handle.index(), 2);
        assert_eq!(handle.raw_fd(), None);
    }
}
