//! Preview unit: convert each frame into a display surface

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{CaptureError, Result};
use crate::video::buffer_pool::SlotTable;
use crate::video::convert::{required_len, PixelConverter};
use crate::video::format::Format;
use crate::video::frame::FrameLease;

/// Display surface a preview unit renders into
pub trait PreviewSurface: Send + Sync {
    /// Layout of the surface's buffers
    fn format(&self) -> Format;

    /// Lock a buffer, let `fill` render into it, then post it for display
    fn post(&self, fill: &mut dyn FnMut(&mut [u8]) -> Result<()>) -> Result<()>;
}

/// In-memory surface keeping the last posted image
pub struct MemorySurface {
    format: Format,
    buffer: Mutex<Vec<u8>>,
    frames_posted: AtomicU64,
}

impl MemorySurface {
    pub fn new(format: Format) -> Self {
        Self {
            format,
            buffer: Mutex::new(vec![0u8; format.size_image as usize]),
            frames_posted: AtomicU64::new(0),
        }
    }

    pub fn frames_posted(&self) -> u64 {
        self.frames_posted.load(Ordering::Relaxed)
    }

    /// Copy of the last posted image
    pub fn snapshot(&self) -> Vec<u8> {
        self.buffer.lock().clone()
    }
}

impl PreviewSurface for MemorySurface {
    fn format(&self) -> Format {
        self.format
    }

    fn post(&self, fill: &mut dyn FnMut(&mut [u8]) -> Result<()>) -> Result<()> {
        let mut buffer = self.buffer.lock();
        fill(&mut buffer)?;
        self.frames_posted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

pub struct PreviewUnit {
    surface: Arc<dyn PreviewSurface>,
    converter: Arc<dyn PixelConverter>,
}

impl PreviewUnit {
    pub fn new(surface: Arc<dyn PreviewSurface>, converter: Arc<dyn PixelConverter>) -> Result<Self> {
        let format = surface.format();
        if format.width() == 0 || format.height() == 0 {
            return Err(CaptureError::Config(format!(
                "preview surface has empty size {}",
                format.resolution
            )));
        }
        required_len(&format)?;
        Ok(Self { surface, converter })
    }

    pub(super) fn process(&mut self, lease: FrameLease, slots: &SlotTable) -> Result<bool> {
        let frame = lease.frame();
        let slot = slots.get(frame.slot_index).ok_or_else(|| {
            CaptureError::InvalidState(format!("slot {} not in pool", frame.slot_index))
        })?;
        let src = slot.data(frame.bytes_used);
        let src_format = frame.format;
        let dst_format = self.surface.format();
        let converter = &self.converter;

        let result = self
            .surface
            .post(&mut |dst: &mut [u8]| converter.convert(src, &src_format, dst, &dst_format));
        lease.complete();
        result.map(|()| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::convert::SoftwareConverter;
    use crate::video::format::{PixelFormat, Resolution};

    #[test]
    fn test_memory_surface_post() {
        let surface = MemorySurface::new(Format::packed(Resolution::new(4, 2), PixelFormat::Yuyv));
        surface
            .post(&mut |buf: &mut [u8]| {
                buf.fill(7);
                Ok(())
            })
            .unwrap();
        assert_eq!(surface.frames_posted(), 1);
        assert!(surface.snapshot().iter().all(|&b| b == 7));
    }

    #[test]
    fn test_failed_fill_is_not_counted() {
        let surface = MemorySurface::new(Format::packed(Resolution::new(4, 2), PixelFormat::Nv12));
        let result = surface.post(&mut |_: &mut [u8]| Err(CaptureError::Conversion("bad".into())));
        assert!(result.is_err());
        assert_eq!(surface.frames_posted(), 0);
    }

    #[test]
    fn test_rejects_compressed_surface() {
        let surface = Arc::new(MemorySurface::new(Format::packed(
            Resolution::new(64, 48),
            PixelFormat::Mjpeg,
        )));
        assert!(PreviewUnit::new(surface, Arc::new(SoftwareConverter::new())).is_err());
    }
}
