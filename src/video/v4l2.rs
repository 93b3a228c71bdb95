//! V4L2 capture device using v4l2r (ioctl layer).

use parking_lot::Mutex;
use std::fs::File;
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, warn};
use v4l::prelude::*;
use v4l::video::Capture;
use v4l2r::bindings::{v4l2_requestbuffers, v4l2_streamparm, v4l2_streamparm__bindgen_ty_1};
use v4l2r::ioctl::{
    self, Capabilities, Capability as V4l2rCapability, DqBufIoctlError, ExpbufFlags,
    IoctlConvertError, MemoryConsistency, PlaneMapping, QBufIoctlError, QBufPlane, QBuffer,
    QueryBuffer, V4l2Buffer,
};
use v4l2r::memory::{MemoryType, MmapHandle};
use v4l2r::{Format as V4l2rFormat, PixelFormat as V4l2rPixelFormat, QueueType};

use super::device::{
    discrete_sizes, CaptureDevice, DequeuedBuffer, DeviceCaps, ExportHandle, PollError,
    SlotMapping, SlotMemory,
};
use super::format::{select_pixel_format, select_resolution, Format, PixelFormat, Resolution};
use crate::error::{CaptureError, Result};

/// Size used when the device reports no usable discrete size
const FALLBACK_RESOLUTION: Resolution = Resolution::UHD4K;

/// Plane 0 of one mmap'd capture buffer
struct MappedPlane(PlaneMapping);

// SAFETY: the mapping is a plain shared memory region; writes by the device
// and reads by consumers are serialized by the slot ownership protocol.
unsafe impl Send for MappedPlane {}
unsafe impl Sync for MappedPlane {}

impl SlotMemory for MappedPlane {
    fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Default)]
struct BufferState {
    /// Plane lengths per buffer index, needed to requeue mmap buffers
    plane_lengths: Vec<Vec<u32>>,
    mappings: Vec<Arc<MappedPlane>>,
    streaming: bool,
}

/// V4L2 capture device backed by v4l2r ioctls
pub struct V4l2Device {
    path: PathBuf,
    name: String,
    fd: File,
    queue: QueueType,
    buffers: Mutex<BufferState>,
}

impl V4l2Device {
    pub fn open(device_path: impl AsRef<Path>) -> Result<Self> {
        let path = device_path.as_ref().to_path_buf();
        let fd = File::options()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| CaptureError::Device(format!("Failed to open {:?}: {}", path, e)))?;

        let caps: V4l2rCapability = ioctl::querycap(&fd)
            .map_err(|e| CaptureError::Device(format!("Failed to query capabilities: {}", e)))?;
        let caps_flags = caps.device_caps();

        // Multi-planar first: some drivers only expose NV12 on the mplane queue.
        let queue = if caps_flags.contains(Capabilities::VIDEO_CAPTURE_MPLANE) {
            QueueType::VideoCaptureMplane
        } else if caps_flags.contains(Capabilities::VIDEO_CAPTURE) {
            QueueType::VideoCapture
        } else {
            return Err(CaptureError::Device(format!(
                "{:?} does not support capture queues",
                path
            )));
        };

        info!(
            "Opened {:?}: {} ({}) queue {:?}",
            path, caps.card, caps.driver, queue
        );

        Ok(Self {
            name: format!("{} ({})", path.display(), caps.card),
            path,
            fd,
            queue,
            buffers: Mutex::new(BufferState::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn wait_ready(&self, timeout: Duration) -> std::result::Result<(), PollError> {
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        let timeout_ms = timeout.as_millis().min(u16::MAX as u128) as u16;
        let ready = poll(&mut fds, PollTimeout::from(timeout_ms))
            .map_err(|e| PollError::from_errno(e as i32, "poll"))?;
        if ready == 0 {
            return Err(PollError::Timeout);
        }
        if let Some(revents) = fds[0].revents() {
            if revents.contains(PollFlags::POLLERR) || revents.contains(PollFlags::POLLHUP) {
                return Err(PollError::DeviceLost(format!(
                    "{}: poll reported {:?}",
                    self.path.display(),
                    revents
                )));
            }
        }
        Ok(())
    }

    fn to_format(fmt: &V4l2rFormat, fallback: PixelFormat) -> Format {
        let code: u32 = fmt.pixelformat.into();
        let pixel_format = PixelFormat::from_fourcc_bytes(&code.to_le_bytes()).unwrap_or(fallback);
        let resolution = Resolution::new(fmt.width, fmt.height);
        let packed = Format::packed(resolution, pixel_format);
        let plane = fmt.plane_fmt.first();
        Format {
            resolution,
            pixel_format,
            stride: plane
                .map(|p| p.bytesperline)
                .filter(|s| *s > 0)
                .unwrap_or(packed.stride),
            size_image: plane
                .map(|p| p.sizeimage)
                .filter(|s| *s > 0)
                .unwrap_or(packed.size_image),
        }
    }

    fn unmap_and_free(&self, state: &mut BufferState) -> Result<()> {
        for (index, mapping) in state.mappings.iter().enumerate() {
            if Arc::strong_count(mapping) > 1 {
                warn!("Slot {} still referenced while releasing buffers", index);
            }
        }
        state.mappings.clear();
        state.plane_lengths.clear();
        let _req: v4l2_requestbuffers = ioctl::reqbufs(
            &self.fd,
            self.queue,
            MemoryType::Mmap,
            0,
            MemoryConsistency::empty(),
        )
        .map_err(|e| CaptureError::Device(format!("Failed to free buffers: {}", e)))?;
        Ok(())
    }
}

impl CaptureDevice for V4l2Device {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_capabilities(&self) -> Result<DeviceCaps> {
        let caps: V4l2rCapability = ioctl::querycap(&self.fd)
            .map_err(|e| CaptureError::Device(format!("Failed to query capabilities: {}", e)))?;
        let flags = caps.device_caps();
        let device = Device::with_path(&self.path)
            .map_err(|e| CaptureError::Device(format!("Failed to open {:?}: {}", self.path, e)))?;
        let formats = device
            .enum_formats()
            .map_err(|e| CaptureError::Device(format!("Failed to enumerate formats: {}", e)))?
            .into_iter()
            .filter_map(|desc| PixelFormat::from_fourcc(desc.fourcc))
            .collect();
        Ok(DeviceCaps {
            driver: caps.driver.clone(),
            card: caps.card.clone(),
            bus_info: caps.bus_info.clone(),
            video_capture: flags.contains(Capabilities::VIDEO_CAPTURE),
            video_capture_mplane: flags.contains(Capabilities::VIDEO_CAPTURE_MPLANE),
            streaming: flags.contains(Capabilities::STREAMING),
            formats,
        })
    }

    fn negotiate_format(&self, preferred: &[PixelFormat], target: Resolution) -> Result<Format> {
        let caps = self.query_capabilities()?;
        let pixel_format = select_pixel_format(&caps.formats, preferred).ok_or_else(|| {
            CaptureError::Device(format!(
                "{} offers none of the preferred formats {:?} (has {:?})",
                self.name, preferred, caps.formats
            ))
        })?;

        let device = Device::with_path(&self.path)
            .map_err(|e| CaptureError::Device(format!("Failed to open {:?}: {}", self.path, e)))?;
        let sizes = discrete_sizes(&device, pixel_format.to_fourcc());
        let resolution = select_resolution(&sizes, target.width).unwrap_or_else(|| {
            warn!(
                "No landscape discrete size for {}, falling back to {}",
                pixel_format, FALLBACK_RESOLUTION
            );
            FALLBACK_RESOLUTION
        });

        info!("Selected {} {} for {}", pixel_format, resolution, self.name);
        Ok(Format::packed(resolution, pixel_format))
    }

    fn set_format(&self, format: &Format) -> Result<Format> {
        let mut fmt: V4l2rFormat = ioctl::g_fmt(&self.fd, self.queue)
            .map_err(|e| CaptureError::Device(format!("Failed to get device format: {}", e)))?;
        fmt.width = format.width();
        fmt.height = format.height();
        fmt.pixelformat = V4l2rPixelFormat::from_fourcc(format.pixel_format.fourcc_bytes());

        let mut setter = self.fd.try_clone()?;
        let _: V4l2rFormat = ioctl::s_fmt(&mut setter, (self.queue, &fmt))
            .map_err(|e| CaptureError::Device(format!("Failed to set device format: {}", e)))?;

        // Re-read: the driver may have adjusted size or stride.
        let actual: V4l2rFormat = ioctl::g_fmt(&self.fd, self.queue)
            .map_err(|e| CaptureError::Device(format!("Failed to get device format: {}", e)))?;
        let effective = Self::to_format(&actual, format.pixel_format);
        if effective.resolution != format.resolution {
            warn!("Requested {}, device set {}", format.resolution, effective.resolution);
        }
        Ok(effective)
    }

    fn set_frame_rate(&self, fps: u32) -> Result<()> {
        let mut params = unsafe { std::mem::zeroed::<v4l2_streamparm>() };
        params.type_ = self.queue as u32;
        params.parm = v4l2_streamparm__bindgen_ty_1 {
            capture: v4l2r::bindings::v4l2_captureparm {
                timeperframe: v4l2r::bindings::v4l2_fract {
                    numerator: 1,
                    denominator: fps,
                },
                ..unsafe { std::mem::zeroed() }
            },
        };

        let _actual: v4l2_streamparm = ioctl::s_parm(&self.fd, params)
            .map_err(|e| CaptureError::Device(format!("Failed to set FPS: {}", e)))?;
        Ok(())
    }

    fn request_buffers(&self, count: u32) -> Result<Vec<SlotMapping>> {
        let mut state = self.buffers.lock();
        if !state.mappings.is_empty() {
            return Err(CaptureError::InvalidState(
                "buffers already requested".to_string(),
            ));
        }

        let req: v4l2_requestbuffers = ioctl::reqbufs(
            &self.fd,
            self.queue,
            MemoryType::Mmap,
            count,
            MemoryConsistency::empty(),
        )
        .map_err(|e| CaptureError::Device(format!("Failed to request buffers: {}", e)))?;
        let granted = req.count;
        debug!("Requested {} buffers, driver granted {}", count, granted);

        let mut slots = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            let query: std::result::Result<QueryBuffer, _> =
                ioctl::querybuf(&self.fd, self.queue, index as usize);
            let mapped = query
                .map_err(|e| {
                    CaptureError::Device(format!("Failed to query buffer {}: {}", index, e))
                })
                .and_then(|query| {
                    let plane = query.planes.first().ok_or_else(|| {
                        CaptureError::Device(format!(
                            "Driver returned zero planes for buffer {}",
                            index
                        ))
                    })?;
                    let mapping = ioctl::mmap(&self.fd, plane.mem_offset, plane.length)
                        .map_err(|e| {
                            CaptureError::Device(format!("Failed to mmap buffer {}: {}", index, e))
                        })?;
                    let lengths = query.planes.iter().map(|p| p.length).collect::<Vec<_>>();
                    Ok((Arc::new(MappedPlane(mapping)), plane.length, lengths))
                });

            match mapped {
                Ok((memory, length, lengths)) => {
                    state.mappings.push(memory.clone());
                    state.plane_lengths.push(lengths);
                    slots.push(SlotMapping {
                        index,
                        length,
                        memory,
                    });
                }
                Err(e) => {
                    drop(slots);
                    if let Err(free_err) = self.unmap_and_free(&mut state) {
                        debug!("Cleanup after mapping failure: {}", free_err);
                    }
                    return Err(e);
                }
            }
        }

        Ok(slots)
    }

    fn export_buffer(&self, index: u32) -> Result<ExportHandle> {
        let fd: OwnedFd =
            ioctl::expbuf(&self.fd, self.queue, index as usize, 0, ExpbufFlags::RDWR).map_err(
                |e| CaptureError::Device(format!("Failed to export buffer {}: {}", index, e)),
            )?;
        Ok(ExportHandle::dmabuf(index, fd))
    }

    fn release_buffers(&self) -> Result<()> {
        let mut state = self.buffers.lock();
        if state.mappings.is_empty() {
            return Ok(());
        }
        self.unmap_and_free(&mut state)
    }

    fn stream_on(&self) -> Result<()> {
        let mut state = self.buffers.lock();
        if state.streaming {
            return Ok(());
        }
        ioctl::streamon(&self.fd, self.queue)
            .map_err(|e| CaptureError::Device(format!("Failed to start capture stream: {}", e)))?;
        state.streaming = true;
        Ok(())
    }

    fn stream_off(&self) -> Result<()> {
        let mut state = self.buffers.lock();
        if !state.streaming {
            return Ok(());
        }
        state.streaming = false;
        ioctl::streamoff(&self.fd, self.queue)
            .map_err(|e| CaptureError::Device(format!("Failed to stop capture stream: {}", e)))?;
        Ok(())
    }

    fn dequeue(&self, timeout: Duration) -> std::result::Result<DequeuedBuffer, PollError> {
        self.wait_ready(timeout)?;

        let dqbuf: V4l2Buffer = ioctl::dqbuf(&self.fd, self.queue).map_err(dqbuf_error)?;
        let raw = dqbuf.as_v4l2_buffer();
        let bytes_used = dqbuf
            .planes_iter()
            .next()
            .map(|plane| *plane.bytesused)
            .unwrap_or(0);

        Ok(DequeuedBuffer {
            index: raw.index,
            bytes_used,
            sequence: raw.sequence,
            timestamp: Duration::from_secs(raw.timestamp.tv_sec.max(0) as u64)
                + Duration::from_micros(raw.timestamp.tv_usec.max(0) as u64),
        })
    }

    fn queue(&self, index: u32) -> Result<()> {
        let lengths = {
            let state = self.buffers.lock();
            state
                .plane_lengths
                .get(index as usize)
                .cloned()
                .ok_or_else(|| CaptureError::Device(format!("No buffer at index {}", index)))?
        };

        let handle = MmapHandle::default();
        let planes = lengths
            .iter()
            .map(|length| {
                let mut plane = QBufPlane::new_from_handle(&handle, 0);
                plane.0.length = *length;
                plane
            })
            .collect();
        let mut qbuf: QBuffer<MmapHandle> = QBuffer::new(self.queue, index);
        qbuf.planes = planes;
        ioctl::qbuf::<_, ()>(&self.fd, qbuf).map_err(|e| qbuf_error(&self.name, index, e))?;
        Ok(())
    }
}

/// Classify a failed VIDIOC_DQBUF from the error value v4l2r reports
fn dqbuf_error<CE: std::fmt::Debug>(error: IoctlConvertError<DqBufIoctlError, CE>) -> PollError {
    match error {
        IoctlConvertError::IoctlError(DqBufIoctlError::NotReady) => PollError::Timeout,
        IoctlConvertError::IoctlError(DqBufIoctlError::Eos) => {
            PollError::DeviceLost("dqbuf: end of stream".to_string())
        }
        IoctlConvertError::IoctlError(DqBufIoctlError::Other(errno)) => {
            PollError::from_errno(errno as i32, "dqbuf")
        }
        IoctlConvertError::ConversionError(e) => {
            PollError::Failed(format!("dqbuf returned an invalid buffer: {:?}", e))
        }
    }
}

/// Map a failed VIDIOC_QBUF, keeping device loss distinct from other errors
fn qbuf_error<CE: std::fmt::Debug>(
    device: &str,
    index: u32,
    error: IoctlConvertError<QBufIoctlError, CE>,
) -> CaptureError {
    if let IoctlConvertError::IoctlError(QBufIoctlError::Other(errno)) = &error {
        if let PollError::DeviceLost(reason) = PollError::from_errno(*errno as i32, "qbuf") {
            return CaptureError::DeviceLost {
                device: device.to_string(),
                reason,
            };
        }
    }
    CaptureError::Device(format!("Failed to queue buffer {}: {:?}", index, error))
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        if let Err(e) = self.stream_off() {
            debug!("Failed to stop capture stream: {}", e);
        }
        if let Err(e) = self.release_buffers() {
            debug!("Failed to release buffers: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use v4l2r::nix::errno::Errno;

    fn dq(errno: Errno) -> PollError {
        dqbuf_error::<()>(IoctlConvertError::IoctlError(DqBufIoctlError::from(errno)))
    }

    #[test]
    fn test_dqbuf_errors_classified_by_errno() {
        assert!(matches!(dq(Errno::EAGAIN), PollError::Timeout));
        assert!(matches!(dq(Errno::EINTR), PollError::Interrupted));
        assert!(matches!(dq(Errno::ENODEV), PollError::DeviceLost(_)));
        assert!(matches!(dq(Errno::EPIPE), PollError::DeviceLost(_)));
        assert!(matches!(dq(Errno::EINVAL), PollError::Failed(_)));
        assert!(matches!(
            dqbuf_error::<&str>(IoctlConvertError::ConversionError("bad")),
            PollError::Failed(_)
        ));
    }

    #[test]
    fn test_qbuf_device_loss() {
        let lost = qbuf_error::<()>(
            "cam",
            3,
            IoctlConvertError::IoctlError(QBufIoctlError::Other(Errno::ENODEV)),
        );
        assert!(matches!(lost, CaptureError::DeviceLost { .. }));
        let other = qbuf_error::<()>(
            "cam",
            3,
            IoctlConvertError::IoctlError(QBufIoctlError::Other(Errno::EINVAL)),
        );
        assert!(matches!(other, CaptureError::Device(_)));
    }
}
