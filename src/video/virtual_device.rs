//! In-memory capture device that emits patterned frames.
//!
//! Behaves like a V4L2 mmap capture queue: buffers must be queued before the
//! device can fill them, a dequeued buffer stays with the caller until it is
//! queued again, and STREAMOFF takes every buffer back. Each filled frame has
//! its luma plane set to the low byte of the frame sequence.
//!
//! Bookkeeping (queue depth, double queues) and failure injection make it the
//! device used by the pipeline tests.

use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

use super::device::{
    CaptureDevice, DequeuedBuffer, DeviceCaps, ExportHandle, PollError, SlotMapping, SlotMemory,
};
use super::format::{select_pixel_format, select_resolution, Format, PixelFormat, Resolution};
use crate::error::{CaptureError, Result};

/// Heap memory standing in for an mmap'd buffer
struct HeapSlot {
    data: UnsafeCell<Box<[u8]>>,
}

// SAFETY: the device writes a slot only while it sits in the device queue,
// readers only touch it after dequeue; the queue lock orders the two.
unsafe impl Send for HeapSlot {}
unsafe impl Sync for HeapSlot {}

impl HeapSlot {
    fn new(len: usize) -> Self {
        Self {
            data: UnsafeCell::new(vec![0u8; len].into_boxed_slice()),
        }
    }

    /// # Safety
    /// Caller must own the slot on the device side (slot is queued, not in flight).
    #[allow(clippy::mut_from_ref)]
    unsafe fn device_write(&self) -> &mut [u8] {
        &mut *self.data.get()
    }
}

impl SlotMemory for HeapSlot {
    fn as_slice(&self) -> &[u8] {
        unsafe { &*self.data.get() }
    }
}

/// Static description of a virtual device
#[derive(Debug, Clone)]
pub struct VirtualDeviceConfig {
    pub name: String,
    /// Formats in the order the device enumerates them
    pub formats: Vec<PixelFormat>,
    /// Discrete frame sizes offered for every format
    pub sizes: Vec<Resolution>,
    /// Throttle frame production to the configured frame rate
    pub paced: bool,
    /// Stop producing after this many frames (silent source afterwards)
    pub max_frames: Option<u64>,
}

impl Default for VirtualDeviceConfig {
    fn default() -> Self {
        Self {
            name: "virtual".to_string(),
            formats: vec![PixelFormat::Yuyv, PixelFormat::Nv12],
            sizes: vec![
                Resolution::new(640, 480),
                Resolution::new(1280, 720),
                Resolution::new(1920, 1080),
            ],
            paced: false,
            max_frames: None,
        }
    }
}

#[derive(Default)]
struct Faults {
    fail_map_at: Option<u32>,
    fail_export_at: Option<u32>,
    grant_limit: Option<u32>,
    dequeue_errors: VecDeque<PollError>,
    queue_errors: usize,
}

#[derive(Default)]
struct State {
    format: Option<Format>,
    fps: u32,
    slots: Vec<Arc<HeapSlot>>,
    in_device: Vec<bool>,
    queued: VecDeque<u32>,
    streaming: bool,
    sequence: u32,
    frames_produced: u64,
    last_frame: Option<Instant>,
    queue_calls: u64,
    double_queues: u64,
    releases: u64,
    faults: Faults,
}

/// Patterned in-memory capture device
pub struct VirtualDevice {
    config: VirtualDeviceConfig,
    state: Mutex<State>,
    filled: Condvar,
}

impl VirtualDevice {
    pub fn new(config: VirtualDeviceConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            filled: Condvar::new(),
        }
    }

    /// Unpaced device offering NV12 and YUYV at the given sizes
    pub fn with_sizes(sizes: &[Resolution]) -> Self {
        Self::new(VirtualDeviceConfig {
            formats: vec![PixelFormat::Nv12, PixelFormat::Yuyv],
            sizes: sizes.to_vec(),
            ..Default::default()
        })
    }

    /// Fail the map step of buffer `index` on the next request
    pub fn fail_map_at(&self, index: u32) {
        self.state.lock().faults.fail_map_at = Some(index);
    }

    pub fn fail_export_at(&self, index: u32) {
        self.state.lock().faults.fail_export_at = Some(index);
    }

    /// Grant at most `count` buffers
    pub fn limit_buffers(&self, count: u32) {
        self.state.lock().faults.grant_limit = Some(count);
    }

    /// Return `error` from the next `count` dequeue calls
    pub fn inject_dequeue_errors(&self, count: usize, error: PollError) {
        let mut state = self.state.lock();
        state
            .faults
            .dequeue_errors
            .extend(std::iter::repeat(error).take(count));
        drop(state);
        self.filled.notify_all();
    }

    /// Refuse the next `count` queue calls
    pub fn fail_next_queues(&self, count: usize) {
        self.state.lock().faults.queue_errors += count;
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults = Faults::default();
    }

    /// Buffers currently owned by the device
    pub fn device_queue_depth(&self) -> usize {
        self.state.lock().queued.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn queue_calls(&self) -> u64 {
        self.state.lock().queue_calls
    }

    /// Number of queue calls for a slot the device already owned
    pub fn double_queue_count(&self) -> u64 {
        self.state.lock().double_queues
    }

    pub fn frames_produced(&self) -> u64 {
        self.state.lock().frames_produced
    }

    pub fn release_count(&self) -> u64 {
        self.state.lock().releases
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().streaming
    }

    pub fn frame_rate(&self) -> u32 {
        self.state.lock().fps
    }

    fn fill_pattern(slot: &HeapSlot, format: &Format, sequence: u32) {
        // SAFETY: called with the state lock held on a slot just popped from the
        // device queue, before it is handed out.
        let data = unsafe { slot.device_write() };
        let value = (sequence & 0xff) as u8;
        let pixels = format.resolution.pixels() as usize;
        match format.pixel_format {
            PixelFormat::Yuyv => {
                for (i, byte) in data.iter_mut().take(pixels * 2).enumerate() {
                    *byte = if i % 2 == 0 { value } else { 128 };
                }
            }
            PixelFormat::Uyvy => {
                for (i, byte) in data.iter_mut().take(pixels * 2).enumerate() {
                    *byte = if i % 2 == 1 { value } else { 128 };
                }
            }
            _ => {
                let luma = pixels.min(data.len());
                data[..luma].fill(value);
                data[luma..].fill(128);
            }
        }
    }
}

impl CaptureDevice for VirtualDevice {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn query_capabilities(&self) -> Result<DeviceCaps> {
        Ok(DeviceCaps {
            driver: "virtual".to_string(),
            card: self.config.name.clone(),
            bus_info: "platform:virtual".to_string(),
            video_capture: true,
            video_capture_mplane: false,
            streaming: true,
            formats: self.config.formats.clone(),
        })
    }

    fn negotiate_format(&self, preferred: &[PixelFormat], target: Resolution) -> Result<Format> {
        let pixel_format = select_pixel_format(&self.config.formats, preferred).ok_or_else(|| {
            CaptureError::Device(format!(
                "{} offers none of the preferred formats {:?}",
                self.config.name, preferred
            ))
        })?;
        let resolution =
            select_resolution(&self.config.sizes, target.width).unwrap_or(Resolution::UHD4K);
        Ok(Format::packed(resolution, pixel_format))
    }

    fn set_format(&self, format: &Format) -> Result<Format> {
        let mut state = self.state.lock();
        if !state.slots.is_empty() {
            return Err(CaptureError::Device(
                "cannot change format while buffers are allocated".to_string(),
            ));
        }
        let effective = Format::packed(format.resolution, format.pixel_format);
        state.format = Some(effective);
        Ok(effective)
    }

    fn set_frame_rate(&self, fps: u32) -> Result<()> {
        self.state.lock().fps = fps;
        Ok(())
    }

    fn request_buffers(&self, count: u32) -> Result<Vec<SlotMapping>> {
        let mut state = self.state.lock();
        let format = state
            .format
            .ok_or_else(|| CaptureError::InvalidState("format not set".to_string()))?;
        if !state.slots.is_empty() {
            return Err(CaptureError::InvalidState(
                "buffers already requested".to_string(),
            ));
        }

        let granted = state.faults.grant_limit.map_or(count, |limit| count.min(limit));
        if state.faults.fail_map_at.is_some_and(|index| index < granted) {
            state.faults.fail_map_at = None;
            return Err(CaptureError::Device("injected mmap failure".to_string()));
        }

        let mut mappings = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            let slot = Arc::new(HeapSlot::new(format.size_image as usize));
            state.slots.push(slot.clone());
            mappings.push(SlotMapping {
                index,
                length: format.size_image,
                memory: slot,
            });
        }
        state.in_device = vec![false; granted as usize];
        debug!("{}: allocated {} buffers of {} bytes", self.config.name, granted, format.size_image);
        Ok(mappings)
    }

    fn export_buffer(&self, index: u32) -> Result<ExportHandle> {
        let mut state = self.state.lock();
        if state.faults.fail_export_at == Some(index) {
            state.faults.fail_export_at = None;
            return Err(CaptureError::Device(format!(
                "injected export failure at {}",
                index
            )));
        }
        if index as usize >= state.slots.len() {
            return Err(CaptureError::Device(format!("No buffer at index {}", index)));
        }
        Ok(ExportHandle::memory(index))
    }

    fn release_buffers(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.streaming {
            return Err(CaptureError::InvalidState(
                "cannot free buffers while streaming".to_string(),
            ));
        }
        if state.slots.is_empty() {
            return Ok(());
        }
        state.slots.clear();
        state.in_device.clear();
        state.queued.clear();
        state.releases += 1;
        Ok(())
    }

    fn stream_on(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.slots.is_empty() {
            return Err(CaptureError::InvalidState("no buffers allocated".to_string()));
        }
        state.streaming = true;
        state.last_frame = None;
        Ok(())
    }

    fn stream_off(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.streaming = false;
        state.queued.clear();
        state.in_device.iter_mut().for_each(|owned| *owned = false);
        drop(state);
        self.filled.notify_all();
        Ok(())
    }

    fn dequeue(&self, timeout: Duration) -> std::result::Result<DequeuedBuffer, PollError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(error) = state.faults.dequeue_errors.pop_front() {
                return Err(error);
            }
            if !state.streaming {
                return Err(PollError::Failed("device is not streaming".to_string()));
            }

            let exhausted = self
                .config
                .max_frames
                .is_some_and(|max| state.frames_produced >= max);
            let due = match (self.config.paced, state.fps, state.last_frame) {
                (true, fps, Some(last)) if fps > 0 => last + Duration::from_secs(1) / fps,
                _ => Instant::now(),
            };

            let now = Instant::now();
            if !exhausted && !state.queued.is_empty() && now >= due {
                let Some(index) = state.queued.pop_front() else {
                    continue;
                };
                state.in_device[index as usize] = false;
                let format = state.format.unwrap_or_else(|| {
                    Format::packed(Resolution::VGA, PixelFormat::Yuyv)
                });
                let sequence = state.sequence;
                Self::fill_pattern(&state.slots[index as usize], &format, sequence);
                state.sequence = state.sequence.wrapping_add(1);
                state.frames_produced += 1;
                state.last_frame = Some(now);
                return Ok(DequeuedBuffer {
                    index,
                    bytes_used: format.size_image,
                    sequence,
                    timestamp: Duration::from_micros(state.frames_produced * 1000),
                });
            }

            if now >= deadline {
                return Err(PollError::Timeout);
            }
            let wake = if !exhausted && !state.queued.is_empty() {
                due.min(deadline)
            } else {
                deadline
            };
            self.filled.wait_until(&mut state, wake);
        }
    }

    fn queue(&self, index: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.queue_calls += 1;
        if state.faults.queue_errors > 0 {
            state.faults.queue_errors -= 1;
            return Err(CaptureError::Device(format!(
                "{}: queue of slot {} refused",
                self.config.name, index
            )));
        }
        let Some(owned) = state.in_device.get(index as usize).copied() else {
            return Err(CaptureError::Device(format!("No buffer at index {}", index)));
        };
        if owned {
            state.double_queues += 1;
            error!("{}: slot {} queued while already owned by the device", self.config.name, index);
            return Err(CaptureError::ProtocolViolation(format!(
                "slot {} queued twice",
                index
            )));
        }
        state.in_device[index as usize] = true;
        state.queued.push_back(index);
        drop(state);
        self.filled.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streaming_device(count: u32) -> (VirtualDevice, Vec<SlotMapping>) {
        let device = VirtualDevice::with_sizes(&[Resolution::new(320, 240)]);
        let format = device
            .negotiate_format(PixelFormat::preferred_capture(), Resolution::new(320, 240))
            .unwrap();
        device.set_format(&format).unwrap();
        let slots = device.request_buffers(count).unwrap();
        for slot in &slots {
            device.queue(slot.index).unwrap();
        }
        device.stream_on().unwrap();
        (device, slots)
    }

    #[test]
    fn test_negotiates_preferred_format() {
        let device = VirtualDevice::new(VirtualDeviceConfig::default());
        let format = device
            .negotiate_format(PixelFormat::preferred_capture(), Resolution::new(1300, 700))
            .unwrap();
        // Device enumerates YUYV before NV12.
        assert_eq!(format.pixel_format, PixelFormat::Yuyv);
        assert_eq!(format.resolution, Resolution::new(1280, 720));
    }

    #[test]
    fn test_dequeue_fills_pattern() {
        let (device, slots) = streaming_device(2);
        let first = device.dequeue(Duration::from_millis(100)).unwrap();
        assert_eq!(first.sequence, 0);
        let second = device.dequeue(Duration::from_millis(100)).unwrap();
        assert_eq!(second.sequence, 1);
        assert_eq!(slots[second.index as usize].memory.as_slice()[0], 1);
        assert_eq!(device.device_queue_depth(), 0);

        // Nothing queued: the wait times out.
        assert_eq!(
            device.dequeue(Duration::from_millis(20)),
            Err(PollError::Timeout)
        );

        device.queue(first.index).unwrap();
        assert_eq!(device.device_queue_depth(), 1);
    }

    #[test]
    fn test_double_queue_detected() {
        let (device, _slots) = streaming_device(2);
        assert!(matches!(
            device.queue(0),
            Err(CaptureError::ProtocolViolation(_))
        ));
        assert_eq!(device.double_queue_count(), 1);
    }

    #[test]
    fn test_injected_dequeue_errors() {
        let (device, _slots) = streaming_device(2);
        device.inject_dequeue_errors(2, PollError::Failed("boom".into()));
        assert!(device.dequeue(Duration::from_millis(10)).is_err());
        assert!(device.dequeue(Duration::from_millis(10)).is_err());
        assert!(device.dequeue(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_grant_limit_and_release() {
        let device = VirtualDevice::with_sizes(&[Resolution::VGA]);
        device
            .set_format(&Format::packed(Resolution::VGA, PixelFormat::Nv12))
            .unwrap();
        device.limit_buffers(2);
        assert_eq!(device.request_buffers(4).unwrap().len(), 2);
        device.release_buffers().unwrap();
        device.release_buffers().unwrap();
        assert_eq!(device.release_count(), 1);
    }

    #[test]
    fn test_stream_off_reclaims_buffers() {
        let (device, _slots) = streaming_device(3);
        device.stream_off().unwrap();
        assert_eq!(device.device_queue_depth(), 0);
        assert!(device.dequeue(Duration::from_millis(5)).is_err());
        // Requeue after streamoff is allowed.
        device.queue(0).unwrap();
    }

    #[test]
    fn test_max_frames_goes_silent() {
        let device = VirtualDevice::new(VirtualDeviceConfig {
            formats: vec![PixelFormat::Nv12],
            sizes: vec![Resolution::VGA],
            max_frames: Some(1),
            ..Default::default()
        });
        device
            .set_format(&Format::packed(Resolution::VGA, PixelFormat::Nv12))
            .unwrap();
        let slots = device.request_buffers(2).unwrap();
        for slot in &slots {
            device.queue(slot.index).unwrap();
        }
        device.stream_on().unwrap();
        assert!(device.dequeue(Duration::from_millis(10)).is_ok());
        assert_eq!(
            device.dequeue(Duration::from_millis(10)),
            Err(PollError::Timeout)
        );
    }
}
