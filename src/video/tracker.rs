//! Completion tracking and slot return
//!
//! Every dequeued slot is marked in flight until each consumer it was fanned
//! out to has reported done (or was skipped). The last report queues the slot
//! back to the device. A slot is queued back exactly once per dequeue; any
//! second return is a protocol violation.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use super::device::{CaptureDevice, DequeuedBuffer};
use super::format::Format;
use super::frame::{FrameDescriptor, FrameLease};
use super::stats::PipelineCounters;
use crate::error::{CaptureError, Result};

#[derive(Debug, Clone, Copy, Default)]
struct SlotState {
    in_flight: bool,
    /// Frame currently holding the slot
    sequence: u64,
    /// Returned by its consumers but refused by the device
    stranded: bool,
}

struct FpsWindow {
    interval: Duration,
    started: Instant,
    returned: u64,
}

/// Per-slot in-flight bookkeeping and the return path to the device
pub struct CompletionTracker {
    device: Arc<dyn CaptureDevice>,
    slots: Mutex<Vec<SlotState>>,
    counters: Arc<PipelineCounters>,
    notifications: AtomicU64,
    closed: AtomicBool,
    fps: Mutex<FpsWindow>,
}

impl CompletionTracker {
    pub fn new(
        device: Arc<dyn CaptureDevice>,
        slot_count: usize,
        counters: Arc<PipelineCounters>,
        fps_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            device,
            slots: Mutex::new(vec![SlotState::default(); slot_count]),
            counters,
            notifications: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            fps: Mutex::new(FpsWindow {
                interval: fps_interval,
                started: Instant::now(),
                returned: 0,
            }),
        })
    }

    /// Hand every slot to the device before streaming starts
    pub fn prime(&self) -> Result<()> {
        let count = {
            let mut slots = self.slots.lock();
            slots.iter_mut().for_each(|s| *s = SlotState::default());
            slots.len()
        };
        for index in 0..count as u32 {
            self.device.queue(index)?;
        }
        Ok(())
    }

    /// Record a dequeued buffer and build its descriptor
    pub fn begin_frame(
        &self,
        buffer: &DequeuedBuffer,
        sequence: u64,
        format: Format,
        consumers: u32,
    ) -> Result<Arc<FrameDescriptor>> {
        {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(buffer.index as usize) else {
                drop(slots);
                return Err(self.violation(format!(
                    "device returned unknown slot {}",
                    buffer.index
                )));
            };
            if slot.in_flight {
                let holder = slot.sequence;
                drop(slots);
                return Err(self.violation(format!(
                    "device returned slot {} still held by frame {}",
                    buffer.index, holder
                )));
            }
            slot.in_flight = true;
            slot.sequence = sequence;
        }

        Ok(Arc::new(FrameDescriptor::new(
            buffer.index,
            sequence,
            buffer.sequence,
            format,
            buffer.bytes_used,
            buffer.timestamp,
            consumers,
        )))
    }

    /// Issue one consumer's claim on `frame`
    pub fn lease(self: &Arc<Self>, frame: &Arc<FrameDescriptor>) -> FrameLease {
        FrameLease::new(frame.clone(), Arc::downgrade(self))
    }

    /// One consumer is done with `frame`; the last one returns the slot
    pub fn notify_done(&self, frame: &FrameDescriptor) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
        match frame.release_one() {
            Some(true) => self.return_slot(frame.slot_index, frame.sequence),
            Some(false) => {}
            None => {
                self.violation(format!(
                    "completion for frame {} (slot {}) after all consumers reported",
                    frame.sequence, frame.slot_index
                ));
            }
        }
    }

    /// Return a frame that was fanned out to nobody
    pub fn return_unclaimed(&self, frame: &FrameDescriptor) {
        if frame.consumers() != 0 {
            self.violation(format!(
                "frame {} has {} consumers and cannot be returned unclaimed",
                frame.sequence,
                frame.consumers()
            ));
            return;
        }
        self.return_slot(frame.slot_index, frame.sequence);
    }

    fn return_slot(&self, index: u32, sequence: u64) {
        {
            let mut slots = self.slots.lock();
            match slots.get_mut(index as usize) {
                Some(slot) if slot.in_flight && slot.sequence == sequence => {
                    slot.in_flight = false;
                }
                _ => {
                    drop(slots);
                    self.violation(format!(
                        "slot {} returned twice (frame {})",
                        index, sequence
                    ));
                    return;
                }
            }
        }

        if self.closed.load(Ordering::Acquire) {
            debug!("Slot {} returned after close, not requeued", index);
            return;
        }

        if let Err(e) = self.device.queue(index) {
            PipelineCounters::incr(&self.counters.requeue_failures);
            warn!("Failed to requeue slot {}, left for retry: {}", index, e);
            if let Some(slot) = self.slots.lock().get_mut(index as usize) {
                slot.stranded = true;
            }
            return;
        }
        PipelineCounters::incr(&self.counters.frames_returned);
        self.tick_fps();
    }

    /// Queue again every slot the device refused on return. Stops at the
    /// first refusal, which is returned; the rest stay stranded.
    pub fn requeue_stranded(&self) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(0);
        }
        let stranded: Vec<u32> = self
            .slots
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.stranded)
            .map(|(index, _)| index as u32)
            .collect();

        let mut requeued = 0;
        for index in stranded {
            if let Err(e) = self.device.queue(index) {
                PipelineCounters::incr(&self.counters.requeue_failures);
                return Err(e);
            }
            if let Some(slot) = self.slots.lock().get_mut(index as usize) {
                slot.stranded = false;
            }
            debug!("Stranded slot {} requeued", index);
            PipelineCounters::incr(&self.counters.frames_returned);
            self.tick_fps();
            requeued += 1;
        }
        Ok(requeued)
    }

    /// Slots held by neither the device nor any consumer
    pub fn stranded_count(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.stranded).count()
    }

    fn tick_fps(&self) {
        let mut window = self.fps.lock();
        window.returned += 1;
        let elapsed = window.started.elapsed();
        if elapsed >= window.interval && !window.interval.is_zero() {
            let fps = window.returned as f64 / elapsed.as_secs_f64();
            self.counters.set_fps(fps);
            debug!("Capture FPS: {:.2} ({} frames)", fps, window.returned);
            window.started = Instant::now();
            window.returned = 0;
        }
    }

    fn violation(&self, message: String) -> CaptureError {
        PipelineCounters::incr(&self.counters.protocol_violations);
        error!("Protocol violation: {}", message);
        debug_assert!(false, "protocol violation: {}", message);
        CaptureError::ProtocolViolation(message)
    }

    /// Stop requeueing: slots returned from now on are only marked free
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_in_flight(&self, index: u32) -> bool {
        self.slots
            .lock()
            .get(index as usize)
            .is_some_and(|slot| slot.in_flight)
    }

    pub fn in_flight_count(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.in_flight).count()
    }

    /// Total completion reports received
    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }

    pub fn counters(&self) -> &Arc<PipelineCounters> {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::{PixelFormat, Resolution};
    use crate::video::virtual_device::VirtualDevice;

    fn setup(slots: u32) -> (Arc<VirtualDevice>, Arc<CompletionTracker>, Format) {
        let device = Arc::new(VirtualDevice::with_sizes(&[Resolution::VGA]));
        let format = device
            .set_format(&Format::packed(Resolution::VGA, PixelFormat::Nv12))
            .unwrap();
        device.request_buffers(slots).unwrap();
        let tracker = CompletionTracker::new(
            device.clone(),
            slots as usize,
            Arc::new(PipelineCounters::default()),
            Duration::from_secs(2),
        );
        tracker.prime().unwrap();
        device.stream_on().unwrap();
        (device, tracker, format)
    }

    #[test]
    fn test_slot_returned_after_last_consumer() {
        let (device, tracker, format) = setup(2);
        let buffer = device.dequeue(Duration::from_millis(50)).unwrap();
        let frame = tracker.begin_frame(&buffer, 1, format, 2).unwrap();
        let a = tracker.lease(&frame);
        let b = tracker.lease(&frame);
        assert!(tracker.is_in_flight(buffer.index));
        assert_eq!(device.device_queue_depth(), 1);

        a.complete();
        assert!(tracker.is_in_flight(buffer.index));
        assert_eq!(device.device_queue_depth(), 1);

        drop(b);
        assert!(!tracker.is_in_flight(buffer.index));
        assert_eq!(device.device_queue_depth(), 2);
        assert_eq!(tracker.counters().snapshot().frames_returned, 1);
        assert_eq!(tracker.notifications(), 2);
        assert_eq!(device.double_queue_count(), 0);
    }

    #[test]
    fn test_unclaimed_frame_returns_immediately() {
        let (device, tracker, format) = setup(2);
        let buffer = device.dequeue(Duration::from_millis(50)).unwrap();
        let frame = tracker.begin_frame(&buffer, 1, format, 0).unwrap();
        tracker.return_unclaimed(&frame);
        assert_eq!(device.device_queue_depth(), 2);
        assert_eq!(tracker.in_flight_count(), 0);
    }

    #[test]
    fn test_closed_tracker_does_not_requeue() {
        let (device, tracker, format) = setup(2);
        let buffer = device.dequeue(Duration::from_millis(50)).unwrap();
        let frame = tracker.begin_frame(&buffer, 1, format, 1).unwrap();
        let lease = tracker.lease(&frame);
        tracker.close();
        drop(lease);
        assert_eq!(device.device_queue_depth(), 1);
        assert!(!tracker.is_in_flight(buffer.index));
    }

    #[test]
    fn test_refused_return_is_retried() {
        let (device, tracker, format) = setup(2);
        let buffer = device.dequeue(Duration::from_millis(50)).unwrap();
        let frame = tracker.begin_frame(&buffer, 1, format, 1).unwrap();
        device.fail_next_queues(2);
        tracker.lease(&frame).complete();

        assert!(!tracker.is_in_flight(buffer.index));
        assert_eq!(tracker.stranded_count(), 1);
        assert_eq!(device.device_queue_depth(), 1);

        assert!(tracker.requeue_stranded().is_err());
        assert_eq!(tracker.stranded_count(), 1);

        assert_eq!(tracker.requeue_stranded().unwrap(), 1);
        assert_eq!(tracker.stranded_count(), 0);
        assert_eq!(device.device_queue_depth(), 2);
        let stats = tracker.counters().snapshot();
        assert_eq!(stats.requeue_failures, 2);
        assert_eq!(stats.frames_returned, 1);
        assert_eq!(device.double_queue_count(), 0);
    }

    #[test]
    fn test_lease_after_tracker_dropped() {
        let (device, tracker, format) = setup(2);
        let buffer = device.dequeue(Duration::from_millis(50)).unwrap();
        let frame = tracker.begin_frame(&buffer, 1, format, 1).unwrap();
        let lease = tracker.lease(&frame);
        drop(tracker);
        drop(lease);
        assert_eq!(device.device_queue_depth(), 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "protocol violation")]
    fn test_double_completion_fails_fast() {
        let (device, tracker, format) = setup(2);
        let buffer = device.dequeue(Duration::from_millis(50)).unwrap();
        let frame = tracker.begin_frame(&buffer, 1, format, 1).unwrap();
        tracker.notify_done(&frame);
        tracker.notify_done(&frame);
    }
}
