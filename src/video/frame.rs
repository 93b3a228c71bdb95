//! Frame descriptors and completion leases

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use super::format::{Format, PixelFormat, Resolution};
use super::tracker::CompletionTracker;

/// One dequeued buffer as seen by the consumers it was fanned out to
///
/// `pending` starts at the number of consumers the frame was handed to and is
/// decremented once per consumer; the slot goes back to the device when it
/// reaches zero.
pub struct FrameDescriptor {
    /// Device buffer holding the image
    pub slot_index: u32,
    /// Pipeline frame number, 1-based, in dequeue order
    pub sequence: u64,
    /// Sequence number reported by the driver
    pub device_sequence: u32,
    pub format: Format,
    pub bytes_used: u32,
    /// Driver timestamp
    pub timestamp: Duration,
    pub captured_at: Instant,
    consumers: u32,
    pending: AtomicU32,
}

impl FrameDescriptor {
    pub fn new(
        slot_index: u32,
        sequence: u64,
        device_sequence: u32,
        format: Format,
        bytes_used: u32,
        timestamp: Duration,
        consumers: u32,
    ) -> Self {
        Self {
            slot_index,
            sequence,
            device_sequence,
            format,
            bytes_used,
            timestamp,
            captured_at: Instant::now(),
            consumers,
            pending: AtomicU32::new(consumers),
        }
    }

    pub fn width(&self) -> u32 {
        self.format.width()
    }

    pub fn height(&self) -> u32 {
        self.format.height()
    }

    pub fn resolution(&self) -> Resolution {
        self.format.resolution
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.format.pixel_format
    }

    /// Number of consumers the frame was fanned out to
    pub fn consumers(&self) -> u32 {
        self.consumers
    }

    /// Consumers that still owe a completion
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    /// Account for one consumer.
    ///
    /// Returns `Some(true)` for the call that brings the count to zero and
    /// `None` if the count was already zero.
    pub(crate) fn release_one(&self) -> Option<bool> {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()
            .map(|previous| previous == 1)
    }
}

impl fmt::Debug for FrameDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameDescriptor")
            .field("slot_index", &self.slot_index)
            .field("sequence", &self.sequence)
            .field("format", &self.format)
            .field("consumers", &self.consumers)
            .field("pending", &self.pending())
            .finish()
    }
}

/// A consumer's claim on a frame
///
/// Completing the lease, or dropping it unprocessed, reports the consumer done
/// to the tracker exactly once. The tracker is held weakly: a lease never keeps
/// a stopped pipeline alive.
pub struct FrameLease {
    frame: Arc<FrameDescriptor>,
    tracker: Weak<CompletionTracker>,
    released: bool,
}

impl FrameLease {
    pub(crate) fn new(frame: Arc<FrameDescriptor>, tracker: Weak<CompletionTracker>) -> Self {
        Self {
            frame,
            tracker,
            released: false,
        }
    }

    pub fn frame(&self) -> &FrameDescriptor {
        &self.frame
    }

    /// Report this consumer done with the frame
    pub fn complete(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.notify_done(&self.frame);
        }
    }
}

impl fmt::Debug for FrameLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameLease")
            .field("slot_index", &self.frame.slot_index)
            .field("sequence", &self.frame.sequence)
            .finish()
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(consumers: u32) -> FrameDescriptor {
        FrameDescriptor::new(
            1,
            7,
            6,
            Format::packed(Resolution::VGA, PixelFormat::Nv12),
            0,
            Duration::ZERO,
            consumers,
        )
    }

    #[test]
    fn test_release_reaches_zero_once() {
        let frame = descriptor(3);
        assert_eq!(frame.release_one(), Some(false));
        assert_eq!(frame.release_one(), Some(false));
        assert_eq!(frame.release_one(), Some(true));
        assert_eq!(frame.release_one(), None);
        assert_eq!(frame.pending(), 0);
        assert_eq!(frame.consumers(), 3);
    }

    #[test]
    fn test_lease_without_tracker_is_noop() {
        let frame = Arc::new(descriptor(1));
        let lease = FrameLease::new(frame.clone(), Weak::new());
        assert_eq!(lease.frame().sequence, 7);
        lease.complete();
        // No tracker to notify: the counter is untouched.
        assert_eq!(frame.pending(), 1);
    }
}
