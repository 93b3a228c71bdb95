//! Pipeline and per-unit counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the poll loop and the completion tracker
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub frames_dequeued: AtomicU64,
    pub frames_returned: AtomicU64,
    pub frames_dropped_backpressure: AtomicU64,
    pub poll_timeouts: AtomicU64,
    pub poll_errors: AtomicU64,
    pub protocol_violations: AtomicU64,
    pub requeue_failures: AtomicU64,
    /// Last measured return rate, stored as f64 bits
    current_fps: AtomicU64,
}

impl PipelineCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_fps(&self, fps: f64) {
        self.current_fps.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            frames_dequeued: self.frames_dequeued.load(Ordering::Relaxed),
            frames_returned: self.frames_returned.load(Ordering::Relaxed),
            frames_dropped_backpressure: self.frames_dropped_backpressure.load(Ordering::Relaxed),
            poll_timeouts: self.poll_timeouts.load(Ordering::Relaxed),
            poll_errors: self.poll_errors.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            requeue_failures: self.requeue_failures.load(Ordering::Relaxed),
            current_fps: f64::from_bits(self.current_fps.load(Ordering::Relaxed)),
        }
    }
}

/// Pipeline statistics snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub frames_dequeued: u64,
    pub frames_returned: u64,
    pub frames_dropped_backpressure: u64,
    pub poll_timeouts: u64,
    pub poll_errors: u64,
    pub protocol_violations: u64,
    /// Slot returns the device refused; such slots are retried by the poll loop
    pub requeue_failures: u64,
    pub current_fps: f64,
}

/// Live counters of one processing unit
#[derive(Debug, Default)]
pub struct UnitCounters {
    pub frames_received: AtomicU64,
    pub frames_processed: AtomicU64,
    pub frames_skipped: AtomicU64,
    pub frames_failed: AtomicU64,
    pub packets_emitted: AtomicU64,
    pub packets_dropped: AtomicU64,
}

impl UnitCounters {
    pub fn snapshot(&self) -> UnitStats {
        UnitStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            frames_failed: self.frames_failed.load(Ordering::Relaxed),
            packets_emitted: self.packets_emitted.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Unit statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnitStats {
    /// Frames accepted into the request queue
    pub frames_received: u64,
    pub frames_processed: u64,
    /// Frames not delivered: decimated or queue full
    pub frames_skipped: u64,
    pub frames_failed: u64,
    pub packets_emitted: u64,
    pub packets_dropped: u64,
}
