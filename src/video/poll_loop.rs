//! Capture poll loop
//!
//! Waits for filled buffers, wraps each in a [`FrameDescriptor`] whose pending
//! count equals the number of units the frame is delivered to, and fans leases
//! out to every active unit that admits the frame. Frames nobody takes go
//! straight back to the device.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info};

use super::device::{CaptureDevice, PollError};
use super::format::Format;
use super::stats::PipelineCounters;
use super::tracker::CompletionTracker;
use super::unit::{Decimator, ProcessingUnit, UnitId};
use crate::error::{CaptureError, Result};
use crate::utils::LogThrottler;
use crate::{error_throttled, warn_throttled};

/// A unit currently receiving frames
pub struct ActiveUnit {
    pub id: UnitId,
    pub decimator: Decimator,
    pub unit: ProcessingUnit,
}

/// Units frames are fanned out to. Membership changes take the same lock as
/// fan-out, so a unit sees either all of a frame's delivery or none of it.
pub type ActiveSet = Arc<Mutex<Vec<ActiveUnit>>>;

/// Result of one poll iteration
#[derive(Debug)]
pub enum PollOutcome {
    Delivered {
        sequence: u64,
        slot: u32,
        recipients: u32,
    },
    /// No unit admitted the frame; the slot was returned at once
    Unclaimed { sequence: u64, slot: u32 },
    Timeout,
    /// Transient dequeue error within the retry budget
    Error,
    /// The loop cannot continue
    Fatal(CaptureError),
}

pub struct PollLoop {
    device: Arc<dyn CaptureDevice>,
    tracker: Arc<CompletionTracker>,
    active: ActiveSet,
    counters: Arc<PipelineCounters>,
    format: Format,
    wait: Duration,
    max_consecutive_errors: u32,
    consecutive_errors: u32,
    sequence: u64,
    throttler: LogThrottler,
}

/// A refused requeue counts against the same budget as a failed dequeue
fn requeue_error(error: CaptureError) -> PollError {
    match error {
        CaptureError::DeviceLost { reason, .. } => PollError::DeviceLost(reason),
        other => PollError::Failed(format!("requeue of stranded slot: {}", other)),
    }
}

impl PollLoop {
    pub fn new(
        device: Arc<dyn CaptureDevice>,
        tracker: Arc<CompletionTracker>,
        active: ActiveSet,
        format: Format,
        wait: Duration,
        max_consecutive_errors: u32,
    ) -> Self {
        let counters = tracker.counters().clone();
        Self {
            device,
            tracker,
            active,
            counters,
            format,
            wait,
            max_consecutive_errors,
            consecutive_errors: 0,
            sequence: 0,
            throttler: LogThrottler::default(),
        }
    }

    /// Frames dequeued so far
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Wait for one buffer and distribute it
    pub fn poll_once(&mut self) -> PollOutcome {
        let requeue_failed = match self.tracker.requeue_stranded() {
            Ok(_) => false,
            Err(e) => {
                if let PollOutcome::Fatal(e) = self.on_poll_error(requeue_error(e)) {
                    return PollOutcome::Fatal(e);
                }
                true
            }
        };

        let buffer = match self.device.dequeue(self.wait) {
            Ok(buffer) => buffer,
            Err(e) => return self.on_poll_error(e),
        };

        if self.consecutive_errors > 0 && !requeue_failed {
            info!(
                "Dequeue recovered after {} consecutive errors",
                self.consecutive_errors
            );
            self.consecutive_errors = 0;
            self.throttler.clear("dequeue_failed");
        }
        self.throttler.clear("dequeue_timeout");
        self.sequence += 1;
        PipelineCounters::incr(&self.counters.frames_dequeued);
        let sequence = self.sequence;

        let mut active = self.active.lock();
        let admitted: Vec<usize> = active
            .iter_mut()
            .enumerate()
            .filter_map(|(i, entry)| {
                if entry.decimator.admit() {
                    Some(i)
                } else {
                    entry
                        .unit
                        .stats()
                        .frames_skipped
                        .fetch_add(1, Ordering::Relaxed);
                    None
                }
            })
            .collect();
        let recipients = admitted.len() as u32;

        let frame = match self
            .tracker
            .begin_frame(&buffer, sequence, self.format, recipients)
        {
            Ok(frame) => frame,
            Err(_) => return PollOutcome::Error,
        };

        if recipients == 0 {
            drop(active);
            self.tracker.return_unclaimed(&frame);
            return PollOutcome::Unclaimed {
                sequence,
                slot: buffer.index,
            };
        }

        for i in admitted {
            let entry = &active[i];
            if let Err(lease) = entry.unit.enqueue(self.tracker.lease(&frame)) {
                entry
                    .unit
                    .stats()
                    .frames_skipped
                    .fetch_add(1, Ordering::Relaxed);
                PipelineCounters::incr(&self.counters.frames_dropped_backpressure);
                warn_throttled!(
                    self.throttler,
                    "request_queue_full",
                    "{} request queue full, frame {} dropped",
                    entry.unit.name(),
                    sequence
                );
                drop(lease);
            }
        }

        PollOutcome::Delivered {
            sequence,
            slot: buffer.index,
            recipients,
        }
    }

    fn on_poll_error(&mut self, error: PollError) -> PollOutcome {
        match error {
            PollError::Timeout => {
                PipelineCounters::incr(&self.counters.poll_timeouts);
                warn_throttled!(
                    self.throttler,
                    "dequeue_timeout",
                    "No frame from {} within {:?}, no signal?",
                    self.device.name(),
                    self.wait
                );
                PollOutcome::Timeout
            }
            PollError::Interrupted => PollOutcome::Timeout,
            PollError::DeviceLost(reason) => {
                PipelineCounters::incr(&self.counters.poll_errors);
                let device = self.device.name().to_string();
                error!("Video device lost: {} - {}", device, reason);
                PollOutcome::Fatal(CaptureError::DeviceLost { device, reason })
            }
            PollError::Failed(reason) => {
                PipelineCounters::incr(&self.counters.poll_errors);
                self.consecutive_errors += 1;
                if self.max_consecutive_errors > 0
                    && self.consecutive_errors >= self.max_consecutive_errors
                {
                    error!(
                        "Giving up after {} consecutive dequeue errors: {}",
                        self.consecutive_errors, reason
                    );
                    return PollOutcome::Fatal(CaptureError::Poll(format!(
                        "{} consecutive dequeue errors, last: {}",
                        self.consecutive_errors, reason
                    )));
                }
                error_throttled!(
                    self.throttler,
                    "dequeue_failed",
                    "Dequeue error: {}",
                    reason
                );
                PollOutcome::Error
            }
        }
    }

    /// Run on a dedicated thread until `stop` is set or a fatal error occurs.
    /// `on_fatal` is called from the poll thread before it exits.
    pub fn spawn<F>(mut self, stop: Arc<AtomicBool>, on_fatal: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce(CaptureError) + Send + 'static,
    {
        let handle = std::thread::Builder::new()
            .name("capture-poll".to_string())
            .spawn(move || {
                info!("Capture poll loop started ({})", self.format);
                while !stop.load(Ordering::Acquire) {
                    if let PollOutcome::Fatal(e) = self.poll_once() {
                        on_fatal(e);
                        break;
                    }
                }
                debug!("Capture poll loop stopped after {} frames", self.sequence);
            })?;
        Ok(handle)
    }
}
