//! Processing units
//!
//! A processing unit is one consumer of captured frames running on its own
//! worker thread behind a private bounded request queue. The variants differ
//! only in what they do with a frame:
//!
//! - [`PreviewUnit`]: convert/scale into a display surface buffer
//! - [`SoftwareEncodeUnit`]: convert into a managed codec's input buffer;
//!   a second thread drains codec output
//! - [`DirectEncodeUnit`]: submit the slot by index to a hardware channel
//!
//! Queueing, wait/timeout handling and stop signalling are shared and live in
//! this module.

mod direct;
mod preview;
mod software;

pub use direct::DirectEncodeUnit;
pub use preview::{MemorySurface, PreviewSurface, PreviewUnit};
pub use software::SoftwareEncodeUnit;

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::buffer_pool::SlotTable;
use super::channel::ChannelAllocator;
use super::convert::{PixelConverter, SoftwareConverter};
use super::encoder::{
    DirectEncoderFactory, EncodedSink, JpegCodecFactory, JpegDirectEncoderFactory,
    ManagedCodecFactory,
};
use super::format::Format;
use super::frame::FrameLease;
use super::stats::UnitCounters;
use crate::config::{EncoderConsumerConfig, PipelineConfig};
use crate::error::{CaptureError, Result};

/// Consumer / unit identifier
pub type UnitId = u32;

/// Unit variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Preview,
    SoftwareEncode,
    DirectEncode,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitKind::Preview => "preview",
            UnitKind::SoftwareEncode => "software-encode",
            UnitKind::DirectEncode => "direct-encode",
        };
        write!(f, "{}", name)
    }
}

/// Lifecycle of a registered consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// Registered, waiting for the session to stream
    Pending,
    Running,
    /// Setup failed; retried on the next start
    Failed,
}

/// What a consumer is, as registered with the session
#[derive(Clone)]
pub enum ConsumerDescriptor {
    Preview { surface: Arc<dyn PreviewSurface> },
    Encoder {
        config: EncoderConsumerConfig,
        sink: Arc<dyn EncodedSink>,
    },
}

impl ConsumerDescriptor {
    /// Variant this consumer runs as against a capture format
    pub fn kind_for(&self, capture: &Format) -> UnitKind {
        match self {
            ConsumerDescriptor::Preview { .. } => UnitKind::Preview,
            ConsumerDescriptor::Encoder { config, .. } => {
                if config.resolution() == capture.resolution {
                    UnitKind::DirectEncode
                } else {
                    UnitKind::SoftwareEncode
                }
            }
        }
    }

    /// Output frame rate, `None` for "every frame"
    pub fn output_fps(&self) -> Option<u32> {
        match self {
            ConsumerDescriptor::Preview { .. } => None,
            ConsumerDescriptor::Encoder { config, .. } => Some(config.fps),
        }
    }
}

impl fmt::Debug for ConsumerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerDescriptor::Preview { surface } => f
                .debug_struct("Preview")
                .field("format", &surface.format())
                .finish(),
            ConsumerDescriptor::Encoder { config, .. } => {
                f.debug_struct("Encoder").field("config", config).finish()
            }
        }
    }
}

/// Collaborators units are built from
#[derive(Clone)]
pub struct UnitBackends {
    pub converter: Arc<dyn PixelConverter>,
    pub managed_codecs: Arc<dyn ManagedCodecFactory>,
    pub direct_encoders: Arc<dyn DirectEncoderFactory>,
    pub channels: Arc<ChannelAllocator>,
}

impl Default for UnitBackends {
    fn default() -> Self {
        Self {
            converter: Arc::new(SoftwareConverter::new()),
            managed_codecs: Arc::new(JpegCodecFactory::default()),
            direct_encoders: Arc::new(JpegDirectEncoderFactory),
            channels: ChannelAllocator::global(),
        }
    }
}

/// Everything needed to set up a unit against a running capture
pub struct UnitContext<'a> {
    pub id: UnitId,
    pub capture_format: Format,
    pub capture_fps: u32,
    pub slots: &'a Arc<SlotTable>,
    pub pipeline: &'a PipelineConfig,
    pub backends: &'a UnitBackends,
    pub stats: &'a Arc<UnitCounters>,
}

/// Request queue wait policy shared by every unit
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    /// Single queue wait
    pub poll_interval: Duration,
    /// Consecutive empty waits reported as an idle timeout
    pub idle_polls: u32,
    pub queue_capacity: usize,
}

impl WaitPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            poll_interval: config.request_poll_interval(),
            idle_polls: config.request_idle_polls,
            queue_capacity: config.queue_capacity,
        }
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

/// Every-Nth-frame rate matcher, phase 0
#[derive(Debug, Clone)]
pub struct Decimator {
    factor: u32,
    seen: u64,
}

impl Decimator {
    pub fn new(capture_fps: u32, output_fps: Option<u32>) -> Self {
        let factor = match output_fps {
            Some(fps) if fps > 0 => (capture_fps / fps).max(1),
            _ => 1,
        };
        Self { factor, seen: 0 }
    }

    pub fn factor(&self) -> u32 {
        self.factor
    }

    /// Whether the next frame should be delivered
    pub fn admit(&mut self) -> bool {
        let admit = self.seen % self.factor as u64 == 0;
        self.seen += 1;
        admit
    }
}

/// Variant-specific frame handling
pub enum UnitProcessor {
    Preview(PreviewUnit),
    SoftwareEncode(SoftwareEncodeUnit),
    DirectEncode(DirectEncodeUnit),
}

impl UnitProcessor {
    /// Set up the variant `descriptor` calls for. Failures are consumer setup errors.
    pub fn build(descriptor: &ConsumerDescriptor, ctx: &UnitContext<'_>) -> Result<Self> {
        let kind = descriptor.kind_for(&ctx.capture_format);
        let built = match descriptor {
            ConsumerDescriptor::Preview { surface } => {
                PreviewUnit::new(surface.clone(), ctx.backends.converter.clone())
                    .map(UnitProcessor::Preview)
            }
            ConsumerDescriptor::Encoder { config, sink } => match kind {
                UnitKind::DirectEncode => {
                    DirectEncodeUnit::new(ctx, config, sink.clone()).map(UnitProcessor::DirectEncode)
                }
                _ => SoftwareEncodeUnit::new(ctx, config, sink.clone())
                    .map(UnitProcessor::SoftwareEncode),
            },
        };
        built.map_err(|e| match e {
            CaptureError::ConsumerSetup { .. } => e,
            other => CaptureError::ConsumerSetup {
                unit: format!("{}-{}", kind, ctx.id),
                reason: other.to_string(),
            },
        })
    }

    pub fn kind(&self) -> UnitKind {
        match self {
            UnitProcessor::Preview(_) => UnitKind::Preview,
            UnitProcessor::SoftwareEncode(_) => UnitKind::SoftwareEncode,
            UnitProcessor::DirectEncode(_) => UnitKind::DirectEncode,
        }
    }

    /// `Ok(false)` when the frame was accepted but not processed
    fn process(&mut self, lease: FrameLease, slots: &SlotTable, stats: &UnitCounters) -> Result<bool> {
        match self {
            UnitProcessor::Preview(unit) => unit.process(lease, slots),
            UnitProcessor::SoftwareEncode(unit) => unit.process(lease, slots),
            UnitProcessor::DirectEncode(unit) => unit.process(lease, stats),
        }
    }

    fn shutdown(&mut self) {
        match self {
            UnitProcessor::Preview(_) => {}
            UnitProcessor::SoftwareEncode(unit) => unit.shutdown(),
            UnitProcessor::DirectEncode(unit) => unit.shutdown(),
        }
    }
}

/// A running consumer: request queue + worker thread
pub struct ProcessingUnit {
    id: UnitId,
    kind: UnitKind,
    name: String,
    sender: SyncSender<FrameLease>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    stats: Arc<UnitCounters>,
}

impl ProcessingUnit {
    /// Spawn the worker for an already set-up processor
    pub fn start(
        id: UnitId,
        processor: UnitProcessor,
        slots: Arc<SlotTable>,
        policy: WaitPolicy,
        stats: Arc<UnitCounters>,
    ) -> Result<Self> {
        let kind = processor.kind();
        let name = format!("{}-{}", kind, id);
        let (sender, receiver) = mpsc::sync_channel(policy.queue_capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let name = name.clone();
            let stop = stop.clone();
            let stats = stats.clone();
            std::thread::Builder::new()
                .name(format!("unit-{}", id))
                .spawn(move || run_loop(name, receiver, stop, processor, slots, policy, stats))?
        };

        Ok(Self {
            id,
            kind,
            name,
            sender,
            stop,
            worker: Some(worker),
            stats,
        })
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &Arc<UnitCounters> {
        &self.stats
    }

    /// Push a frame without blocking; a full or closed queue hands the lease back
    pub fn enqueue(&self, lease: FrameLease) -> std::result::Result<(), FrameLease> {
        match self.sender.try_send(lease) {
            Ok(()) => {
                self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(lease)) | Err(TrySendError::Disconnected(lease)) => Err(lease),
        }
    }

    /// Ask the worker to exit; observed within one queue wait
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Wait for the worker to exit
    pub fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("{} worker panicked", self.name);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }
}

impl Drop for ProcessingUnit {
    fn drop(&mut self) {
        self.request_stop();
        self.join();
    }
}

/// Worker body shared by every variant
fn run_loop(
    name: String,
    receiver: Receiver<FrameLease>,
    stop: Arc<AtomicBool>,
    mut processor: UnitProcessor,
    slots: Arc<SlotTable>,
    policy: WaitPolicy,
    stats: Arc<UnitCounters>,
) {
    info!("{} worker started", name);
    let mut idle_polls = 0u32;

    while !stop.load(Ordering::Acquire) {
        match receiver.recv_timeout(policy.poll_interval) {
            Ok(lease) => {
                idle_polls = 0;
                let sequence = lease.frame().sequence;
                match processor.process(lease, &slots, &stats) {
                    Ok(true) => {
                        stats.frames_processed.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(false) => {
                        stats.frames_skipped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        stats.frames_failed.fetch_add(1, Ordering::Relaxed);
                        warn!("{}: frame {} failed: {}", name, sequence, e);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                idle_polls += 1;
                if idle_polls >= policy.idle_polls {
                    debug!(
                        "{}: no frame for {:?}",
                        name,
                        policy.poll_interval * policy.idle_polls
                    );
                    idle_polls = 0;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Unprocessed requests count as done so their slots go back to the device.
    let drained = receiver.try_iter().count();
    if drained > 0 {
        debug!("{}: dropped {} queued frames on stop", name, drained);
    }

    processor.shutdown();
    info!("{} worker stopped", name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimator_every_nth() {
        let mut decimator = Decimator::new(30, Some(10));
        assert_eq!(decimator.factor(), 3);
        let admitted: Vec<bool> = (0..7).map(|_| decimator.admit()).collect();
        assert_eq!(
            admitted,
            vec![true, false, false, true, false, false, true]
        );
    }

    #[test]
    fn test_decimator_never_below_one() {
        let mut decimator = Decimator::new(15, Some(60));
        assert_eq!(decimator.factor(), 1);
        assert!(decimator.admit());
        assert!(decimator.admit());

        assert_eq!(Decimator::new(30, None).factor(), 1);
        assert_eq!(Decimator::new(30, Some(0)).factor(), 1);
    }

    #[test]
    fn test_kind_for_selects_path() {
        use crate::video::encoder::{CallbackSink, EncodedPacket};
        use crate::video::format::{PixelFormat, Resolution};

        let capture = Format::packed(Resolution::HD1080, PixelFormat::Nv12);
        let sink: Arc<dyn EncodedSink> = Arc::new(CallbackSink(|_: EncodedPacket| {}));
        let same = ConsumerDescriptor::Encoder {
            config: EncoderConsumerConfig::default(),
            sink: sink.clone(),
        };
        let scaled = ConsumerDescriptor::Encoder {
            config: EncoderConsumerConfig {
                width: 1280,
                height: 720,
                ..Default::default()
            },
            sink,
        };
        assert_eq!(same.kind_for(&capture), UnitKind::DirectEncode);
        assert_eq!(scaled.kind_for(&capture), UnitKind::SoftwareEncode);
        assert_eq!(scaled.output_fps(), Some(30));
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_preview_unit_completes_frames() {
        use crate::video::buffer_pool::BufferPool;
        use crate::video::device::CaptureDevice;
        use crate::video::format::{PixelFormat, Resolution};
        use crate::video::stats::PipelineCounters;
        use crate::video::tracker::CompletionTracker;
        use crate::video::virtual_device::VirtualDevice;

        let res = Resolution::new(64, 48);
        let device = Arc::new(VirtualDevice::with_sizes(&[res]));
        let format = device
            .set_format(&Format::packed(res, PixelFormat::Nv12))
            .unwrap();
        let pool = BufferPool::allocate(device.clone(), format, 2).unwrap();
        let slots = pool.table().unwrap();
        let tracker = CompletionTracker::new(
            device.clone(),
            2,
            Arc::new(PipelineCounters::default()),
            Duration::from_secs(2),
        );
        tracker.prime().unwrap();
        device.stream_on().unwrap();

        let surface = Arc::new(MemorySurface::new(Format::packed(
            Resolution::new(32, 24),
            PixelFormat::Yuyv,
        )));
        let processor = UnitProcessor::Preview(
            PreviewUnit::new(surface.clone(), Arc::new(SoftwareConverter::new())).unwrap(),
        );
        let stats = Arc::new(UnitCounters::default());
        let mut unit = ProcessingUnit::start(
            1,
            processor,
            slots.clone(),
            WaitPolicy::default(),
            stats.clone(),
        )
        .unwrap();
        assert_eq!(unit.kind(), UnitKind::Preview);

        let buffer = device.dequeue(Duration::from_millis(50)).unwrap();
        let frame = tracker.begin_frame(&buffer, 1, format, 1).unwrap();
        assert!(unit.enqueue(tracker.lease(&frame)).is_ok());

        assert!(wait_for(|| !tracker.is_in_flight(buffer.index)));
        assert_eq!(device.device_queue_depth(), 2);
        assert_eq!(surface.frames_posted(), 1);

        unit.request_stop();
        unit.join();
        assert!(!unit.is_running());
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_received, 1);
        assert_eq!(snapshot.frames_processed, 1);

        device.stream_off().unwrap();
        drop(slots);
    }
}
