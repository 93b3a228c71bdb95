//! Capture session
//!
//! Owns the device, the buffer pool and the running units. Lifecycle:
//!
//! ```text
//! Idle -> Configuring -> Streaming -> Stopping -> Idle
//!                          |
//!                          v
//!                       Faulted (poll loop gave up; stop/start recover)
//! ```
//!
//! Consumers are registered independently of the lifecycle. A consumer
//! registered while idle is built on the next start; one registered while
//! streaming joins the fan-out from the next dequeued frame.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::buffer_pool::{BufferPool, SlotTable};
use super::device::CaptureDevice;
use super::format::{Format, Resolution};
use super::poll_loop::{ActiveSet, ActiveUnit, PollLoop};
use super::stats::{PipelineCounters, PipelineStats, UnitCounters, UnitStats};
use super::tracker::CompletionTracker;
use super::unit::{
    ConsumerDescriptor, Decimator, PreviewSurface, ProcessingUnit, UnitBackends, UnitContext,
    UnitId, UnitKind, UnitProcessor, UnitState, WaitPolicy,
};
use crate::config::PipelineConfig;
use crate::error::{CaptureError, Result};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Configuring,
    Streaming,
    Stopping,
    /// The poll loop stopped on an unrecoverable device error
    Faulted,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Configuring => write!(f, "Configuring"),
            SessionState::Streaming => write!(f, "Streaming"),
            SessionState::Stopping => write!(f, "Stopping"),
            SessionState::Faulted => write!(f, "Faulted"),
        }
    }
}

/// Requested capture mode
#[derive(Clone)]
pub struct StartRequest {
    /// Preview target; registered as a consumer for the duration of the capture
    pub surface: Option<Arc<dyn PreviewSurface>>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl StartRequest {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            surface: None,
            width,
            height,
            fps,
        }
    }

    pub fn with_surface(mut self, surface: Arc<dyn PreviewSurface>) -> Self {
        self.surface = Some(surface);
        self
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

/// Registered consumer as reported by [`CaptureSession::units`]
#[derive(Debug, Clone, Serialize)]
pub struct UnitInfo {
    pub id: UnitId,
    /// Variant of the current or last build
    pub kind: Option<UnitKind>,
    pub state: UnitState,
    /// Why the last setup failed
    pub error: Option<String>,
    pub stats: UnitStats,
}

struct Registration {
    descriptor: ConsumerDescriptor,
    state: UnitState,
    kind: Option<UnitKind>,
    error: Option<String>,
    stats: Arc<UnitCounters>,
}

/// Resources of one streaming run
struct Running {
    format: Format,
    fps: u32,
    pool: BufferPool,
    slots: Arc<SlotTable>,
    tracker: Arc<CompletionTracker>,
    poll_stop: Arc<AtomicBool>,
    poll_thread: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Lifecycle {
    running: Option<Running>,
    /// Consumer registered for the current start request's surface
    preview: Option<UnitId>,
}

pub struct CaptureSession {
    device: Arc<dyn CaptureDevice>,
    config: PipelineConfig,
    backends: UnitBackends,
    lifecycle: Mutex<Lifecycle>,
    registry: Mutex<BTreeMap<UnitId, Registration>>,
    active: ActiveSet,
    next_id: AtomicU32,
    counters: Arc<PipelineCounters>,
    state: Arc<watch::Sender<SessionState>>,
    fault: Arc<Mutex<Option<String>>>,
}

impl CaptureSession {
    pub fn new(device: Arc<dyn CaptureDevice>, config: PipelineConfig) -> Self {
        Self::with_backends(device, config, UnitBackends::default())
    }

    pub fn with_backends(
        device: Arc<dyn CaptureDevice>,
        config: PipelineConfig,
        backends: UnitBackends,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            device,
            config,
            backends,
            lifecycle: Mutex::new(Lifecycle::default()),
            registry: Mutex::new(BTreeMap::new()),
            active: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU32::new(1),
            counters: Arc::new(PipelineCounters::default()),
            state: Arc::new(state),
            fault: Arc::new(Mutex::new(None)),
        }
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Subscribe to lifecycle changes
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Reason of the last fault, if the session is faulted
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    /// Negotiated capture format while streaming
    pub fn format(&self) -> Option<Format> {
        self.lifecycle.lock().running.as_ref().map(|r| r.format)
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Units currently receiving frames
    pub fn active_unit_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn unit_stats(&self, id: UnitId) -> Option<UnitStats> {
        self.registry.lock().get(&id).map(|r| r.stats.snapshot())
    }

    pub fn units(&self) -> Vec<UnitInfo> {
        self.registry
            .lock()
            .iter()
            .map(|(&id, r)| UnitInfo {
                id,
                kind: r.kind,
                state: r.state,
                error: r.error.clone(),
                stats: r.stats.snapshot(),
            })
            .collect()
    }

    /// Configure the device and start streaming. No-op while already streaming.
    pub fn start(&self, request: StartRequest) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match self.state() {
            SessionState::Streaming => {
                debug!("Capture already streaming on {}", self.device.name());
                return Ok(());
            }
            SessionState::Faulted => {
                info!("Restarting faulted capture on {}", self.device.name());
                self.teardown(&mut lifecycle);
            }
            _ => {}
        }
        if request.fps == 0 {
            return Err(CaptureError::Config("capture fps must be > 0".to_string()));
        }

        self.state.send_replace(SessionState::Configuring);
        *self.fault.lock() = None;

        if let Some(surface) = request.surface.clone() {
            let id = self.register(ConsumerDescriptor::Preview { surface });
            lifecycle.preview = Some(id);
        }

        match self.configure(&request) {
            Ok(mut running) => {
                self.build_units(&running);
                if let Err(e) = self.begin_streaming(&mut running) {
                    lifecycle.running = Some(running);
                    self.teardown(&mut lifecycle);
                    return Err(e);
                }
                info!(
                    "Capture streaming on {}: {} @ {} fps, {} units",
                    self.device.name(),
                    running.format,
                    running.fps,
                    self.active_unit_count()
                );
                lifecycle.running = Some(running);
                self.state.send_replace(SessionState::Streaming);
                Ok(())
            }
            Err(e) => {
                error!("Failed to configure {}: {}", self.device.name(), e);
                self.teardown(&mut lifecycle);
                Err(e)
            }
        }
    }

    /// Stop streaming and release the device buffers. No-op while idle.
    pub fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.running.is_none() && self.state() == SessionState::Idle {
            return Ok(());
        }
        self.teardown(&mut lifecycle);
        Ok(())
    }

    /// Register a consumer. Returns its id even if its setup fails.
    pub fn add_unit(&self, descriptor: ConsumerDescriptor) -> Result<UnitId> {
        let lifecycle = self.lifecycle.lock();
        let id = self.register(descriptor);
        if let Some(running) = lifecycle.running.as_ref() {
            self.build_unit(id, running);
        }
        Ok(id)
    }

    /// Unregister a consumer. Once this returns the unit receives no more frames.
    pub fn remove_unit(&self, id: UnitId) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if self.registry.lock().remove(&id).is_none() {
            return Err(CaptureError::UnitNotFound(id));
        }
        if lifecycle.preview == Some(id) {
            lifecycle.preview = None;
        }

        let removed = {
            let mut active = self.active.lock();
            active
                .iter()
                .position(|entry| entry.id == id)
                .map(|i| active.remove(i))
        };
        // Dropping the unit stops and joins its worker; queued frames are released.
        if let Some(entry) = removed {
            debug!("Stopping {}", entry.unit.name());
            drop(entry);
        }
        info!("Consumer {} removed", id);
        Ok(())
    }

    fn register(&self, descriptor: ConsumerDescriptor) -> UnitId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("Consumer {} registered: {:?}", id, descriptor);
        self.registry.lock().insert(
            id,
            Registration {
                descriptor,
                state: UnitState::Pending,
                kind: None,
                error: None,
                stats: Arc::new(UnitCounters::default()),
            },
        );
        id
    }

    fn configure(&self, request: &StartRequest) -> Result<Running> {
        let caps = self.device.query_capabilities()?;
        if !caps.can_capture() {
            return Err(CaptureError::Device(format!(
                "{} ({}) is not a streaming capture device",
                self.device.name(),
                caps.card
            )));
        }

        let negotiated = self
            .device
            .negotiate_format(&self.config.preferred_formats, request.resolution())?;
        let format = self.device.set_format(&negotiated)?;
        if let Err(e) = self.device.set_frame_rate(request.fps) {
            warn!("Failed to set frame rate {} on {}: {}", request.fps, self.device.name(), e);
        }
        info!(
            "Negotiated {} on {} (requested {})",
            format,
            self.device.name(),
            request.resolution()
        );

        let pool = BufferPool::allocate(self.device.clone(), format, self.config.buffer_count)?;
        let slots = pool
            .table()
            .ok_or_else(|| CaptureError::InvalidState("buffer pool released".to_string()))?;
        let tracker = CompletionTracker::new(
            self.device.clone(),
            slots.len(),
            self.counters.clone(),
            self.config.fps_report_interval(),
        );

        Ok(Running {
            format,
            fps: request.fps,
            pool,
            slots,
            tracker,
            poll_stop: Arc::new(AtomicBool::new(false)),
            poll_thread: None,
        })
    }

    fn build_units(&self, running: &Running) {
        let ids: Vec<UnitId> = self.registry.lock().keys().copied().collect();
        for id in ids {
            self.build_unit(id, running);
        }
    }

    /// Set up one registered consumer against the running capture
    fn build_unit(&self, id: UnitId, running: &Running) {
        let Some((descriptor, stats)) = self
            .registry
            .lock()
            .get(&id)
            .map(|r| (r.descriptor.clone(), r.stats.clone()))
        else {
            return;
        };

        let ctx = UnitContext {
            id,
            capture_format: running.format,
            capture_fps: running.fps,
            slots: &running.slots,
            pipeline: &self.config,
            backends: &self.backends,
            stats: &stats,
        };
        let kind = descriptor.kind_for(&running.format);
        let started = UnitProcessor::build(&descriptor, &ctx).and_then(|processor| {
            ProcessingUnit::start(
                id,
                processor,
                running.slots.clone(),
                WaitPolicy::from_config(&self.config),
                stats,
            )
        });

        let (state, error) = match started {
            Ok(unit) => {
                let decimator = Decimator::new(running.fps, descriptor.output_fps());
                info!(
                    "Consumer {} running as {} (every {} frame(s))",
                    id,
                    kind,
                    decimator.factor()
                );
                self.active.lock().push(ActiveUnit {
                    id,
                    decimator,
                    unit,
                });
                (UnitState::Running, None)
            }
            Err(e) => {
                warn!("Consumer {} failed to start: {}", id, e);
                (UnitState::Failed, Some(e.to_string()))
            }
        };

        if let Some(registration) = self.registry.lock().get_mut(&id) {
            registration.state = state;
            registration.kind = Some(kind);
            registration.error = error;
        }
    }

    fn begin_streaming(&self, running: &mut Running) -> Result<()> {
        running.tracker.prime()?;
        self.device.stream_on()?;

        let poll = PollLoop::new(
            self.device.clone(),
            running.tracker.clone(),
            self.active.clone(),
            running.format,
            self.config.device_wait_timeout(),
            self.config.max_consecutive_poll_errors,
        );
        let state = self.state.clone();
        let fault = self.fault.clone();
        let handle = poll.spawn(running.poll_stop.clone(), move |e| {
            error!("Capture faulted: {}", e);
            *fault.lock() = Some(e.to_string());
            state.send_replace(SessionState::Faulted);
        })?;
        running.poll_thread = Some(handle);
        Ok(())
    }

    /// Stop everything that is running, in dependency order
    fn teardown(&self, lifecycle: &mut Lifecycle) {
        let faulted = self.state() == SessionState::Faulted;
        self.state.send_replace(SessionState::Stopping);

        if let Some(running) = lifecycle.running.as_mut() {
            running.poll_stop.store(true, Ordering::Release);
            if let Some(handle) = running.poll_thread.take() {
                if handle.join().is_err() {
                    error!("Capture poll thread panicked");
                }
            }
        }

        let mut units: Vec<ActiveUnit> = std::mem::take(&mut *self.active.lock());
        for entry in &units {
            entry.unit.request_stop();
        }
        for entry in &mut units {
            entry.unit.join();
        }
        drop(units);

        if let Some(mut running) = lifecycle.running.take() {
            running.tracker.close();
            if let Err(e) = self.device.stream_off() {
                warn!("Failed to stop streaming on {}: {}", self.device.name(), e);
            }
            drop(running.slots);
            if let Err(e) = running.pool.release() {
                warn!("Failed to release buffers on {}: {}", self.device.name(), e);
            }
            info!(
                "Capture stopped on {} after {} frames",
                self.device.name(),
                self.counters.snapshot().frames_dequeued
            );
        }

        {
            let mut registry = self.registry.lock();
            if let Some(id) = lifecycle.preview.take() {
                registry.remove(&id);
            }
            for registration in registry.values_mut() {
                if registration.state == UnitState::Running {
                    registration.state = UnitState::Pending;
                }
            }
        }

        if !faulted {
            *self.fault.lock() = None;
        }
        self.state.send_replace(SessionState::Idle);
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.running.is_some() {
            self.teardown(&mut lifecycle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::channel::ChannelAllocator;
    use crate::video::device::PollError;
    use crate::video::encoder::{CallbackSink, EncodedPacket, EncodedSink};
    use crate::video::format::PixelFormat;
    use crate::video::unit::MemorySurface;
    use crate::video::virtual_device::{VirtualDevice, VirtualDeviceConfig};
    use crate::config::EncoderConsumerConfig;
    use std::sync::atomic::AtomicU64;
    use std::time::{Duration, Instant};

    const RES: Resolution = Resolution {
        width: 64,
        height: 48,
    };

    fn virtual_device(max_frames: Option<u64>) -> Arc<VirtualDevice> {
        Arc::new(VirtualDevice::new(VirtualDeviceConfig {
            formats: vec![PixelFormat::Nv12, PixelFormat::Yuyv],
            sizes: vec![RES],
            max_frames,
            ..Default::default()
        }))
    }

    fn session(device: Arc<VirtualDevice>, channels: usize) -> CaptureSession {
        let config = PipelineConfig {
            device_wait_timeout_ms: 50,
            ..Default::default()
        };
        let backends = UnitBackends {
            channels: Arc::new(ChannelAllocator::new(channels)),
            ..Default::default()
        };
        CaptureSession::with_backends(device, config, backends)
    }

    fn request() -> StartRequest {
        StartRequest::new(RES.width, RES.height, 30)
    }

    fn encoder(width: u32, height: u32, fps: u32) -> (ConsumerDescriptor, Arc<AtomicU64>) {
        let packets = Arc::new(AtomicU64::new(0));
        let counter = packets.clone();
        let sink: Arc<dyn EncodedSink> = Arc::new(CallbackSink(move |packet: EncodedPacket| {
            assert!(!packet.is_empty());
            counter.fetch_add(1, Ordering::Relaxed);
        }));
        let config = EncoderConsumerConfig {
            width,
            height,
            fps,
            ..Default::default()
        };
        (ConsumerDescriptor::Encoder { config, sink }, packets)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_hundred_frames_two_units() {
        let device = virtual_device(Some(100));
        let session = session(device.clone(), 6);
        let surface = Arc::new(MemorySurface::new(Format::packed(RES, PixelFormat::Yuyv)));
        let (direct, packets) = encoder(RES.width, RES.height, 30);
        let direct_id = session.add_unit(direct).unwrap();

        session
            .start(request().with_surface(surface.clone()))
            .unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.active_unit_count(), 2);

        assert!(wait_for(|| session.stats().frames_returned == 100));
        assert!(wait_for(|| device.device_queue_depth() == 4));
        assert_eq!(device.frames_produced(), 100);
        assert_eq!(device.double_queue_count(), 0);

        let kinds: Vec<Option<UnitKind>> = session.units().iter().map(|u| u.kind).collect();
        assert!(kinds.contains(&Some(UnitKind::Preview)));
        assert!(kinds.contains(&Some(UnitKind::DirectEncode)));

        session.stop().unwrap();
        assert_eq!(surface.frames_posted(), 100);
        assert_eq!(packets.load(Ordering::Relaxed), 100);

        let stats = session.stats();
        assert_eq!(stats.frames_dequeued, 100);
        assert_eq!(stats.frames_returned, 100);
        assert_eq!(stats.frames_dropped_backpressure, 0);
        assert_eq!(stats.protocol_violations, 0);
        let unit = session.unit_stats(direct_id).unwrap();
        assert_eq!(unit.frames_received, 100);
        assert_eq!(unit.frames_processed, 100);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!device.is_streaming());
        assert_eq!(device.buffer_count(), 0);
        // The preview consumer belongs to the capture request.
        assert_eq!(session.units().len(), 1);
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let device = virtual_device(None);
        let session = session(device.clone(), 6);
        let (scaled, _) = encoder(32, 24, 15);
        session.add_unit(scaled).unwrap();

        session.start(request()).unwrap();
        session.start(request()).unwrap();
        assert_eq!(session.active_unit_count(), 1);
        assert_eq!(device.release_count(), 0);

        session.stop().unwrap();
        session.stop().unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(device.release_count(), 1);
        assert_eq!(session.units()[0].state, UnitState::Pending);

        session.start(request()).unwrap();
        assert_eq!(session.units()[0].state, UnitState::Running);
        session.stop().unwrap();
    }

    #[test]
    fn test_software_path_for_scaled_encoder() {
        let device = virtual_device(None);
        let session = session(device.clone(), 6);
        let (scaled, packets) = encoder(32, 24, 15);
        let id = session.add_unit(scaled).unwrap();

        session.start(request()).unwrap();
        assert_eq!(session.units()[0].kind, Some(UnitKind::SoftwareEncode));
        assert!(wait_for(|| packets.load(Ordering::Relaxed) >= 5));
        session.stop().unwrap();

        // 30 fps capture, 15 fps encoder: every other frame is skipped.
        let stats = session.unit_stats(id).unwrap();
        assert!(stats.frames_skipped > 0);
        assert!(stats.packets_emitted >= 5);
    }

    #[test]
    fn test_attach_and_detach_while_streaming() {
        let device = virtual_device(None);
        let session = session(device.clone(), 6);
        session.start(request()).unwrap();
        assert_eq!(session.active_unit_count(), 0);

        let (direct, packets) = encoder(RES.width, RES.height, 30);
        let id = session.add_unit(direct).unwrap();
        assert_eq!(session.active_unit_count(), 1);
        assert!(wait_for(|| packets.load(Ordering::Relaxed) >= 3));

        session.remove_unit(id).unwrap();
        assert_eq!(session.active_unit_count(), 0);
        let after = packets.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(packets.load(Ordering::Relaxed), after);
        assert!(matches!(
            session.remove_unit(id),
            Err(CaptureError::UnitNotFound(_))
        ));

        session.stop().unwrap();
        assert_eq!(session.stats().protocol_violations, 0);
    }

    #[test]
    fn test_setup_failure_keeps_other_units() {
        let device = virtual_device(None);
        let session = session(device.clone(), 0);
        let (direct, _) = encoder(RES.width, RES.height, 30);
        let (scaled, packets) = encoder(32, 24, 30);
        let failed = session.add_unit(direct).unwrap();
        session.add_unit(scaled).unwrap();

        session.start(request()).unwrap();
        let units = session.units();
        let failed_unit = units.iter().find(|u| u.id == failed).unwrap();
        assert_eq!(failed_unit.state, UnitState::Failed);
        assert!(failed_unit.error.is_some());
        assert_eq!(session.active_unit_count(), 1);
        assert!(wait_for(|| packets.load(Ordering::Relaxed) >= 3));
        session.stop().unwrap();
    }

    #[test]
    fn test_odd_sized_consumers_fail_setup() {
        let device = virtual_device(None);
        let session = session(device.clone(), 6);
        let (wide, _) = encoder(33, 24, 30);
        let (tall, _) = encoder(32, 25, 30);
        let (good, packets) = encoder(32, 24, 30);
        let wide = session.add_unit(wide).unwrap();
        let tall = session.add_unit(tall).unwrap();
        session.add_unit(good).unwrap();
        let surface = Arc::new(MemorySurface::new(Format::packed(
            Resolution::new(31, 24),
            PixelFormat::Yuyv,
        )));

        session.start(request().with_surface(surface.clone())).unwrap();
        assert_eq!(session.active_unit_count(), 1);
        let units = session.units();
        for id in [wide, tall] {
            let unit = units.iter().find(|u| u.id == id).unwrap();
            assert_eq!(unit.state, UnitState::Failed);
            assert!(unit.error.as_deref().unwrap().contains("even"));
        }
        assert_eq!(
            units.iter().filter(|u| u.state == UnitState::Failed).count(),
            3
        );

        assert!(wait_for(|| packets.load(Ordering::Relaxed) >= 5));
        session.stop().unwrap();
        assert_eq!(surface.frames_posted(), 0);
        assert_eq!(session.stats().frames_dropped_backpressure, 0);
    }

    #[test]
    fn test_refused_requeues_fault_session() {
        let device = virtual_device(None);
        let config = PipelineConfig {
            device_wait_timeout_ms: 20,
            max_consecutive_poll_errors: 5,
            ..Default::default()
        };
        let session = CaptureSession::with_backends(device.clone(), config, UnitBackends::default());
        session.start(request()).unwrap();
        assert!(wait_for(|| session.stats().frames_returned >= 3));

        device.fail_next_queues(usize::MAX / 2);
        assert!(wait_for(|| session.state() == SessionState::Faulted));
        assert!(session.fault().unwrap().contains("requeue"));
        assert!(session.stats().requeue_failures > 0);

        device.clear_faults();
        session.start(request()).unwrap();
        let returned = session.stats().frames_returned;
        assert!(wait_for(|| session.stats().frames_returned >= returned + 3));
        session.stop().unwrap();
        assert_eq!(device.double_queue_count(), 0);
    }

    #[test]
    fn test_buffer_shortfall_leaves_session_idle() {
        let device = virtual_device(None);
        device.limit_buffers(2);
        let session = session(device.clone(), 6);
        let err = session.start(request()).unwrap_err();
        assert!(matches!(err, CaptureError::BufferShortfall { .. }));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!device.is_streaming());
        assert_eq!(device.buffer_count(), 0);
    }

    #[test]
    fn test_device_loss_faults_and_recovers() {
        let device = virtual_device(None);
        let session = session(device.clone(), 6);
        let mut state = session.subscribe_state();
        session.start(request()).unwrap();

        device.inject_dequeue_errors(1, PollError::DeviceLost("ENODEV".into()));
        assert!(wait_for(|| session.state() == SessionState::Faulted));
        assert!(state.has_changed().unwrap());
        assert_eq!(*state.borrow_and_update(), SessionState::Faulted);
        assert!(session.fault().unwrap().contains("ENODEV"));

        device.clear_faults();
        session.start(request()).unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
        assert!(session.fault().is_none());
        session.stop().unwrap();
    }
}
