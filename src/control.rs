//! Control surface
//!
//! Id-keyed registry of capture sessions exposing signed-status calls for an
//! embedding caller: `0` is success, negative values are errno-style codes,
//! and `-1` means the device id is not initialized.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{status_of, CaptureError, Result};
use crate::video::channel::ChannelAllocator;
use crate::video::device::CaptureDevice;
use crate::video::session::{CaptureSession, StartRequest};
use crate::video::unit::{ConsumerDescriptor, PreviewSurface, UnitBackends};
use crate::video::v4l2::V4l2Device;

/// Opens the capture device behind a device id
pub type DeviceOpener = Box<dyn Fn(i32) -> Result<Arc<dyn CaptureDevice>> + Send + Sync>;

/// Status returned for an unknown device id
pub const NOT_INITIALIZED: i32 = -1;

pub struct ControlSurface {
    sessions: Mutex<HashMap<i32, Arc<CaptureSession>>>,
    opener: DeviceOpener,
    config: PipelineConfig,
    backends: UnitBackends,
}

impl ControlSurface {
    /// V4L2 devices at `/dev/video<id>`
    pub fn new(config: PipelineConfig) -> Self {
        Self::with_opener(
            config,
            Box::new(|id: i32| -> Result<Arc<dyn CaptureDevice>> {
                let device = V4l2Device::open(format!("/dev/video{}", id))?;
                Ok(Arc::new(device) as Arc<dyn CaptureDevice>)
            }),
        )
    }

    pub fn with_opener(config: PipelineConfig, opener: DeviceOpener) -> Self {
        // One channel pool shared by every session of this surface
        let backends = UnitBackends {
            channels: Arc::new(ChannelAllocator::new(config.channel_pool_size)),
            ..Default::default()
        };
        Self::with_backends(config, opener, backends)
    }

    pub fn with_backends(config: PipelineConfig, opener: DeviceOpener, backends: UnitBackends) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            opener,
            config,
            backends,
        }
    }

    /// Session of an initialized device id
    pub fn session(&self, device_id: i32) -> Option<Arc<CaptureSession>> {
        self.sessions.lock().get(&device_id).cloned()
    }

    fn with_session<T>(&self, device_id: i32, f: impl FnOnce(&CaptureSession) -> Result<T>) -> Result<T> {
        let session = self
            .session(device_id)
            .ok_or(CaptureError::NotInitialized(device_id))?;
        f(&session)
    }

    /// Open the device and create its session. Initializing twice keeps the first session.
    pub fn init(&self, device_id: i32) -> i32 {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&device_id) {
            warn!("Capture {} already initialized", device_id);
            return 0;
        }
        match (self.opener)(device_id) {
            Ok(device) => {
                let session =
                    CaptureSession::with_backends(device, self.config.clone(), self.backends.clone());
                info!("Capture {} initialized on {}", device_id, session.device_name());
                sessions.insert(device_id, Arc::new(session));
                0
            }
            Err(e) => {
                error!("Failed to open capture {}: {}", device_id, e);
                e.status()
            }
        }
    }

    /// Stop and drop the session
    pub fn release(&self, device_id: i32) -> i32 {
        let Some(session) = self.sessions.lock().remove(&device_id) else {
            return NOT_INITIALIZED;
        };
        info!("Releasing capture {}", device_id);
        status_of(&session.stop())
    }

    /// (Re)start capture; a running capture is stopped first
    pub fn start_capture(
        &self,
        device_id: i32,
        surface: Option<Arc<dyn PreviewSurface>>,
        width: i32,
        height: i32,
        fps: i32,
    ) -> i32 {
        let result = self.with_session(device_id, |session| {
            let (Ok(width), Ok(height), Ok(fps)) =
                (u32::try_from(width), u32::try_from(height), u32::try_from(fps))
            else {
                return Err(CaptureError::Config(format!(
                    "invalid capture mode {}x{}@{}",
                    width, height, fps
                )));
            };
            session.stop()?;
            let mut request = StartRequest::new(width, height, fps);
            request.surface = surface;
            session.start(request)
        });
        self.report("start_capture", device_id, result)
    }

    pub fn stop_capture(&self, device_id: i32) -> i32 {
        let result = self.with_session(device_id, |session| session.stop());
        self.report("stop_capture", device_id, result)
    }

    /// Attach a consumer; returns its id (> 0) or a negative status
    pub fn add_consumer(&self, device_id: i32, descriptor: ConsumerDescriptor) -> i32 {
        let result = self.with_session(device_id, |session| {
            let id = session.add_unit(descriptor)?;
            i32::try_from(id).map_err(|_| CaptureError::InvalidState("consumer ids exhausted".into()))
        });
        match result {
            Ok(id) => id,
            Err(e) => self.report::<()>("add_consumer", device_id, Err(e)),
        }
    }

    pub fn remove_consumer(&self, device_id: i32, consumer_id: i32) -> i32 {
        let result = self.with_session(device_id, |session| {
            let id = u32::try_from(consumer_id)
                .map_err(|_| CaptureError::UnitNotFound(consumer_id as u32))?;
            session.remove_unit(id)
        });
        self.report("remove_consumer", device_id, result)
    }

    fn report<T>(&self, call: &str, device_id: i32, result: Result<T>) -> i32 {
        if let Err(e) = &result {
            match e {
                CaptureError::NotInitialized(_) => info!("{}: capture {} not initialized", call, device_id),
                _ => error!("{} on capture {} failed: {}", call, device_id, e),
            }
        }
        status_of(&result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderConsumerConfig;
    use crate::video::encoder::{CallbackSink, EncodedPacket, EncodedSink};
    use crate::video::format::{Format, PixelFormat, Resolution};
    use crate::video::session::SessionState;
    use crate::video::unit::MemorySurface;
    use crate::video::virtual_device::VirtualDevice;

    fn surface() -> ControlSurface {
        let config = PipelineConfig {
            device_wait_timeout_ms: 50,
            ..Default::default()
        };
        ControlSurface::with_opener(
            config,
            Box::new(|id: i32| -> Result<Arc<dyn CaptureDevice>> {
                if id < 0 {
                    return Err(CaptureError::Io(std::io::Error::from_raw_os_error(
                        libc::ENOENT,
                    )));
                }
                Ok(Arc::new(VirtualDevice::with_sizes(&[Resolution::new(64, 48)]))
                    as Arc<dyn CaptureDevice>)
            }),
        )
    }

    fn encoder() -> ConsumerDescriptor {
        let sink: Arc<dyn EncodedSink> = Arc::new(CallbackSink(|_: EncodedPacket| {}));
        ConsumerDescriptor::Encoder {
            config: EncoderConsumerConfig {
                width: 64,
                height: 48,
                ..Default::default()
            },
            sink,
        }
    }

    #[test]
    fn test_uninitialized_id_returns_minus_one() {
        let control = surface();
        assert_eq!(control.start_capture(3, None, 64, 48, 30), NOT_INITIALIZED);
        assert_eq!(control.stop_capture(3), NOT_INITIALIZED);
        assert_eq!(control.add_consumer(3, encoder()), NOT_INITIALIZED);
        assert_eq!(control.remove_consumer(3, 1), NOT_INITIALIZED);
        assert_eq!(control.release(3), NOT_INITIALIZED);
    }

    #[test]
    fn test_init_failure_reports_errno() {
        let control = surface();
        assert_eq!(control.init(-5), -libc::ENOENT);
        assert!(control.session(-5).is_none());
    }

    #[test]
    fn test_capture_lifecycle() {
        let control = surface();
        assert_eq!(control.init(0), 0);
        assert_eq!(control.init(0), 0);

        let id = control.add_consumer(0, encoder());
        assert!(id > 0);

        let preview = Arc::new(MemorySurface::new(Format::packed(
            Resolution::new(64, 48),
            PixelFormat::Yuyv,
        )));
        assert_eq!(control.start_capture(0, Some(preview.clone()), 64, 48, 30), 0);
        let session = control.session(0).unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.active_unit_count(), 2);

        // Starting again restarts with the new request.
        assert_eq!(control.start_capture(0, None, 64, 48, 30), 0);
        assert_eq!(session.active_unit_count(), 1);

        assert_eq!(control.remove_consumer(0, id), 0);
        assert_eq!(control.remove_consumer(0, id), -libc::ENOENT);
        assert_eq!(control.stop_capture(0), 0);
        assert_eq!(control.stop_capture(0), 0);
        assert_eq!(control.release(0), 0);
        assert_eq!(control.release(0), NOT_INITIALIZED);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let control = surface();
        assert_eq!(control.init(1), 0);
        assert_eq!(control.start_capture(1, None, -1, 48, 30), -libc::EINVAL);
        assert_eq!(control.start_capture(1, None, 64, 48, 0), -libc::EINVAL);
    }
}
