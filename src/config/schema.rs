use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CaptureError, Result};
use crate::video::format::{PixelFormat, Resolution};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Capture device and requested mode
    pub capture: CaptureConfig,
    /// Pipeline tuning (buffer pool, queues, timeouts)
    pub pipeline: PipelineConfig,
    /// Encoder consumers attached at startup
    pub encoders: Vec<EncoderConsumerConfig>,
}

impl AppConfig {
    /// Check every section, returning the first violation
    pub fn validate(&self) -> Result<()> {
        self.capture.validate()?;
        self.pipeline.validate()?;
        for encoder in &self.encoders {
            encoder.validate()?;
        }
        Ok(())
    }
}

/// Video capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    /// Video device path (e.g., /dev/video0)
    pub device: Option<String>,
    /// Requested width (the closest landscape size is negotiated)
    pub width: u32,
    /// Requested height
    pub height: u32,
    /// Frame rate
    pub fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            width: 1920,
            height: 1080,
            fps: 30,
        }
    }
}

impl CaptureConfig {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fps == 0 {
            return Err(CaptureError::Config("capture fps must be > 0".to_string()));
        }
        if !self.resolution().is_valid() {
            return Err(CaptureError::Config(format!(
                "capture resolution {} out of range",
                self.resolution()
            )));
        }
        Ok(())
    }
}

/// Pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of device buffers (slots) to request
    pub buffer_count: u32,
    /// Capacity of each processing unit's request queue
    pub queue_capacity: usize,
    /// Unit queue wait interval
    pub request_poll_interval_ms: u64,
    /// Consecutive empty waits before a unit reports an idle timeout
    pub request_idle_polls: u32,
    /// Bounded device readiness wait used by the poll loop
    pub device_wait_timeout_ms: u64,
    /// Consecutive dequeue failures before the session faults (0 = never)
    pub max_consecutive_poll_errors: u32,
    /// Size of the encode channel pool
    pub channel_pool_size: usize,
    /// Capture formats in order of preference
    pub preferred_formats: Vec<PixelFormat>,
    /// Managed codec output wait
    pub codec_drain_timeout_ms: u64,
    /// Output buffer size for direct encoders
    pub direct_output_buffer_size: usize,
    /// Interval of the frame-return FPS report
    pub fps_report_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_count: 4,
            queue_capacity: 4,
            request_poll_interval_ms: 33,
            request_idle_polls: 90,
            device_wait_timeout_ms: 1000,
            max_consecutive_poll_errors: 100,
            channel_pool_size: 6,
            preferred_formats: PixelFormat::preferred_capture().to_vec(),
            codec_drain_timeout_ms: 12,
            direct_output_buffer_size: 2 * 1024 * 1024,
            fps_report_interval_secs: 2,
        }
    }
}

impl PipelineConfig {
    pub fn request_poll_interval(&self) -> Duration {
        Duration::from_millis(self.request_poll_interval_ms)
    }

    pub fn device_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.device_wait_timeout_ms)
    }

    pub fn codec_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.codec_drain_timeout_ms)
    }

    pub fn fps_report_interval(&self) -> Duration {
        Duration::from_secs(self.fps_report_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_count == 0 {
            return Err(CaptureError::Config("buffer_count must be > 0".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(CaptureError::Config("queue_capacity must be > 0".to_string()));
        }
        if self.request_poll_interval_ms == 0 || self.request_idle_polls == 0 {
            return Err(CaptureError::Config(
                "request wait interval and idle polls must be > 0".to_string(),
            ));
        }
        if self.device_wait_timeout_ms == 0 {
            return Err(CaptureError::Config(
                "device_wait_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.preferred_formats.is_empty() {
            return Err(CaptureError::Config(
                "preferred_formats must not be empty".to_string(),
            ));
        }
        if self.direct_output_buffer_size == 0 {
            return Err(CaptureError::Config(
                "direct_output_buffer_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Encoder consumer configuration, passed when the consumer is attached
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncoderConsumerConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Target bitrate in kbps (codec hint)
    pub bitrate_kbps: u32,
    /// Key frame interval in frames
    pub gop: u32,
    /// JPEG quality (1-100)
    pub quality: u8,
}

impl Default for EncoderConsumerConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            bitrate_kbps: 4000,
            gop: 60,
            quality: 80,
        }
    }
}

impl EncoderConsumerConfig {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fps == 0 {
            return Err(CaptureError::Config("encoder fps must be > 0".to_string()));
        }
        if !self.resolution().is_valid() {
            return Err(CaptureError::Config(format!(
                "encoder resolution {} out of range",
                self.resolution()
            )));
        }
        if !self.resolution().is_even() {
            return Err(CaptureError::Config(format!(
                "encoder resolution {} must have even width and height",
                self.resolution()
            )));
        }
        if self.quality == 0 || self.quality > 100 {
            return Err(CaptureError::Config(format!(
                "encoder quality {} not in 1-100",
                self.quality
            )));
        }
        Ok(())
    }
}

impl std::str::FromStr for EncoderConsumerConfig {
    type Err = String;

    /// Parse `WIDTHxHEIGHT@FPS` (fps optional)
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (res, fps) = match s.split_once('@') {
            Some((res, fps)) => (
                res,
                fps.trim()
                    .parse::<u32>()
                    .map_err(|_| format!("Invalid fps in '{}'", s))?,
            ),
            None => (s, EncoderConsumerConfig::default().fps),
        };
        let resolution: Resolution = res.parse()?;
        Ok(Self {
            width: resolution.width,
            height: resolution.height,
            fps,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline.buffer_count, 4);
        assert_eq!(config.pipeline.channel_pool_size, 6);
        assert_eq!(
            config.pipeline.preferred_formats,
            vec![PixelFormat::Nv12, PixelFormat::Yuyv]
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"capture": {"fps": 60}, "pipeline": {"queue_capacity": 2}}"#)
                .unwrap();
        assert_eq!(config.capture.fps, 60);
        assert_eq!(config.capture.width, 1920);
        assert_eq!(config.pipeline.queue_capacity, 2);
        assert_eq!(config.pipeline.request_idle_polls, 90);
    }

    #[test]
    fn test_validate_rejects_zero_buffers() {
        let mut config = AppConfig::default();
        config.pipeline.buffer_count = 0;
        assert!(matches!(config.validate(), Err(CaptureError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_encoder() {
        let mut config = AppConfig::default();
        config.encoders.push(EncoderConsumerConfig {
            quality: 0,
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_odd_encoder_size() {
        for arg in ["321x240@15", "320x241@15"] {
            let enc: EncoderConsumerConfig = arg.parse().unwrap();
            assert!(enc.validate().is_err(), "{} accepted", arg);
        }
        let enc: EncoderConsumerConfig = "320x240@15".parse().unwrap();
        assert!(enc.validate().is_ok());
    }

    #[test]
    fn test_parse_encoder_arg() {
        let enc: EncoderConsumerConfig = "1280x720@15".parse().unwrap();
        assert_eq!((enc.width, enc.height, enc.fps), (1280, 720, 15));
        let enc: EncoderConsumerConfig = "640x480".parse().unwrap();
        assert_eq!(enc.fps, 30);
        assert!("640x480@x".parse::<EncoderConsumerConfig>().is_err());
    }
}
