//! turbojpeg encoders
//!
//! Both encoders convert their input to I420 and hand it to turbojpeg's YUV
//! compressor, which skips the internal RGB colour conversion.
//!
//! ```text
//! NV12/YUYV/UYVY ──convert──> I420 ──turbojpeg──> JPEG
//! ```

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::traits::{
    DirectEncoder, DirectEncoderFactory, EncodedFrameInfo, EncoderConfig, InputBuffer,
    ManagedCodec, ManagedCodecFactory, OutputBuffer,
};
use crate::error::{CaptureError, Result};
use crate::video::buffer_pool::SlotTable;
use crate::video::channel::ChannelId;
use crate::video::convert::{PixelConverter, SoftwareConverter};
use crate::video::format::{Format, PixelFormat, Resolution};

/// turbojpeg compressor plus its I420 staging buffer
///
/// Not thread-safe: turbojpeg handles must be used from one thread at a time.
struct JpegCompressor {
    compressor: turbojpeg::Compressor,
    i420: Vec<u8>,
    i420_format: Format,
}

impl JpegCompressor {
    fn new(resolution: Resolution, quality: u8) -> Result<Self> {
        let mut compressor = turbojpeg::Compressor::new().map_err(|e| {
            CaptureError::Encoder(format!("Failed to create turbojpeg compressor: {}", e))
        })?;
        compressor
            .set_quality(quality.clamp(1, 100) as i32)
            .map_err(|e| CaptureError::Encoder(format!("Failed to set JPEG quality: {}", e)))?;

        let i420_format = Format::packed(resolution, PixelFormat::Yuv420);
        Ok(Self {
            compressor,
            i420: vec![0u8; i420_format.size_image as usize],
            i420_format,
        })
    }

    fn encode(&mut self, src: &[u8], src_format: &Format) -> Result<Vec<u8>> {
        SoftwareConverter.convert(src, src_format, &mut self.i420, &self.i420_format)?;

        let yuv_image = turbojpeg::YuvImage {
            pixels: self.i420.as_slice(),
            width: self.i420_format.width() as usize,
            height: self.i420_format.height() as usize,
            align: 1,
            subsamp: turbojpeg::Subsamp::Sub2x2,
        };
        self.compressor
            .compress_yuv_to_vec(yuv_image)
            .map_err(|e| CaptureError::Encoder(format!("JPEG compression failed: {}", e)))
    }
}

#[derive(Default)]
struct CodecQueues {
    free: Vec<InputBuffer>,
    pending: VecDeque<(InputBuffer, u64)>,
    next_output: usize,
}

/// Managed codec producing one JPEG per queued NV12 input buffer
///
/// Compression runs on the thread that dequeues output, so input and output
/// drain independently.
pub struct JpegCodec {
    name: String,
    input_format: Format,
    compressor: Mutex<JpegCompressor>,
    queues: Mutex<CodecQueues>,
    input_free: Condvar,
    output_pending: Condvar,
}

impl JpegCodec {
    pub fn new(config: &EncoderConfig, input_buffers: usize) -> Result<Self> {
        let input_format = Format::packed(config.resolution, PixelFormat::Nv12);
        let compressor = JpegCompressor::new(config.resolution, config.quality)?;
        let free = (0..input_buffers.max(1))
            .map(|index| InputBuffer {
                index,
                data: vec![0u8; input_format.size_image as usize],
                len: 0,
            })
            .collect();

        Ok(Self {
            name: format!("jpeg-codec {}", config.resolution),
            input_format,
            compressor: Mutex::new(compressor),
            queues: Mutex::new(CodecQueues {
                free,
                ..Default::default()
            }),
            input_free: Condvar::new(),
            output_pending: Condvar::new(),
        })
    }

    /// Layout of the input buffers
    pub fn input_format(&self) -> Format {
        self.input_format
    }
}

impl ManagedCodec for JpegCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn dequeue_input_buffer(&self, timeout: Duration) -> Result<Option<InputBuffer>> {
        let deadline = Instant::now() + timeout;
        let mut queues = self.queues.lock();
        while queues.free.is_empty() {
            if self.input_free.wait_until(&mut queues, deadline).timed_out() {
                break;
            }
        }
        Ok(queues.free.pop())
    }

    fn queue_input_buffer(&self, mut buffer: InputBuffer, pts_us: u64) -> Result<()> {
        let mut queues = self.queues.lock();
        if buffer.len == 0 {
            queues.free.push(buffer);
            drop(queues);
            self.input_free.notify_one();
            return Ok(());
        }
        buffer.len = buffer.len.min(buffer.data.len());
        queues.pending.push_back((buffer, pts_us));
        drop(queues);
        self.output_pending.notify_one();
        Ok(())
    }

    fn dequeue_output_buffer(&self, timeout: Duration) -> Result<Option<OutputBuffer>> {
        let deadline = Instant::now() + timeout;
        let (mut input, pts_us, index) = {
            let mut queues = self.queues.lock();
            loop {
                if let Some((input, pts)) = queues.pending.pop_front() {
                    let index = queues.next_output;
                    queues.next_output = queues.next_output.wrapping_add(1);
                    break (input, pts, index);
                }
                if self.output_pending.wait_until(&mut queues, deadline).timed_out()
                    && queues.pending.is_empty()
                {
                    return Ok(None);
                }
            }
        };

        let encoded = self
            .compressor
            .lock()
            .encode(&input.data[..input.len], &self.input_format);

        input.len = 0;
        self.queues.lock().free.push(input);
        self.input_free.notify_one();

        let data = encoded?;
        Ok(Some(OutputBuffer {
            index,
            data: Bytes::from(data),
            pts_us,
            key_frame: true,
        }))
    }

    fn release_output_buffer(&self, buffer: OutputBuffer) -> Result<()> {
        debug!("{}: released output {}", self.name, buffer.index);
        Ok(())
    }
}

/// Creates [`JpegCodec`]s
#[derive(Debug, Clone)]
pub struct JpegCodecFactory {
    pub input_buffers: usize,
}

impl Default for JpegCodecFactory {
    fn default() -> Self {
        Self { input_buffers: 2 }
    }
}

impl ManagedCodecFactory for JpegCodecFactory {
    fn create(&self, config: &EncoderConfig) -> Result<Arc<dyn ManagedCodec>> {
        Ok(Arc::new(JpegCodec::new(config, self.input_buffers)?))
    }
}

/// Direct encoder compressing straight out of the imported device buffers
pub struct JpegDirectEncoder {
    channel: ChannelId,
    config: EncoderConfig,
    slots: Option<Arc<SlotTable>>,
    compressor: JpegCompressor,
    encoded: Option<Vec<u8>>,
}

impl JpegDirectEncoder {
    pub fn new(channel: ChannelId, config: &EncoderConfig) -> Result<Self> {
        Ok(Self {
            channel,
            config: config.clone(),
            slots: None,
            compressor: JpegCompressor::new(config.resolution, config.quality)?,
            encoded: None,
        })
    }
}

impl DirectEncoder for JpegDirectEncoder {
    fn channel(&self) -> ChannelId {
        self.channel
    }

    fn import(&mut self, slots: Arc<SlotTable>) -> Result<()> {
        let format = slots.format();
        if format.resolution != self.config.resolution {
            return Err(CaptureError::Encoder(format!(
                "{}: capture {} does not match encoder {}",
                self.channel, format.resolution, self.config.resolution
            )));
        }
        if format.pixel_format.is_compressed() {
            return Err(CaptureError::Encoder(format!(
                "{}: cannot import {} buffers",
                self.channel, format.pixel_format
            )));
        }
        debug!("{}: imported {} slots", self.channel, slots.len());
        self.slots = Some(slots);
        Ok(())
    }

    fn submit_source_by_slot(&mut self, index: u32, bytes_used: u32) -> Result<()> {
        let table = self
            .slots
            .as_ref()
            .ok_or_else(|| CaptureError::Encoder(format!("{}: no slots imported", self.channel)))?;
        let slot = table.get(index).ok_or_else(|| {
            CaptureError::Encoder(format!("{}: slot {} not imported", self.channel, index))
        })?;
        let encoded = self.compressor.encode(slot.data(bytes_used), table.format())?;
        self.encoded = Some(encoded);
        Ok(())
    }

    fn get_encoded_frame(&mut self, buf: &mut [u8]) -> Result<EncodedFrameInfo> {
        let encoded = self
            .encoded
            .take()
            .ok_or_else(|| CaptureError::Encoder(format!("{}: no encoded frame", self.channel)))?;
        if encoded.len() > buf.len() {
            return Err(CaptureError::Encoder(format!(
                "{}: frame of {} bytes exceeds output buffer of {}",
                self.channel,
                encoded.len(),
                buf.len()
            )));
        }
        buf[..encoded.len()].copy_from_slice(&encoded);
        Ok(EncodedFrameInfo {
            len: encoded.len(),
            key_frame: true,
        })
    }

    fn release_import(&mut self) {
        if self.slots.take().is_some() {
            debug!("{}: released slot import", self.channel);
        }
    }
}

/// Creates [`JpegDirectEncoder`]s
#[derive(Debug, Clone, Default)]
pub struct JpegDirectEncoderFactory;

impl DirectEncoderFactory for JpegDirectEncoderFactory {
    fn create(&self, channel: ChannelId, config: &EncoderConfig) -> Result<Box<dyn DirectEncoder>> {
        Ok(Box::new(JpegDirectEncoder::new(channel, config)?))
    }
}
