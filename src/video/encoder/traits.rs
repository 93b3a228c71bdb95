//! Encoder collaborator traits and common types

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EncoderConsumerConfig;
use crate::error::Result;
use crate::video::buffer_pool::SlotTable;
use crate::video::channel::ChannelId;
use crate::video::format::{PixelFormat, Resolution};

/// Encoder configuration
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    /// Target resolution
    pub resolution: Resolution,
    /// Pixel format of the frames the encoder is fed
    pub input_format: PixelFormat,
    /// Target frame rate
    pub fps: u32,
    /// Bitrate hint in kbps
    pub bitrate_kbps: u32,
    /// Keyframe interval
    pub gop_size: u32,
    /// Output quality (1-100)
    pub quality: u8,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::HD1080,
            input_format: PixelFormat::Nv12,
            fps: 30,
            bitrate_kbps: 4000,
            gop_size: 60,
            quality: 80,
        }
    }
}

impl EncoderConfig {
    pub fn from_consumer(consumer: &EncoderConsumerConfig, input_format: PixelFormat) -> Self {
        Self {
            resolution: consumer.resolution(),
            input_format,
            fps: consumer.fps,
            bitrate_kbps: consumer.bitrate_kbps,
            gop_size: consumer.gop,
            quality: consumer.quality,
        }
    }

    /// Presentation time of the `frame_number`-th encoded frame
    pub fn pts_us(&self, frame_number: u64) -> u64 {
        frame_number * 1_000_000 / self.fps.max(1) as u64
    }
}

/// Encoded output delivered to a consumer
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    /// Consumer (unit) id that produced the packet
    pub consumer_id: u32,
    pub data: Bytes,
    /// Presentation timestamp in microseconds
    pub pts_us: u64,
    /// Packet number within the consumer's stream
    pub sequence: u64,
    pub key_frame: bool,
}

impl EncodedPacket {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Destination of encoded packets. Delivery never blocks.
pub trait EncodedSink: Send + Sync {
    /// Hand a packet over; `false` if it was dropped
    fn deliver(&self, packet: EncodedPacket) -> bool;
}

impl EncodedSink for tokio::sync::mpsc::Sender<EncodedPacket> {
    fn deliver(&self, packet: EncodedPacket) -> bool {
        self.try_send(packet).is_ok()
    }
}

/// Sink that forwards every packet to a closure
pub struct CallbackSink<F>(pub F);

impl<F> EncodedSink for CallbackSink<F>
where
    F: Fn(EncodedPacket) + Send + Sync,
{
    fn deliver(&self, packet: EncodedPacket) -> bool {
        (self.0)(packet);
        true
    }
}

/// Codec-owned input buffer, borrowed by index and handed back on queue
#[derive(Debug)]
pub struct InputBuffer {
    pub index: usize,
    pub data: Vec<u8>,
    /// Bytes filled; 0 hands the buffer back unused
    pub len: usize,
}

/// Codec-owned output buffer
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    pub index: usize,
    pub data: Bytes,
    pub pts_us: u64,
    pub key_frame: bool,
}

/// Managed codec: input and output queues drained at the codec's own pace
///
/// Used from two threads at once (the feeding unit and its output drain).
pub trait ManagedCodec: Send + Sync {
    fn name(&self) -> &str;

    /// Borrow a free input buffer, waiting up to `timeout`
    fn dequeue_input_buffer(&self, timeout: Duration) -> Result<Option<InputBuffer>>;

    /// Hand a filled input buffer to the codec
    fn queue_input_buffer(&self, buffer: InputBuffer, pts_us: u64) -> Result<()>;

    /// Take the next encoded output, waiting up to `timeout`
    fn dequeue_output_buffer(&self, timeout: Duration) -> Result<Option<OutputBuffer>>;

    fn release_output_buffer(&self, buffer: OutputBuffer) -> Result<()>;
}

/// Creates managed codecs for software encode units
pub trait ManagedCodecFactory: Send + Sync {
    fn create(&self, config: &EncoderConfig) -> Result<Arc<dyn ManagedCodec>>;
}

/// Result of [`DirectEncoder::get_encoded_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedFrameInfo {
    pub len: usize,
    pub key_frame: bool,
}

/// Zero-copy encoder reading device buffers by slot index
pub trait DirectEncoder: Send {
    fn channel(&self) -> ChannelId;

    /// Import every slot of the pool; slots stay imported until [`Self::release_import`]
    fn import(&mut self, slots: Arc<SlotTable>) -> Result<()>;

    /// Encode the image in `index`. Returns once the source has been consumed.
    fn submit_source_by_slot(&mut self, index: u32, bytes_used: u32) -> Result<()>;

    /// Copy the last encoded frame into `buf`
    fn get_encoded_frame(&mut self, buf: &mut [u8]) -> Result<EncodedFrameInfo>;

    fn release_import(&mut self);
}

/// Creates direct encoders on a leased channel
pub trait DirectEncoderFactory: Send + Sync {
    fn create(&self, channel: ChannelId, config: &EncoderConfig) -> Result<Box<dyn DirectEncoder>>;
}
