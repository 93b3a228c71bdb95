//! Direct encode unit
//!
//! Hands slots to a hardware encode channel by index. The channel reads the
//! imported device buffer itself, so the frame is completed as soon as the
//! encoder has consumed its source.

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info};

use super::{UnitContext, UnitId};
use crate::config::EncoderConsumerConfig;
use crate::error::{CaptureError, Result};
use crate::video::channel::ChannelLease;
use crate::video::encoder::{DirectEncoder, EncodedPacket, EncodedSink, EncoderConfig};
use crate::video::frame::FrameLease;
use crate::video::stats::UnitCounters;
use std::sync::atomic::Ordering;

pub struct DirectEncodeUnit {
    id: UnitId,
    config: EncoderConfig,
    encoder: Box<dyn DirectEncoder>,
    sink: Arc<dyn EncodedSink>,
    output: Vec<u8>,
    packets: u64,
    // Dropped after the encoder releases its import
    channel: Option<ChannelLease>,
}

impl DirectEncodeUnit {
    pub(super) fn new(
        ctx: &UnitContext<'_>,
        consumer: &EncoderConsumerConfig,
        sink: Arc<dyn EncodedSink>,
    ) -> Result<Self> {
        let channel = ctx.backends.channels.lease().ok_or(CaptureError::NoChannelAvailable)?;
        let config = EncoderConfig::from_consumer(consumer, ctx.capture_format.pixel_format);
        let mut encoder = ctx.backends.direct_encoders.create(channel.id(), &config)?;
        encoder.import(ctx.slots.clone())?;

        info!(
            "Direct encode unit {} on {}: {} at {} fps",
            ctx.id,
            channel.id(),
            ctx.capture_format,
            config.fps
        );

        Ok(Self {
            id: ctx.id,
            config,
            encoder,
            sink,
            output: vec![0u8; ctx.pipeline.direct_output_buffer_size],
            packets: 0,
            channel: Some(channel),
        })
    }

    pub(super) fn process(&mut self, lease: FrameLease, stats: &UnitCounters) -> Result<bool> {
        let frame = lease.frame();
        let submitted = self
            .encoder
            .submit_source_by_slot(frame.slot_index, frame.bytes_used);
        let encoded = submitted.and_then(|()| self.encoder.get_encoded_frame(&mut self.output));
        lease.complete();
        let info = encoded?;

        let packet = EncodedPacket {
            consumer_id: self.id,
            data: Bytes::copy_from_slice(&self.output[..info.len]),
            pts_us: self.config.pts_us(self.packets),
            sequence: self.packets,
            key_frame: info.key_frame,
        };
        self.packets += 1;

        if self.sink.deliver(packet) {
            stats.packets_emitted.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(true)
    }

    pub(super) fn shutdown(&mut self) {
        if let Some(channel) = self.channel.take() {
            self.encoder.release_import();
            debug!("Direct encode unit {}: released {}", self.id, channel.id());
        }
    }
}

impl Drop for DirectEncodeUnit {
    fn drop(&mut self) {
        self.shutdown();
    }
}
