//! Software encode unit: frames are converted into a managed codec's input
//! buffers and encoded output is drained on a separate thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{UnitContext, UnitId};
use crate::config::EncoderConsumerConfig;
use crate::error::{CaptureError, Result};
use crate::error_throttled;
use crate::utils::LogThrottler;
use crate::video::buffer_pool::SlotTable;
use crate::video::convert::{required_len, PixelConverter};
use crate::video::encoder::{EncodedPacket, EncodedSink, EncoderConfig, ManagedCodec};
use crate::video::format::{Format, PixelFormat};
use crate::video::frame::FrameLease;
use crate::video::stats::UnitCounters;

pub struct SoftwareEncodeUnit {
    id: UnitId,
    codec: Arc<dyn ManagedCodec>,
    config: EncoderConfig,
    input_format: Format,
    converter: Arc<dyn PixelConverter>,
    input_timeout: Duration,
    frames_fed: u64,
    drain_stop: Arc<AtomicBool>,
    drain: Option<JoinHandle<()>>,
}

impl SoftwareEncodeUnit {
    pub(super) fn new(
        ctx: &UnitContext<'_>,
        consumer: &EncoderConsumerConfig,
        sink: Arc<dyn EncodedSink>,
    ) -> Result<Self> {
        if ctx.capture_format.pixel_format.is_compressed() {
            return Err(CaptureError::Config(format!(
                "cannot convert {} capture for encoding",
                ctx.capture_format.pixel_format
            )));
        }
        let config = EncoderConfig::from_consumer(consumer, PixelFormat::Nv12);
        let input_format = Format::packed(config.resolution, config.input_format);
        required_len(&input_format)?;
        let codec = ctx.backends.managed_codecs.create(&config)?;
        let timeout = ctx.pipeline.codec_drain_timeout();

        let drain_stop = Arc::new(AtomicBool::new(false));
        let drain = {
            let codec = codec.clone();
            let stop = drain_stop.clone();
            let stats = ctx.stats.clone();
            let id = ctx.id;
            std::thread::Builder::new()
                .name(format!("codec-drain-{}", id))
                .spawn(move || drain_loop(id, codec, sink, stop, timeout, stats))?
        };

        info!(
            "Software encode unit {}: {} -> {} via {}",
            ctx.id,
            ctx.capture_format,
            input_format,
            codec.name()
        );

        Ok(Self {
            id: ctx.id,
            codec,
            config,
            input_format,
            converter: ctx.backends.converter.clone(),
            input_timeout: timeout,
            frames_fed: 0,
            drain_stop,
            drain: Some(drain),
        })
    }

    /// Feed one frame. `Ok(false)` if the codec had no free input buffer.
    pub(super) fn process(&mut self, lease: FrameLease, slots: &SlotTable) -> Result<bool> {
        let Some(mut input) = self.codec.dequeue_input_buffer(self.input_timeout)? else {
            debug!(
                "Encoder unit {}: no codec input buffer, skipping frame {}",
                self.id,
                lease.frame().sequence
            );
            return Ok(false);
        };

        let frame = lease.frame();
        let converted = match slots.get(frame.slot_index) {
            Some(slot) => self.converter.convert(
                slot.data(frame.bytes_used),
                &frame.format,
                &mut input.data,
                &self.input_format,
            ),
            None => Err(CaptureError::InvalidState(format!(
                "slot {} not in pool",
                frame.slot_index
            ))),
        };
        // The device buffer is no longer read past this point.
        lease.complete();

        if let Err(e) = converted {
            input.len = 0;
            self.codec.queue_input_buffer(input, 0)?;
            return Err(e);
        }

        input.len = self.input_format.size_image as usize;
        let pts_us = self.config.pts_us(self.frames_fed);
        self.frames_fed += 1;
        self.codec.queue_input_buffer(input, pts_us)?;
        Ok(true)
    }

    pub(super) fn shutdown(&mut self) {
        self.drain_stop.store(true, Ordering::Release);
        if let Some(drain) = self.drain.take() {
            if drain.join().is_err() {
                warn!("Encoder unit {}: drain thread panicked", self.id);
            }
        }
    }
}

impl Drop for SoftwareEncodeUnit {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drain_loop(
    id: UnitId,
    codec: Arc<dyn ManagedCodec>,
    sink: Arc<dyn EncodedSink>,
    stop: Arc<AtomicBool>,
    timeout: Duration,
    stats: Arc<UnitCounters>,
) {
    let throttler = LogThrottler::default();
    let mut sequence = 0u64;

    while !stop.load(Ordering::Acquire) {
        let output = match codec.dequeue_output_buffer(timeout) {
            Ok(Some(output)) => output,
            Ok(None) => continue,
            Err(e) => {
                error_throttled!(throttler, "dequeue_output", "Encoder unit {}: {}", id, e);
                continue;
            }
        };

        let packet = EncodedPacket {
            consumer_id: id,
            data: output.data.clone(),
            pts_us: output.pts_us,
            sequence,
            key_frame: output.key_frame,
        };
        sequence += 1;

        if sink.deliver(packet) {
            stats.packets_emitted.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
        }
        if let Err(e) = codec.release_output_buffer(output) {
            error_throttled!(throttler, "release_output", "Encoder unit {}: {}", id, e);
        }
    }
    debug!("Encoder unit {}: drain stopped after {} packets", id, sequence);
}
