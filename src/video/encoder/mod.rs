//! Encoder collaborators
//!
//! - Managed codec interface (input/output buffer queues) for the scaled path
//! - Direct encoder interface (slot import, submit by index) for the zero-copy path
//! - turbojpeg implementations of both
//! - Encoded output sinks

pub mod jpeg;
pub mod traits;

pub use jpeg::{JpegCodec, JpegCodecFactory, JpegDirectEncoder, JpegDirectEncoderFactory};
pub use traits::{
    CallbackSink, DirectEncoder, DirectEncoderFactory, EncodedFrameInfo, EncodedPacket,
    EncodedSink, EncoderConfig, InputBuffer, ManagedCodec, ManagedCodecFactory, OutputBuffer,
};
