//! Video source abstraction for the inference server.
//!
//! The hardware decoder and the hardware resizer are external collaborators;
//! this crate defines the seams the stream supervisors program against:
//! [`VideoSource`] / [`SourceFactory`] for decode, [`PixelConvert`] for
//! NV12 → RGB resizing, plus a deterministic [`synth::SyntheticFactory`]
//! used by tests and driverless deployments.

use std::time::Duration;

use thiserror::Error;

mod convert;
mod frame;
pub mod synth;

pub use convert::{ConvertError, PixelConvert, SoftwareConverter, calc_proportional_height};
pub use frame::{Nv12Frame, nv12_buffer_len};

/// Errors surfaced by video sources.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open video source {url:?}: {reason}")]
    Open { url: String, reason: String },
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("stream ended")]
    EndOfStream,
}

/// Connection parameters applied when opening a source.
#[derive(Clone, Debug)]
pub struct SourceOptions {
    /// Prefer TCP transport for RTP payloads.
    pub tcp_transport: bool,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            tcp_transport: true,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
        }
    }
}

/// An open, decodable video connection.
///
/// Implementations block inside [`decode_frame`](VideoSource::decode_frame)
/// until the next frame is available or the source fails. `skip_frame`
/// advances decoder state without materialising a CPU-visible buffer, which
/// is what the frame-skip path of the decode loop wants.
pub trait VideoSource: Send {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn fps(&self) -> f64;
    fn codec_name(&self) -> &str;
    fn is_hardware(&self) -> bool;

    /// Decode the next frame and extract its NV12 payload.
    fn decode_frame(&mut self) -> Result<Nv12Frame, SourceError>;

    /// Decode and discard the next frame.
    fn skip_frame(&mut self) -> Result<(), SourceError>;

    /// Release decoder resources. Called once before drop; must be idempotent.
    fn close(&mut self);
}

/// Opens [`VideoSource`]s for a URL. One factory serves every stream; each
/// reconnect attempt goes through `open` again.
pub trait SourceFactory: Send + Sync {
    fn open(&self, url: &str, opts: &SourceOptions) -> Result<Box<dyn VideoSource>, SourceError>;
}
