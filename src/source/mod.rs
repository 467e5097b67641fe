//! Capture/encode collaborators.
//!
//! A pipeline never drives a camera or an encoder directly. It asks a
//! `CaptureSource` to open a source id with a target geometry and hands it a
//! set of `FrameSinks`. The source answers with:
//! - a `CaptureSession`, used to request synchronization frames and to close
//!   the capture side
//! - an `Encoder`, polled by the pipeline's drain thread for compressed output
//!
//! Sources call the sinks from their own threads. Sinks never block on
//! encoding or socket I/O.
//!
//! Backends:
//! - `stub://...` synthetic source (test pattern + synthetic bitstream)
//! - anything else: GStreamer V4L2 capture (feature: capture-gstreamer)

#[cfg(feature = "capture-gstreamer")]
pub mod gst_capture;
pub mod synthetic;

use anyhow::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::frame::PlanarFrame;

pub use synthetic::SyntheticSource;

/// Target capture geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
        }
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}", self.width, self.height, self.fps)
    }
}

/// Opens capture sources.
pub trait CaptureSource: Send + Sync {
    fn open(&self, source_id: &str, geometry: Geometry, sinks: FrameSinks)
        -> Result<CaptureStreams>;
}

/// Everything a successful `open` hands back.
pub struct CaptureStreams {
    pub session: Box<dyn CaptureSession>,
    pub encoder: Box<dyn Encoder>,
}

/// Capture side of an open source.
pub trait CaptureSession: Send + Sync {
    /// Ask the encoder for a self-contained frame as soon as possible.
    fn request_sync_frame(&self) -> Result<()>;

    /// Stop capturing. No sink is called after this returns.
    fn close(&self) -> Result<()>;
}

/// Compressed output side of an open source. Owned by the drain thread.
pub trait Encoder: Send {
    /// Wait at most `timeout` for the next output.
    fn dequeue_output(&mut self, timeout: Duration) -> Result<EncoderOutput>;

    fn stop(&mut self) -> Result<()>;

    fn release(&mut self) -> Result<()>;
}

#[derive(Debug)]
pub enum EncoderOutput {
    /// Nothing completed within the timeout.
    Pending,
    /// New decoder configuration (usually SPS and PPS as separate units).
    FormatChanged(Vec<Vec<u8>>),
    Buffer(EncodedBuffer),
    EndOfStream,
}

/// One completed encoder output buffer.
#[derive(Clone, Debug, Default)]
pub struct EncodedBuffer {
    /// Start-code or length-prefixed units.
    pub data: Vec<u8>,
    pub key_frame: bool,
    /// Buffer carries decoder configuration instead of a frame.
    pub codec_config: bool,
}

type RawSink = dyn Fn(PlanarFrame) + Send + Sync;
type FaultSink = dyn Fn(String) + Send + Sync;

/// Callbacks a source uses to hand data back to its pipeline.
#[derive(Clone)]
pub struct FrameSinks {
    raw: Arc<RawSink>,
    fault: Arc<FaultSink>,
}

impl FrameSinks {
    pub fn new(
        raw: impl Fn(PlanarFrame) + Send + Sync + 'static,
        fault: impl Fn(String) + Send + Sync + 'static,
    ) -> Self {
        Self {
            raw: Arc::new(raw),
            fault: Arc::new(fault),
        }
    }

    /// Sinks that discard everything.
    pub fn discard() -> Self {
        Self::new(|_| {}, |_| {})
    }

    /// Deliver one raw frame (snapshot path).
    pub fn raw_frame(&self, frame: PlanarFrame) {
        (self.raw)(frame)
    }

    /// Report a fatal device condition (disconnect, device error).
    pub fn device_failed(&self, reason: impl Into<String>) {
        (self.fault)(reason.into())
    }
}

impl fmt::Debug for FrameSinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSinks").finish_non_exhaustive()
    }
}

/// Picks a backend from the source id.
#[derive(Clone, Debug, Default)]
pub struct SourceBackend {
    synthetic: SyntheticSource,
}

impl SourceBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaptureSource for SourceBackend {
    fn open(
        &self,
        source_id: &str,
        geometry: Geometry,
        sinks: FrameSinks,
    ) -> Result<CaptureStreams> {
        if source_id.starts_with("stub://") {
            return self.synthetic.open(source_id, geometry, sinks);
        }
        #[cfg(feature = "capture-gstreamer")]
        {
            gst_capture::GstreamerSource.open(source_id, geometry, sinks)
        }
        #[cfg(not(feature = "capture-gstreamer"))]
        {
            let _ = (geometry, sinks);
            anyhow::bail!(
                "source '{}' requires the capture-gstreamer feature",
                source_id
            )
        }
    }
}
