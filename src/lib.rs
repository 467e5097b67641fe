//! capture-bridge
//!
//! Serves a camera as two loopback TCP streams per capture source:
//!
//! 1. **Compressed stream**: H.264 access units in start-code framing. A new
//!    client first receives the cached decoder configuration, then the
//!    encoder is asked for a sync frame, then units follow in capture order.
//! 2. **Snapshot stream**: rate-limited JPEG stills, each written as a
//!    4-byte big-endian length followed by the JPEG bytes.
//!
//! Each server holds at most one client; a new connection supersedes the old
//! one. Capture and encoding live behind the `source` traits so the pipeline
//! runs the same against a V4L2/GStreamer device or the synthetic source.
//!
//! # Module Structure
//!
//! - `server`: single-client loopback stream server
//! - `framing`: length-prefixed to start-code normalization
//! - `params`: decoder configuration cache
//! - `frame`: planar 4:2:0 frames and NV21/RGB conversion
//! - `snapshot`: throttled JPEG snapshot channel
//! - `source`: capture/encode collaborator traits and backends
//! - `pipeline`: per-source lifecycle and drain thread
//! - `registry`: source id to pipeline map
//! - `config`: daemon configuration
//! - `wire`: client-side protocol readers

pub mod config;
pub mod frame;
pub mod framing;
pub mod params;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod snapshot;
pub mod source;
pub mod wire;

pub use config::BridgeConfig;
pub use frame::{Nv21Image, PlanarFrame, Plane};
pub use params::ParameterCache;
pub use pipeline::{PipelineConfig, PipelineController, PipelineState, PipelineStats, Tuning};
pub use registry::PipelineRegistry;
pub use server::{ConnectHook, ServerConfig, ServerStats, StreamServer};
pub use snapshot::{JpegCodec, SnapshotStats, SnapshotThrottler, StillImageCodec};
pub use source::{
    CaptureSession, CaptureSource, CaptureStreams, EncodedBuffer, Encoder, EncoderOutput,
    FrameSinks, Geometry, SourceBackend, SyntheticSource,
};
