//! Synthetic capture/encode source (`stub://...`).
//!
//! Produces a moving I420 test pattern at the requested rate and a matching
//! synthetic bitstream in length-prefixed framing: one format event with a
//! parameter-set pair, then one unit per captured frame, with an IDR unit at
//! every GOP boundary and whenever a sync frame was requested. The bitstream
//! is not decodable; it exercises framing, replay and lifecycle end to end.

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{
    CaptureSession, CaptureSource, CaptureStreams, EncodedBuffer, Encoder, EncoderOutput,
    FrameSinks, Geometry,
};
use crate::frame::{PlanarFrame, Plane};

const DEFAULT_GOP: u64 = 60;
const ENCODER_BACKLOG: usize = 8;
const NAL_IDR: u8 = 0x65;
const NAL_NON_IDR: u8 = 0x41;
// Unit lengths stay out of 0x100..=0x1FF so a big-endian prefix never reads
// as a three-byte start code (`00 00 01`).
const IDR_FILLER: usize = 1024;
const NON_IDR_FILLER: usize = 32;

#[derive(Clone, Debug)]
pub struct SyntheticSource {
    /// Frames between forced IDR units.
    pub gop: u64,
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self { gop: DEFAULT_GOP }
    }
}

impl CaptureSource for SyntheticSource {
    fn open(
        &self,
        source_id: &str,
        geometry: Geometry,
        sinks: FrameSinks,
    ) -> Result<CaptureStreams> {
        if geometry.width == 0 || geometry.height == 0 || geometry.fps == 0 {
            return Err(anyhow!("synthetic source {}: invalid geometry {}", source_id, geometry));
        }

        let active = Arc::new(AtomicBool::new(true));
        let sync_requested = Arc::new(AtomicBool::new(false));
        let (frames_tx, frames_rx) = mpsc::sync_channel(ENCODER_BACKLOG);

        let producer_active = active.clone();
        let producer = std::thread::Builder::new()
            .name("synthetic-capture".to_string())
            .spawn(move || run_producer(geometry, sinks, frames_tx, producer_active))
            .context("spawn synthetic capture thread")?;

        log::info!("synthetic source {} opened at {}", source_id, geometry);
        Ok(CaptureStreams {
            session: Box::new(SyntheticSession {
                active,
                sync_requested: sync_requested.clone(),
                producer: Mutex::new(Some(producer)),
            }),
            encoder: Box::new(SyntheticEncoder {
                geometry,
                gop: self.gop.max(1),
                frames: frames_rx,
                sync_requested,
                format_sent: false,
                released: false,
            }),
        })
    }
}

struct SyntheticSession {
    active: Arc<AtomicBool>,
    sync_requested: Arc<AtomicBool>,
    producer: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureSession for SyntheticSession {
    fn request_sync_frame(&self) -> Result<()> {
        self.sync_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        let producer = self
            .producer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(producer) = producer {
            producer
                .join()
                .map_err(|_| anyhow!("synthetic capture thread panicked"))?;
        }
        Ok(())
    }
}

fn run_producer(
    geometry: Geometry,
    sinks: FrameSinks,
    frames: SyncSender<u64>,
    active: Arc<AtomicBool>,
) {
    let interval = Duration::from_nanos(1_000_000_000 / u64::from(geometry.fps));
    let mut next = Instant::now();
    let mut index = 0u64;
    while active.load(Ordering::SeqCst) {
        sinks.raw_frame(test_pattern(geometry, index));
        match frames.try_send(index) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => log::debug!("synthetic encoder backlog full"),
            Err(TrySendError::Disconnected(_)) => break,
        }
        index += 1;

        next += interval;
        let now = Instant::now();
        if next > now {
            std::thread::sleep(next - now);
        } else {
            next = now;
        }
    }
}

/// Diagonal luma ramp drifting one step per frame, with slow chroma bands.
pub fn test_pattern(geometry: Geometry, index: u64) -> PlanarFrame {
    let w = geometry.width as usize;
    let h = geometry.height as usize;
    let cw = w.div_ceil(2);
    let ch = h.div_ceil(2);
    let shift = (index % 256) as usize;

    let mut y = Vec::with_capacity(w * h);
    for row in 0..h {
        y.extend((0..w).map(|col| ((row + col + shift * 4) & 0xFF) as u8));
    }
    let mut u = Vec::with_capacity(cw * ch);
    let mut v = Vec::with_capacity(cw * ch);
    for row in 0..ch {
        u.extend((0..cw).map(|col| ((col * 2 + shift) & 0xFF) as u8));
        v.extend((0..cw).map(|_| ((row * 2) & 0xFF) as u8));
    }

    PlanarFrame {
        width: geometry.width,
        height: geometry.height,
        y: Plane::packed(y, w),
        u: Plane::packed(u, cw),
        v: Plane::packed(v, cw),
    }
}

struct SyntheticEncoder {
    geometry: Geometry,
    gop: u64,
    frames: Receiver<u64>,
    sync_requested: Arc<AtomicBool>,
    format_sent: bool,
    released: bool,
}

impl SyntheticEncoder {
    fn parameter_sets(&self) -> Vec<Vec<u8>> {
        let mut sps = vec![0x67, 0x42, 0xC0, 0x1F];
        sps.extend_from_slice(&(self.geometry.width as u16).to_be_bytes());
        sps.extend_from_slice(&(self.geometry.height as u16).to_be_bytes());
        sps.push(self.geometry.fps.min(255) as u8);
        let pps = vec![0x68, 0xCE, 0x3C, 0x80];
        vec![sps, pps]
    }
}

/// One length-prefixed unit: header byte, frame index, then filler.
fn access_unit(index: u64, key_frame: bool) -> Vec<u8> {
    let mut nal = vec![if key_frame { NAL_IDR } else { NAL_NON_IDR }];
    nal.extend_from_slice(&index.to_be_bytes());
    let filler = if key_frame {
        IDR_FILLER
    } else {
        NON_IDR_FILLER + (index % 32) as usize
    };
    nal.extend((0..filler).map(|i| (i as u64 ^ index) as u8 | 0x01));

    let mut out = Vec::with_capacity(nal.len() + 4);
    out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
    out.extend_from_slice(&nal);
    out
}

impl Encoder for SyntheticEncoder {
    fn dequeue_output(&mut self, timeout: Duration) -> Result<EncoderOutput> {
        if self.released {
            return Err(anyhow!("synthetic encoder already released"));
        }
        if !self.format_sent {
            self.format_sent = true;
            return Ok(EncoderOutput::FormatChanged(self.parameter_sets()));
        }
        match self.frames.recv_timeout(timeout) {
            Ok(index) => {
                let requested = self.sync_requested.swap(false, Ordering::SeqCst);
                let key_frame = requested || index % self.gop == 0;
                Ok(EncoderOutput::Buffer(EncodedBuffer {
                    data: access_unit(index, key_frame),
                    key_frame,
                    codec_config: false,
                }))
            }
            Err(RecvTimeoutError::Timeout) => Ok(EncoderOutput::Pending),
            Err(RecvTimeoutError::Disconnected) => Ok(EncoderOutput::EndOfStream),
        }
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.released = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{normalize_access_unit, START_CODE};

    fn geometry() -> Geometry {
        Geometry {
            width: 32,
            height: 16,
            fps: 100,
        }
    }

    fn next_buffer(encoder: &mut dyn Encoder) -> Result<EncodedBuffer> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let EncoderOutput::Buffer(buffer) = encoder.dequeue_output(Duration::from_millis(50))? {
                return Ok(buffer);
            }
        }
        Err(anyhow!("no encoded buffer within deadline"))
    }

    #[test]
    fn first_output_is_a_format_change() -> Result<()> {
        let streams = SyntheticSource::default().open("stub://t", geometry(), FrameSinks::discard())?;
        let mut encoder = streams.encoder;
        match encoder.dequeue_output(Duration::from_millis(10))? {
            EncoderOutput::FormatChanged(units) => assert_eq!(units.len(), 2),
            other => panic!("expected format change, got {:?}", other),
        }
        streams.session.close()?;
        Ok(())
    }

    #[test]
    fn units_are_length_prefixed_and_sync_forces_idr() -> Result<()> {
        let source = SyntheticSource { gop: 1_000 };
        let streams = source.open("stub://t", geometry(), FrameSinks::discard())?;
        let mut encoder = streams.encoder;
        encoder.dequeue_output(Duration::from_millis(10))?;

        let first = next_buffer(encoder.as_mut())?;
        assert!(first.key_frame);
        let normalized = normalize_access_unit(&first.data);
        assert_eq!(normalized.units, 1);
        assert_eq!(normalized.dropped, 0);
        assert!(normalized.bytes.starts_with(&START_CODE));

        let second = next_buffer(encoder.as_mut())?;
        assert!(!second.key_frame);

        streams.session.request_sync_frame()?;
        let third = next_buffer(encoder.as_mut())?;
        assert!(third.key_frame);

        streams.session.close()?;
        encoder.release()?;
        assert!(encoder.dequeue_output(Duration::from_millis(1)).is_err());
        Ok(())
    }

    #[test]
    fn every_unit_converts_to_one_start_coded_unit() {
        for index in 0..64 {
            for key_frame in [true, false] {
                let unit = access_unit(index, key_frame);
                let normalized = normalize_access_unit(&unit);
                assert_eq!(normalized.units, 1, "index {} key {}", index, key_frame);
                assert_eq!(normalized.dropped, 0, "index {} key {}", index, key_frame);
                assert!(normalized.bytes.starts_with(&START_CODE));
                assert_eq!(normalized.bytes.len(), unit.len());
                let header = if key_frame { NAL_IDR } else { NAL_NON_IDR };
                assert_eq!(normalized.bytes[START_CODE.len()], header);
            }
        }
    }

    #[test]
    fn test_pattern_has_i420_plane_sizes() -> Result<()> {
        let frame = test_pattern(
            Geometry {
                width: 5,
                height: 3,
                fps: 1,
            },
            7,
        );
        assert_eq!(frame.y.data.len(), 15);
        assert_eq!(frame.u.data.len(), 6);
        assert_eq!(frame.to_nv21()?.data.len(), 15 + 12);
        Ok(())
    }
}
