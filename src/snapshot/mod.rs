//! Rate-limited snapshot stream.
//!
//! Raw frames arrive on the capture source's callback thread. That thread only
//! pays for an atomic connection check and a throttle comparison; admitted
//! frames are handed to a worker thread through a one-slot queue and are
//! dropped when the worker is still busy with the previous one.
//!
//! Wire format: `[u32 big-endian length][compressed image bytes]` per frame.

pub mod codec;

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::PlanarFrame;
use crate::server::StreamServer;

pub use codec::{JpegCodec, StillImageCodec};

/// Decides which frames are turned into snapshots and encodes them.
pub struct SnapshotThrottler {
    min_interval: Duration,
    quality: u8,
    codec: Arc<dyn StillImageCodec>,
    last_admitted: Mutex<Option<Instant>>,
}

impl SnapshotThrottler {
    /// `max_fps == 0` disables throttling.
    pub fn new(max_fps: u32, quality: u8, codec: Arc<dyn StillImageCodec>) -> Self {
        Self {
            min_interval: frame_interval(max_fps),
            quality,
            codec,
            last_admitted: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Admit a frame seen at `now` if the throttle window has elapsed.
    ///
    /// A rejected frame leaves the throttle untouched.
    pub fn admit(&self, now: Instant) -> bool {
        let mut last = self
            .last_admitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(prev) = *last {
            if now < prev || now.duration_since(prev) < self.min_interval {
                return false;
            }
        }
        *last = Some(now);
        true
    }

    /// Convert and compress one frame into a length-prefixed wire unit.
    pub fn encode(&self, frame: &PlanarFrame) -> Result<Vec<u8>> {
        let nv21 = frame.to_nv21().context("convert snapshot frame")?;
        let image = self
            .codec
            .compress(&nv21, self.quality)
            .context("compress snapshot frame")?;
        let len = u32::try_from(image.len())
            .map_err(|_| anyhow!("snapshot of {} bytes exceeds frame limit", image.len()))?;

        let mut unit = Vec::with_capacity(4 + image.len());
        unit.extend_from_slice(&len.to_be_bytes());
        unit.extend_from_slice(&image);
        Ok(unit)
    }
}

/// Minimum spacing between admitted frames for a given rate.
pub fn frame_interval(max_fps: u32) -> Duration {
    if max_fps == 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos(1_000_000_000u64.div_ceil(u64::from(max_fps)))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    pub sent: u64,
    /// Admitted but discarded because the worker was still busy.
    pub dropped: u64,
    /// Conversion or codec failures.
    pub failed: u64,
}

/// Throttler + worker + snapshot server, as seen by one pipeline.
pub struct SnapshotChannel {
    throttler: SnapshotThrottler,
    server: Arc<StreamServer>,
    worker: Mutex<Option<SnapshotWorker>>,
    sent: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

struct SnapshotWorker {
    queue: SyncSender<PlanarFrame>,
    active: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl SnapshotChannel {
    pub fn new(throttler: SnapshotThrottler, server: Arc<StreamServer>) -> Self {
        Self {
            throttler,
            server,
            worker: Mutex::new(None),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Spawn the encode worker. No-op when it is already running.
    pub fn start(self: &Arc<Self>, poll: Duration) -> Result<()> {
        let mut worker = self.lock_worker();
        if worker.is_some() {
            return Ok(());
        }

        let (queue, rx) = mpsc::sync_channel::<PlanarFrame>(1);
        let active = Arc::new(AtomicBool::new(true));
        let channel = Arc::clone(self);
        let thread_active = active.clone();
        let join = std::thread::Builder::new()
            .name(format!("{}-encode", self.server.name()))
            .spawn(move || {
                while thread_active.load(Ordering::SeqCst) {
                    match rx.recv_timeout(poll) {
                        Ok(frame) => channel.deliver(&frame),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .context("spawn snapshot worker")?;

        *worker = Some(SnapshotWorker {
            queue,
            active,
            join,
        });
        Ok(())
    }

    /// Offer a raw frame. Never blocks on encoding or socket I/O.
    pub fn offer(&self, frame: PlanarFrame) {
        if !self.server.is_connected() {
            return;
        }
        if !self.throttler.admit(Instant::now()) {
            return;
        }
        let worker = self.lock_worker();
        let Some(worker) = worker.as_ref() else {
            return;
        };
        match worker.queue.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("{}: encoder busy, snapshot dropped", self.server.name());
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Stop and join the encode worker.
    pub fn stop(&self) {
        let Some(worker) = self.lock_worker().take() else {
            return;
        };
        worker.active.store(false, Ordering::SeqCst);
        drop(worker.queue);
        if worker.join.join().is_err() {
            log::warn!("{}: snapshot worker panicked", self.server.name());
        }
    }

    pub fn stats(&self) -> SnapshotStats {
        SnapshotStats {
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn deliver(&self, frame: &PlanarFrame) {
        if !self.server.is_connected() {
            return;
        }
        match self.throttler.encode(frame) {
            Ok(unit) => {
                if self.server.write(&unit) {
                    self.sent.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("{}: snapshot dropped: {:#}", self.server.name(), err);
            }
        }
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<SnapshotWorker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttler(max_fps: u32) -> SnapshotThrottler {
        SnapshotThrottler::new(max_fps, 80, Arc::new(JpegCodec))
    }

    #[test]
    fn ten_fps_limit_over_thirty_fps_input() {
        let throttle = throttler(10);
        let base = Instant::now();
        let admitted: Vec<Instant> = (0..30u64)
            .map(|k| base + Duration::from_nanos(k * 1_000_000_000 / 30))
            .filter(|&at| throttle.admit(at))
            .collect();

        assert!(!admitted.is_empty());
        assert!(admitted.len() <= 10);
        for pair in admitted.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
    }

    #[test]
    fn rejected_frame_does_not_reset_the_window() {
        let throttle = throttler(10);
        let base = Instant::now();
        assert!(throttle.admit(base));
        assert!(!throttle.admit(base + Duration::from_millis(60)));
        assert!(throttle.admit(base + Duration::from_millis(100)));
    }

    #[test]
    fn zero_rate_admits_everything() {
        let throttle = throttler(0);
        let now = Instant::now();
        assert!(throttle.admit(now));
        assert!(throttle.admit(now));
    }

    #[test]
    fn encoded_unit_carries_big_endian_length() -> Result<()> {
        let frame = PlanarFrame::from_i420(&vec![200u8; 8 * 8 * 3 / 2], 8, 8)?;
        let unit = throttler(10).encode(&frame)?;
        let len = u32::from_be_bytes([unit[0], unit[1], unit[2], unit[3]]) as usize;
        assert_eq!(len, unit.len() - 4);
        assert_eq!(&unit[4..6], &[0xFF, 0xD8]);
        Ok(())
    }

    #[test]
    fn conversion_failure_is_an_error() -> Result<()> {
        let mut frame = PlanarFrame::from_i420(&[0u8; 6], 2, 2)?;
        frame.y.data.truncate(1);
        assert!(throttler(10).encode(&frame).is_err());
        Ok(())
    }

    #[test]
    fn interval_rounds_up() {
        assert_eq!(frame_interval(10), Duration::from_millis(100));
        assert!(frame_interval(3) * 3 >= Duration::from_secs(1));
    }
}
