//! Per-source streaming pipeline.
//!
//! A pipeline owns:
//! - the compressed-stream server (start-code delimited bytes, configuration
//!   replay on connect)
//! - the snapshot channel and its server (length-prefixed JPEG frames)
//! - the parameter cache
//! - the drain thread polling the source's encoder
//!
//! Lifecycle: `Stopped -> Starting -> Running -> Stopping -> Stopped`.
//! `start` and `stop` are serialized by a lifecycle lock and made idempotent by
//! the running flag. Stop always runs the same steps in the same order:
//! 1. close the capture session
//! 2. stop the drain thread
//! 3. stop and release the encoder
//! 4. clear the parameter cache
//! 5. stop both servers and the snapshot worker
//!
//! A device fault reported by the source (or an encoder failure seen by the
//! drain thread) runs that sequence for this pipeline only, on a short-lived
//! thread of its own.

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::framing::{normalize_access_unit, normalize_config};
use crate::params::ParameterCache;
use crate::server::{ConnectHook, ServerConfig, ServerStats, StreamServer, DEFAULT_ACCEPT_POLL};
use crate::snapshot::{SnapshotChannel, SnapshotStats, SnapshotThrottler, StillImageCodec};
use crate::source::{
    CaptureSession, CaptureSource, EncodedBuffer, Encoder, EncoderOutput, FrameSinks, Geometry,
};

/// Bounded wait used by the drain thread when polling the encoder.
pub const DEFAULT_DRAIN_POLL: Duration = Duration::from_millis(20);

/// Poll intervals a stopping drain thread gets before its client is dropped.
const DRAIN_GRACE_POLLS: u32 = 4;

/// Poll intervals shared by every thread of a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tuning {
    pub drain_poll: Duration,
    pub accept_poll: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            drain_poll: DEFAULT_DRAIN_POLL,
            accept_poll: DEFAULT_ACCEPT_POLL,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Identity label of the capture source (also the registry key).
    pub source_id: String,
    pub geometry: Geometry,
    pub stream_port: u16,
    pub snapshot_port: u16,
    /// Snapshot rate cap; 0 disables throttling.
    pub snapshot_max_fps: u32,
    /// JPEG quality, 1..=100.
    pub snapshot_quality: u8,
    pub tuning: Tuning,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Access units normalized from encoder output.
    pub access_units: u64,
    pub config_updates: u64,
    /// Encoder buffers whose trailing bytes were discarded as malformed.
    pub framing_drops: u64,
    pub stream: ServerStats,
    pub snapshot_server: ServerStats,
    pub snapshots: SnapshotStats,
}

/// Handle to one pipeline. Clones share the same pipeline.
#[derive(Clone)]
pub struct PipelineController {
    shared: Arc<PipelineShared>,
}

struct PipelineShared {
    config: PipelineConfig,
    source: Arc<dyn CaptureSource>,
    running: AtomicBool,
    /// Bumped by every successful `start`; faults carry the run they belong to.
    epoch: AtomicU64,
    state: Mutex<PipelineState>,
    lifecycle: Mutex<()>,
    params: Arc<ParameterCache>,
    session: Arc<SessionSlot>,
    stream_server: Arc<StreamServer>,
    snapshot_server: Arc<StreamServer>,
    snapshots: Arc<SnapshotChannel>,
    drain: Mutex<Option<DrainThread>>,
    counters: Arc<DrainCounters>,
}

struct DrainThread {
    active: Arc<AtomicBool>,
    join: JoinHandle<Option<Box<dyn Encoder>>>,
}

/// Body of a drain thread: claims the encoder, drains it, hands it back.
type DrainBody = Box<dyn FnOnce() -> Option<Box<dyn Encoder>> + Send>;

#[derive(Default)]
struct DrainCounters {
    access_units: AtomicU64,
    config_updates: AtomicU64,
    framing_drops: AtomicU64,
}

/// The open capture session, reachable from the accept thread.
#[derive(Default)]
struct SessionSlot {
    session: Mutex<Option<Arc<dyn CaptureSession>>>,
}

impl SessionSlot {
    fn install(&self, session: Arc<dyn CaptureSession>) {
        *lock(&self.session) = Some(session);
    }

    fn take(&self) -> Option<Arc<dyn CaptureSession>> {
        lock(&self.session).take()
    }

    fn current(&self) -> Option<Arc<dyn CaptureSession>> {
        lock(&self.session).clone()
    }
}

/// Compressed-stream connect hook: replay cached configuration, then ask the
/// encoder for a sync frame so the new viewer can start decoding.
struct StreamReplay {
    source_id: String,
    params: Arc<ParameterCache>,
    session: Arc<SessionSlot>,
}

impl ConnectHook for StreamReplay {
    fn replay(&self) -> Option<Vec<u8>> {
        self.params.get()
    }

    fn accepted(&self) {
        let Some(session) = self.session.current() else {
            return;
        };
        if let Err(err) = session.request_sync_frame() {
            log::debug!(
                "pipeline {}: sync frame request failed: {:#}",
                self.source_id,
                err
            );
        }
    }
}

impl PipelineController {
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn CaptureSource>,
        codec: Arc<dyn StillImageCodec>,
    ) -> Self {
        let params = Arc::new(ParameterCache::new());
        let session = Arc::new(SessionSlot::default());

        let mut stream_cfg = ServerConfig::new(
            format!("{}/stream", config.source_id),
            config.stream_port,
        );
        stream_cfg.accept_poll = config.tuning.accept_poll;
        let replay = Arc::new(StreamReplay {
            source_id: config.source_id.clone(),
            params: params.clone(),
            session: session.clone(),
        });
        let stream_server = Arc::new(StreamServer::with_hook(stream_cfg, replay));

        let mut snapshot_cfg = ServerConfig::new(
            format!("{}/snapshot", config.source_id),
            config.snapshot_port,
        );
        snapshot_cfg.accept_poll = config.tuning.accept_poll;
        let snapshot_server = Arc::new(StreamServer::new(snapshot_cfg));
        let throttler =
            SnapshotThrottler::new(config.snapshot_max_fps, config.snapshot_quality, codec);
        let snapshots = Arc::new(SnapshotChannel::new(throttler, snapshot_server.clone()));

        Self {
            shared: Arc::new(PipelineShared {
                config,
                source,
                running: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                state: Mutex::new(PipelineState::Stopped),
                lifecycle: Mutex::new(()),
                params,
                session,
                stream_server,
                snapshot_server,
                snapshots,
                drain: Mutex::new(None),
                counters: Arc::new(DrainCounters::default()),
            }),
        }
    }

    /// Open both servers, then the capture source.
    ///
    /// No-op when the pipeline is already running. On failure everything that
    /// was brought up is torn down again and the error is returned.
    pub fn start(&self) -> Result<()> {
        let shared = &self.shared;
        let _lifecycle = shared.lock_lifecycle()?;
        if shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let epoch = shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        shared.set_state(PipelineState::Starting);
        log::info!(
            "pipeline {}: starting ({})",
            shared.config.source_id,
            shared.config.geometry
        );
        if let Err(err) = shared.bring_up(epoch) {
            log::error!("pipeline {}: start failed: {:#}", shared.config.source_id, err);
            shared.running.store(false, Ordering::SeqCst);
            shared.set_state(PipelineState::Stopping);
            shared.tear_down();
            shared.set_state(PipelineState::Stopped);
            return Err(err);
        }
        shared.set_state(PipelineState::Running);
        log::info!("pipeline {}: running", shared.config.source_id);
        Ok(())
    }

    /// Tear the pipeline down. Safe to call repeatedly and from any thread
    /// other than the source's own callback threads.
    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn source_id(&self) -> &str {
        &self.shared.config.source_id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    pub fn state(&self) -> PipelineState {
        *lock(&self.shared.state)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Bound address of the compressed-stream server while running.
    pub fn stream_addr(&self) -> Option<std::net::SocketAddr> {
        self.shared.stream_server.local_addr()
    }

    /// Bound address of the snapshot server while running.
    pub fn snapshot_addr(&self) -> Option<std::net::SocketAddr> {
        self.shared.snapshot_server.local_addr()
    }

    pub fn stream_connected(&self) -> bool {
        self.shared.stream_server.is_connected()
    }

    pub fn snapshot_connected(&self) -> bool {
        self.shared.snapshot_server.is_connected()
    }

    /// Currently cached decoder configuration.
    pub fn parameters(&self) -> Option<Vec<u8>> {
        self.shared.params.get()
    }

    pub fn stats(&self) -> PipelineStats {
        let shared = &self.shared;
        PipelineStats {
            access_units: shared.counters.access_units.load(Ordering::Relaxed),
            config_updates: shared.counters.config_updates.load(Ordering::Relaxed),
            framing_drops: shared.counters.framing_drops.load(Ordering::Relaxed),
            stream: shared.stream_server.stats(),
            snapshot_server: shared.snapshot_server.stats(),
            snapshots: shared.snapshots.stats(),
        }
    }
}

impl PipelineShared {
    fn bring_up(self: &Arc<Self>, epoch: u64) -> Result<()> {
        self.stream_server.start()?;
        self.snapshot_server.start()?;
        self.snapshots.start(self.config.tuning.drain_poll)?;

        let snapshots = self.snapshots.clone();
        let faults = Arc::downgrade(self);
        let sinks = FrameSinks::new(
            move |frame| snapshots.offer(frame),
            move |reason| report_fault(&faults, epoch, reason),
        );
        let streams = self
            .source
            .open(&self.config.source_id, self.config.geometry, sinks)
            .with_context(|| format!("open capture source {}", self.config.source_id))?;
        self.session.install(Arc::from(streams.session));

        let active = Arc::new(AtomicBool::new(true));
        let ctx = DrainContext {
            source_id: self.config.source_id.clone(),
            active: active.clone(),
            poll: self.config.tuning.drain_poll,
            params: self.params.clone(),
            server: self.stream_server.clone(),
            counters: self.counters.clone(),
            faults: Arc::downgrade(self),
            epoch,
        };
        let name = format!("{}-drain", self.config.source_id);
        let join = launch_drain(ctx, streams.encoder, |body| {
            std::thread::Builder::new().name(name).spawn(body)
        })?;
        *lock(&self.drain) = Some(DrainThread { active, join });
        Ok(())
    }

    fn stop(&self) {
        self.stop_run(None);
    }

    /// Stop the pipeline. With `Some(epoch)` the stop only applies to that
    /// run, so a fault raised by an earlier run cannot stop a later one.
    fn stop_run(&self, epoch: Option<u64>) {
        let _lifecycle = match self.lock_lifecycle() {
            Ok(guard) => guard,
            Err(err) => {
                log::error!("pipeline {}: {:#}", self.config.source_id, err);
                return;
            }
        };
        if let Some(epoch) = epoch {
            if epoch != self.epoch.load(Ordering::SeqCst) {
                log::debug!(
                    "pipeline {}: ignoring fault from run {}",
                    self.config.source_id,
                    epoch
                );
                return;
            }
        }
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        log::info!("pipeline {}: stopping", self.config.source_id);
        self.set_state(PipelineState::Stopping);
        self.tear_down();
        self.set_state(PipelineState::Stopped);
        log::info!("pipeline {}: stopped", self.config.source_id);
    }

    /// Release everything, in order, whatever state start reached.
    fn tear_down(&self) {
        let id = &self.config.source_id;

        if let Some(session) = self.session.take() {
            if let Err(err) = session.close() {
                log::warn!("pipeline {}: closing capture session failed: {:#}", id, err);
            }
        }

        if let Some(encoder) = self.stop_drain() {
            retire_encoder(id, encoder);
        }

        self.params.clear();

        self.stream_server.stop();
        self.snapshot_server.stop();
        self.snapshots.stop();
    }

    fn stop_drain(&self) -> Option<Box<dyn Encoder>> {
        let drain = lock(&self.drain).take()?;
        drain.active.store(false, Ordering::SeqCst);

        let poll = self.config.tuning.drain_poll;
        let deadline = Instant::now() + poll * DRAIN_GRACE_POLLS;
        while !drain.join.is_finished() && Instant::now() < deadline {
            std::thread::sleep((poll / 4).max(Duration::from_millis(1)));
        }
        if !drain.join.is_finished() {
            // Still inside a write to a client that stopped reading.
            log::warn!(
                "pipeline {}: drain thread blocked, dropping stream client",
                self.config.source_id
            );
            self.stream_server.disconnect();
        }

        match drain.join.join() {
            Ok(encoder) => encoder,
            Err(_) => {
                log::warn!("pipeline {}: drain thread panicked", self.config.source_id);
                None
            }
        }
    }

    fn set_state(&self, state: PipelineState) {
        *lock(&self.state) = state;
    }

    fn lock_lifecycle(&self) -> Result<MutexGuard<'_, ()>> {
        self.lifecycle
            .lock()
            .map_err(|_| anyhow!("pipeline {} lifecycle lock poisoned", self.config.source_id))
    }
}

/// Hand `encoder` to a drain thread started by `spawn`.
///
/// The encoder travels through a shared slot rather than the closure, so a
/// failed spawn leaves it here to be stopped and released.
fn launch_drain<S>(
    ctx: DrainContext,
    encoder: Box<dyn Encoder>,
    spawn: S,
) -> Result<JoinHandle<Option<Box<dyn Encoder>>>>
where
    S: FnOnce(DrainBody) -> std::io::Result<JoinHandle<Option<Box<dyn Encoder>>>>,
{
    let source_id = ctx.source_id.clone();
    let handoff = Arc::new(Mutex::new(Some(encoder)));
    let claim = handoff.clone();
    let body: DrainBody = Box::new(move || {
        let encoder = lock(&claim).take()?;
        Some(ctx.run(encoder))
    });
    match spawn(body) {
        Ok(join) => Ok(join),
        Err(err) => {
            if let Some(encoder) = lock(&handoff).take() {
                retire_encoder(&source_id, encoder);
            }
            Err(err).context("spawn drain thread")
        }
    }
}

fn retire_encoder(source_id: &str, mut encoder: Box<dyn Encoder>) {
    if let Err(err) = encoder.stop() {
        log::warn!("pipeline {}: stopping encoder failed: {:#}", source_id, err);
    }
    if let Err(err) = encoder.release() {
        log::warn!("pipeline {}: releasing encoder failed: {:#}", source_id, err);
    }
}

/// Run the stop sequence on a thread of its own so the reporting thread (a
/// source callback or the drain thread) is never asked to join itself.
fn report_fault(pipeline: &Weak<PipelineShared>, epoch: u64, reason: String) {
    let Some(shared) = pipeline.upgrade() else {
        return;
    };
    if !shared.running.load(Ordering::SeqCst) || shared.epoch.load(Ordering::SeqCst) != epoch {
        return;
    }
    log::error!(
        "pipeline {}: device fault: {}",
        shared.config.source_id,
        reason
    );
    let name = format!("{}-fault", shared.config.source_id);
    if let Err(err) = std::thread::Builder::new()
        .name(name)
        .spawn(move || shared.stop_run(Some(epoch)))
    {
        log::error!("failed to spawn fault handler: {}", err);
    }
}

struct DrainContext {
    source_id: String,
    active: Arc<AtomicBool>,
    poll: Duration,
    params: Arc<ParameterCache>,
    server: Arc<StreamServer>,
    counters: Arc<DrainCounters>,
    faults: Weak<PipelineShared>,
    epoch: u64,
}

impl DrainContext {
    fn run(self, mut encoder: Box<dyn Encoder>) -> Box<dyn Encoder> {
        while self.active.load(Ordering::SeqCst) {
            match encoder.dequeue_output(self.poll) {
                Ok(EncoderOutput::Pending) => {}
                Ok(EncoderOutput::FormatChanged(units)) => self.publish_config(&units),
                Ok(EncoderOutput::Buffer(buffer)) if buffer.codec_config => {
                    self.publish_config(&[buffer.data])
                }
                Ok(EncoderOutput::Buffer(buffer)) => self.publish_access_unit(&buffer),
                Ok(EncoderOutput::EndOfStream) => {
                    self.fault("encoder reached end of stream".to_string());
                    break;
                }
                Err(err) => {
                    self.fault(format!("encoder failed: {:#}", err));
                    break;
                }
            }
        }
        log::debug!("pipeline {}: drain thread exited", self.source_id);
        encoder
    }

    fn publish_config<T: AsRef<[u8]>>(&self, units: &[T]) {
        let blob = normalize_config(units);
        if blob.is_empty() {
            return;
        }
        log::info!(
            "pipeline {}: decoder configuration updated ({} bytes)",
            self.source_id,
            blob.len()
        );
        self.params.set(blob.clone());
        self.counters.config_updates.fetch_add(1, Ordering::Relaxed);
        self.server.write(&blob);
    }

    fn publish_access_unit(&self, buffer: &EncodedBuffer) {
        let normalized = normalize_access_unit(&buffer.data);
        if normalized.dropped > 0 {
            self.counters.framing_drops.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "pipeline {}: discarded {} malformed trailing bytes",
                self.source_id,
                normalized.dropped
            );
        }
        if normalized.is_empty() {
            return;
        }
        self.counters.access_units.fetch_add(1, Ordering::Relaxed);
        self.server.write(&normalized.bytes);
    }

    fn fault(&self, reason: String) {
        if self.active.load(Ordering::SeqCst) {
            report_fault(&self.faults, self.epoch, reason);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::START_CODE;
    use crate::snapshot::JpegCodec;
    use crate::source::SyntheticSource;
    use std::io::Read;
    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize;

    fn synthetic_pipeline() -> PipelineController {
        let config = PipelineConfig {
            source_id: "stub://unit".to_string(),
            geometry: Geometry {
                width: 32,
                height: 16,
                fps: 60,
            },
            stream_port: 0,
            snapshot_port: 0,
            snapshot_max_fps: 0,
            snapshot_quality: 75,
            tuning: Tuning {
                drain_poll: Duration::from_millis(10),
                accept_poll: Duration::from_millis(10),
            },
        };
        PipelineController::new(
            config,
            Arc::new(SyntheticSource::default()),
            Arc::new(JpegCodec),
        )
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn synthetic_source_streams_configuration_then_units() -> Result<()> {
        let pipeline = synthetic_pipeline();
        pipeline.start()?;
        assert!(wait_for(|| pipeline.parameters().is_some()));
        let params = pipeline.parameters().ok_or_else(|| anyhow!("no parameters"))?;
        assert!(params.starts_with(&START_CODE));

        let addr = pipeline.stream_addr().ok_or_else(|| anyhow!("not bound"))?;
        let mut client = TcpStream::connect(addr)?;
        client.set_read_timeout(Some(Duration::from_secs(5)))?;
        let mut head = vec![0u8; params.len() + START_CODE.len() + 1];
        client.read_exact(&mut head)?;
        assert_eq!(&head[..params.len()], params.as_slice());
        assert_eq!(&head[params.len()..params.len() + 4], &START_CODE);

        assert!(wait_for(|| pipeline.stats().access_units > 0));
        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert!(pipeline.parameters().is_none());
        assert!(!pipeline.stream_connected());
        Ok(())
    }

    #[test]
    fn pipeline_restarts_after_stop() -> Result<()> {
        let pipeline = synthetic_pipeline();
        pipeline.start()?;
        pipeline.stop();
        pipeline.start()?;
        assert!(pipeline.is_running());
        assert!(pipeline.snapshot_addr().is_some());
        pipeline.stop();
        Ok(())
    }

    #[test]
    fn stale_fault_does_not_stop_a_restarted_pipeline() -> Result<()> {
        let pipeline = synthetic_pipeline();
        pipeline.start()?;
        let stale = pipeline.shared.epoch.load(Ordering::SeqCst);
        pipeline.stop();
        pipeline.start()?;
        let current = pipeline.shared.epoch.load(Ordering::SeqCst);
        assert_ne!(stale, current);

        let weak = Arc::downgrade(&pipeline.shared);
        report_fault(&weak, stale, "late fault from the first run".to_string());
        pipeline.shared.stop_run(Some(stale));
        std::thread::sleep(Duration::from_millis(50));
        assert!(pipeline.is_running());
        assert_eq!(pipeline.state(), PipelineState::Running);

        report_fault(&weak, current, "fault from the live run".to_string());
        assert!(wait_for(|| pipeline.state() == PipelineState::Stopped));
        assert!(!pipeline.is_running());
        Ok(())
    }

    #[derive(Default)]
    struct Retirements {
        stopped: AtomicUsize,
        released: AtomicUsize,
    }

    struct CountingEncoder(Arc<Retirements>);

    impl Encoder for CountingEncoder {
        fn dequeue_output(&mut self, timeout: Duration) -> Result<EncoderOutput> {
            std::thread::sleep(timeout);
            Ok(EncoderOutput::Pending)
        }

        fn stop(&mut self) -> Result<()> {
            self.0.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn release(&mut self) -> Result<()> {
            self.0.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn drain_context(active: Arc<AtomicBool>) -> DrainContext {
        DrainContext {
            source_id: "stub://drain".to_string(),
            active,
            poll: Duration::from_millis(5),
            params: Arc::new(ParameterCache::new()),
            server: Arc::new(StreamServer::new(ServerConfig::new("drain", 0))),
            counters: Arc::new(DrainCounters::default()),
            faults: Weak::new(),
            epoch: 1,
        }
    }

    #[test]
    fn failed_drain_spawn_releases_the_encoder() {
        let retirements = Arc::new(Retirements::default());
        let encoder = Box::new(CountingEncoder(retirements.clone()));
        let result = launch_drain(drain_context(Arc::new(AtomicBool::new(true))), encoder, |_body| {
            Err(std::io::Error::other("thread limit reached"))
        });

        assert!(result.is_err());
        assert_eq!(retirements.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(retirements.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drain_thread_hands_the_encoder_back() -> Result<()> {
        let retirements = Arc::new(Retirements::default());
        let encoder = Box::new(CountingEncoder(retirements.clone()));
        let active = Arc::new(AtomicBool::new(true));
        let join = launch_drain(drain_context(active.clone()), encoder, |body| {
            std::thread::Builder::new().name("drain-test".to_string()).spawn(body)
        })?;

        active.store(false, Ordering::SeqCst);
        let returned = join.join().map_err(|_| anyhow!("drain thread panicked"))?;
        assert!(returned.is_some());
        // Retiring is left to the caller on the success path.
        assert_eq!(retirements.released.load(Ordering::SeqCst), 0);
        Ok(())
    }
}
