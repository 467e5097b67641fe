//! Single-client loopback TCP server.
//!
//! Each server owns one listener and at most one client. A new client
//! supersedes the previous one: the old socket is shut down before the new one
//! is installed, so bytes written after an accept can never reach the old
//! client. All writes go through the connection slot mutex, which is also held
//! while a `ConnectHook` replays its bytes to a fresh client.

use anyhow::{anyhow, Context, Result};
use std::io::{BufWriter, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// How often the accept loop re-checks the running flag.
pub const DEFAULT_ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Per-connection callbacks run by the accept thread.
pub trait ConnectHook: Send + Sync {
    /// Bytes delivered to a new client before any other write can reach it.
    fn replay(&self) -> Option<Vec<u8>> {
        None
    }

    /// Runs after the replay, once the write lock has been released.
    fn accepted(&self) {}
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Name used in logs and thread names.
    pub name: String,
    /// Loopback port; 0 picks an ephemeral port.
    pub port: u16,
    pub accept_poll: Duration,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            accept_poll: DEFAULT_ACCEPT_POLL,
        }
    }
}

/// Counters for one server, across all of its clients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub connections_accepted: u64,
    pub bytes_written: u64,
    pub write_failures: u64,
}

pub struct StreamServer {
    cfg: ServerConfig,
    shared: Arc<Shared>,
    accept_join: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    name: String,
    hook: Option<Arc<dyn ConnectHook>>,
    running: AtomicBool,
    connected: AtomicBool,
    slot: Mutex<Option<ActiveConnection>>,
    /// Clone of the active socket, reachable without the slot lock so a
    /// blocked writer can be interrupted.
    closer: Mutex<Option<TcpStream>>,
    local_addr: Mutex<Option<SocketAddr>>,
    connections_accepted: AtomicU64,
    bytes_written: AtomicU64,
    write_failures: AtomicU64,
}

struct ActiveConnection {
    peer: SocketAddr,
    writer: BufWriter<TcpStream>,
}

impl ActiveConnection {
    fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()
    }

    fn close(mut self) {
        let _ = self.writer.flush();
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }
}

impl StreamServer {
    pub fn new(cfg: ServerConfig) -> Self {
        Self::build(cfg, None)
    }

    pub fn with_hook(cfg: ServerConfig, hook: Arc<dyn ConnectHook>) -> Self {
        Self::build(cfg, Some(hook))
    }

    fn build(cfg: ServerConfig, hook: Option<Arc<dyn ConnectHook>>) -> Self {
        let shared = Arc::new(Shared {
            name: cfg.name.clone(),
            hook,
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            slot: Mutex::new(None),
            closer: Mutex::new(None),
            local_addr: Mutex::new(None),
            connections_accepted: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        });
        Self {
            cfg,
            shared,
            accept_join: Mutex::new(None),
        }
    }

    /// Bind the listener and start accepting on a dedicated thread.
    ///
    /// Returns immediately. Calling `start` on a running server is a no-op.
    pub fn start(&self) -> Result<()> {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let listener = match bind_loopback(self.cfg.port) {
            Ok(listener) => listener,
            Err(err) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(err.context(format!("{}: bind port {}", self.cfg.name, self.cfg.port)));
            }
        };
        let addr = listener.local_addr()?;
        *lock(&self.shared.local_addr) = Some(addr);

        let shared = self.shared.clone();
        let poll = self.cfg.accept_poll;
        let spawned = std::thread::Builder::new()
            .name(format!("{}-accept", self.cfg.name))
            .spawn(move || run_accept_loop(listener, shared, poll));
        match spawned {
            Ok(join) => {
                *lock(&self.accept_join) = Some(join);
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(anyhow!("{}: spawn accept thread: {}", self.cfg.name, err));
            }
        }

        log::info!("{}: listening on {}", self.cfg.name, addr);
        Ok(())
    }

    /// Stop accepting, drop the active client and join the accept thread.
    ///
    /// Safe to call more than once; only the first call after a `start` acts.
    pub fn stop(&self) {
        if self
            .shared
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        self.shared.interrupt();
        if let Some(join) = lock(&self.accept_join).take() {
            if join.join().is_err() {
                log::warn!("{}: accept thread panicked", self.cfg.name);
            }
        }
        // The accept thread may have installed a client after the interrupt.
        self.shared.drop_connection();
        lock(&self.shared.local_addr).take();
        log::info!("{}: stopped", self.cfg.name);
    }

    /// Write one complete unit to the active client.
    ///
    /// Returns false when nobody is connected or the write failed. A failed
    /// client is closed and forgotten; the server keeps accepting.
    pub fn write(&self, bytes: &[u8]) -> bool {
        self.shared.write(bytes)
    }

    /// Drop the active client, if any, without stopping the listener.
    pub fn disconnect(&self) {
        self.shared.interrupt();
        self.shared.drop_connection();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Lock-free check for an active client.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.shared.local_addr)
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            connections_accepted: self.shared.connections_accepted.load(Ordering::Relaxed),
            bytes_written: self.shared.bytes_written.load(Ordering::Relaxed),
            write_failures: self.shared.write_failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn install(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        // Listener sockets are non-blocking; clients must not inherit that.
        stream
            .set_nonblocking(false)
            .context("set client socket blocking")?;
        stream.set_nodelay(true).context("set TCP_NODELAY")?;
        let closer = stream.try_clone().context("clone client socket")?;

        // Unblock a writer stuck on the old client before taking its lock.
        self.interrupt();
        let mut slot = lock(&self.slot);
        if let Some(previous) = slot.take() {
            log::info!(
                "{}: client {} superseded by {}",
                self.name,
                previous.peer,
                peer
            );
            previous.close();
        }

        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        log::info!("{}: client connected from {}", self.name, peer);
        let mut conn = ActiveConnection {
            peer,
            writer: BufWriter::new(stream),
        };

        // Published before the replay so `stop` can break a stalled replay.
        *lock(&self.closer) = Some(closer);
        if !self.running.load(Ordering::SeqCst) {
            lock(&self.closer).take();
            conn.close();
            return Err(anyhow!("{} stopping; dropped {}", self.name, peer));
        }
        if let Some(bytes) = self.hook.as_ref().and_then(|hook| hook.replay()) {
            if let Err(err) = conn.send(&bytes) {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                self.connected.store(false, Ordering::SeqCst);
                lock(&self.closer).take();
                conn.close();
                return Err(anyhow!("replay to {} failed: {}", peer, err));
            }
            self.bytes_written
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            log::debug!("{}: replayed {} bytes to {}", self.name, bytes.len(), peer);
        }

        *slot = Some(conn);
        self.connected.store(true, Ordering::SeqCst);
        drop(slot);

        if let Some(hook) = &self.hook {
            hook.accepted();
        }
        Ok(())
    }

    fn write(&self, bytes: &[u8]) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        let mut slot = lock(&self.slot);
        let Some(conn) = slot.as_mut() else {
            return false;
        };
        match conn.send(bytes) {
            Ok(()) => {
                self.bytes_written
                    .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                true
            }
            Err(err) => {
                log::info!("{}: client {} dropped: {}", self.name, conn.peer, err);
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                if let Some(conn) = slot.take() {
                    conn.close();
                }
                lock(&self.closer).take();
                self.connected.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Shut the active socket down without waiting for the slot lock.
    fn interrupt(&self) {
        if let Some(stream) = lock(&self.closer).take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn drop_connection(&self) {
        let mut slot = lock(&self.slot);
        if let Some(conn) = slot.take() {
            log::info!("{}: client {} disconnected", self.name, conn.peer);
            conn.close();
        }
        lock(&self.closer).take();
        self.connected.store(false, Ordering::SeqCst);
    }
}

fn run_accept_loop(listener: TcpListener, shared: Arc<Shared>, poll: Duration) {
    while shared.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if !shared.running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(err) = shared.install(stream, peer) {
                    log::warn!("{}: client rejected: {}", shared.name, err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(poll);
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => {
                log::warn!("{}: accept failed: {}", shared.name, err);
                std::thread::sleep(poll);
            }
        }
    }
    log::debug!("{}: accept loop exited", shared.name);
}

fn bind_loopback(port: u16) -> Result<TcpListener> {
    let configured = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = TcpListener::bind(configured)?;
    let addr = listener.local_addr()?;
    if !addr.ip().is_loopback() {
        return Err(anyhow!(
            "configured for loopback address '{}', but bound to non-loopback address '{}'",
            configured,
            addr
        ));
    }
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::Instant;

    fn test_server() -> Result<StreamServer> {
        let mut cfg = ServerConfig::new("test-server", 0);
        cfg.accept_poll = Duration::from_millis(10);
        let server = StreamServer::new(cfg);
        server.start()?;
        Ok(server)
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
    fn write_without_client_is_a_no_op() -> Result<()> {
        let server = test_server()?;
        assert!(!server.write(b"nobody listening"));
        assert_eq!(server.stats().bytes_written, 0);
        server.stop();
        Ok(())
    }

    #[test]
    fn bytes_reach_the_connected_client() -> Result<()> {
        let server = test_server()?;
        let addr = server.local_addr().ok_or_else(|| anyhow!("not bound"))?;
        let mut client = TcpStream::connect(addr)?;
        assert!(wait_for(|| server.is_connected()));

        assert!(server.write(b"hello"));
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf)?;
        assert_eq!(&buf, b"hello");
        assert_eq!(server.stats().connections_accepted, 1);
        server.stop();
        Ok(())
    }

    #[test]
    fn stop_is_idempotent_and_releases_the_port() -> Result<()> {
        let server = test_server()?;
        assert!(server.local_addr().is_some());
        server.stop();
        server.stop();
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
        Ok(())
    }

    #[test]
    fn server_can_be_restarted() -> Result<()> {
        let server = test_server()?;
        server.stop();
        server.start()?;
        let addr = server.local_addr().ok_or_else(|| anyhow!("not bound"))?;
        let _client = TcpStream::connect(addr)?;
        assert!(wait_for(|| server.is_connected()));
        server.stop();
        assert!(!server.is_connected());
        Ok(())
    }
}
