//! stream_probe - connect to a bridge port and check what it serves.
//!
//! Compressed mode splits the stream on start codes and reports unit counts by
//! type, and whether decoder configuration arrived before the first picture.
//! Snapshot mode reads length-prefixed frames, checks JPEG markers and can
//! keep the latest one on disk.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use std::io::{ErrorKind, Read};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use capture_bridge::wire::{read_snapshot_frame, UnitScanner};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Stream,
    Snapshots,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Probe a capture bridge stream or snapshot port")]
struct Args {
    /// Loopback port to connect to.
    #[arg(long)]
    port: u16,

    #[arg(long, value_enum, default_value = "stream")]
    mode: Mode,

    /// How long to read before reporting.
    #[arg(long, default_value_t = 5)]
    seconds: u64,

    /// Write the latest snapshot to this path (snapshot mode).
    #[arg(long)]
    save: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct StreamReport {
    units: u64,
    parameter_sets: u64,
    idr: u64,
    other: u64,
    config_first: Option<bool>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut stream = TcpStream::connect(("127.0.0.1", args.port))
        .with_context(|| format!("connect to 127.0.0.1:{}", args.port))?;
    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    log::info!("connected to port {}, reading for {}s", args.port, args.seconds);

    match args.mode {
        Mode::Stream => {
            let report = probe_stream(&mut stream, deadline)?;
            log::info!(
                "units={} parameter_sets={} idr={} other={} config_first={:?}",
                report.units,
                report.parameter_sets,
                report.idr,
                report.other,
                report.config_first
            );
        }
        Mode::Snapshots => {
            let (count, latest) = probe_snapshots(&mut stream, deadline)?;
            log::info!("snapshots={}", count);
            if let (Some(path), Some(jpeg)) = (args.save.as_ref(), latest) {
                std::fs::write(path, &jpeg)
                    .map_err(|e| anyhow!("failed to write {}: {}", path.display(), e))?;
                log::info!("latest snapshot ({} bytes) written to {}", jpeg.len(), path.display());
            }
        }
    }
    Ok(())
}

fn probe_stream(stream: &mut TcpStream, deadline: Instant) -> Result<StreamReport> {
    let mut report = StreamReport::default();
    let mut scanner = UnitScanner::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let Some(remaining) = remaining(deadline) else {
            break;
        };
        stream.set_read_timeout(Some(remaining))?;
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if is_timeout(e.kind()) => break,
            Err(e) => return Err(e).context("read compressed stream"),
        };
        for unit in scanner.push(&buf[..n]) {
            tally(&mut report, &unit);
        }
    }
    if let Some(unit) = scanner.finish() {
        tally(&mut report, &unit);
    }
    Ok(report)
}

fn tally(report: &mut StreamReport, unit: &[u8]) {
    report.units += 1;
    match unit.first().map(|header| header & 0x1F) {
        Some(7) | Some(8) => {
            report.parameter_sets += 1;
            report.config_first.get_or_insert(true);
        }
        Some(5) => {
            report.idr += 1;
            report.config_first.get_or_insert(false);
        }
        _ => {
            report.other += 1;
            report.config_first.get_or_insert(false);
        }
    }
}

fn probe_snapshots(stream: &mut TcpStream, deadline: Instant) -> Result<(u64, Option<Vec<u8>>)> {
    let mut count = 0u64;
    let mut latest = None;
    while let Some(remaining) = remaining(deadline) {
        stream.set_read_timeout(Some(remaining))?;
        let jpeg = match read_snapshot_frame(stream) {
            Ok(Some(jpeg)) => jpeg,
            Ok(None) => break,
            Err(err) => match err.downcast_ref::<std::io::Error>() {
                Some(io) if is_timeout(io.kind()) => break,
                _ => return Err(err),
            },
        };
        if !jpeg.starts_with(&[0xFF, 0xD8]) || !jpeg.ends_with(&[0xFF, 0xD9]) {
            log::warn!("snapshot {} is not a complete JPEG ({} bytes)", count, jpeg.len());
        }
        count += 1;
        latest = Some(jpeg);
    }
    Ok((count, latest))
}

fn remaining(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|left| !left.is_zero())
}

fn is_timeout(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::TimedOut)
}
