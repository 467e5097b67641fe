//! bridged - capture bridge daemon
//!
//! Starts one pipeline per configured capture source, each serving a
//! compressed stream and a snapshot stream on loopback, logs periodic health
//! lines, and stops every pipeline on Ctrl-C.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;

use capture_bridge::{BridgeConfig, JpegCodec, PipelineRegistry, SourceBackend};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve capture sources as loopback stream servers")]
struct Args {
    /// JSON configuration file. Defaults apply when omitted.
    #[arg(long, env = "BRIDGE_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = BridgeConfig::load_from(args.config.as_deref())?;
    let registry = PipelineRegistry::new(Arc::new(SourceBackend::new()), Arc::new(JpegCodec));

    for pipeline in &cfg.pipelines {
        match registry.start(pipeline.clone()) {
            Ok(controller) => log::info!(
                "pipeline {} serving stream={:?} snapshots={:?}",
                controller.source_id(),
                controller.stream_addr(),
                controller.snapshot_addr()
            ),
            Err(err) => log::error!("pipeline {} failed to start: {:#}", pipeline.source_id, err),
        }
    }
    if registry.source_ids()?.is_empty() {
        return Err(anyhow!("no pipeline could be started"));
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("bridged waiting for shutdown signal (Ctrl-C)...");
    loop {
        match rx.recv_timeout(cfg.health_log) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => log_health(&registry)?,
        }
    }

    log::info!("shutdown signal received, stopping pipelines...");
    registry.stop_all()?;
    Ok(())
}

fn log_health(registry: &PipelineRegistry) -> Result<()> {
    for id in registry.source_ids()? {
        let Some(controller) = registry.get(&id)? else {
            continue;
        };
        let stats = controller.stats();
        log::info!(
            "pipeline {} health state={:?} stream_client={} snapshot_client={} units={} configs={} snapshots sent={} dropped={} failed={}",
            id,
            controller.state(),
            controller.stream_connected(),
            controller.snapshot_connected(),
            stats.access_units,
            stats.config_updates,
            stats.snapshots.sent,
            stats.snapshots.dropped,
            stats.snapshots.failed
        );
    }
    Ok(())
}
