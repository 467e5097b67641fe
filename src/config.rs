use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::pipeline::{PipelineConfig, Tuning};
use crate::source::Geometry;

const DEFAULT_SOURCE_ID: &str = "stub://camera0";
const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;
const DEFAULT_FPS: u32 = 30;
const DEFAULT_STREAM_PORT: u16 = 27183;
const DEFAULT_SNAPSHOT_PORT: u16 = 27184;
const DEFAULT_SNAPSHOT_FPS: u32 = 5;
const DEFAULT_SNAPSHOT_QUALITY: u8 = 80;
const DEFAULT_DRAIN_POLL_MS: u64 = 20;
const DEFAULT_ACCEPT_POLL_MS: u64 = 50;
const DEFAULT_HEALTH_LOG_SECS: u64 = 5;

#[derive(Debug, Deserialize, Default)]
struct BridgeConfigFile {
    pipelines: Option<Vec<PipelineConfigFile>>,
    tuning: Option<TuningConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    source_id: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    stream_port: Option<u16>,
    snapshot_port: Option<u16>,
    snapshot_max_fps: Option<u32>,
    snapshot_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct TuningConfigFile {
    drain_poll_ms: Option<u64>,
    accept_poll_ms: Option<u64>,
    health_log_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub pipelines: Vec<PipelineConfig>,
    pub tuning: Tuning,
    /// Interval between daemon health lines.
    pub health_log: Duration,
}

impl BridgeConfig {
    /// Load from the file named by `BRIDGE_CONFIG` (if set), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("BRIDGE_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Same as `load`, with the file path given explicitly.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: BridgeConfigFile) -> Result<Self> {
        let tuning_file = file.tuning.unwrap_or_default();
        let tuning = Tuning {
            drain_poll: Duration::from_millis(
                tuning_file.drain_poll_ms.unwrap_or(DEFAULT_DRAIN_POLL_MS),
            ),
            accept_poll: Duration::from_millis(
                tuning_file.accept_poll_ms.unwrap_or(DEFAULT_ACCEPT_POLL_MS),
            ),
        };
        let health_log = Duration::from_secs(
            tuning_file
                .health_log_secs
                .unwrap_or(DEFAULT_HEALTH_LOG_SECS),
        );

        let entries = file
            .pipelines
            .unwrap_or_else(|| vec![PipelineConfigFile::default()]);
        let pipelines = entries
            .into_iter()
            .map(|entry| PipelineConfig {
                source_id: entry
                    .source_id
                    .unwrap_or_else(|| DEFAULT_SOURCE_ID.to_string()),
                geometry: Geometry {
                    width: entry.width.unwrap_or(DEFAULT_WIDTH),
                    height: entry.height.unwrap_or(DEFAULT_HEIGHT),
                    fps: entry.fps.unwrap_or(DEFAULT_FPS),
                },
                stream_port: entry.stream_port.unwrap_or(DEFAULT_STREAM_PORT),
                snapshot_port: entry.snapshot_port.unwrap_or(DEFAULT_SNAPSHOT_PORT),
                snapshot_max_fps: entry.snapshot_max_fps.unwrap_or(DEFAULT_SNAPSHOT_FPS),
                snapshot_quality: entry.snapshot_quality.unwrap_or(DEFAULT_SNAPSHOT_QUALITY),
                tuning,
            })
            .collect();

        Ok(Self {
            pipelines,
            tuning,
            health_log,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(poll) = std::env::var("BRIDGE_DRAIN_POLL_MS") {
            let millis: u64 = poll
                .parse()
                .map_err(|_| anyhow!("BRIDGE_DRAIN_POLL_MS must be an integer number of milliseconds"))?;
            self.tuning.drain_poll = Duration::from_millis(millis);
            for pipeline in &mut self.pipelines {
                pipeline.tuning.drain_poll = self.tuning.drain_poll;
            }
        }

        let single = self.pipelines.len() == 1;
        let Some(pipeline) = self.pipelines.first_mut().filter(|_| single) else {
            if any_pipeline_override_set() {
                log::warn!("per-pipeline BRIDGE_* overrides ignored: more than one pipeline configured");
            }
            return Ok(());
        };

        if let Ok(source) = std::env::var("BRIDGE_SOURCE") {
            if !source.trim().is_empty() {
                pipeline.source_id = source.trim().to_string();
            }
        }
        if let Some(port) = parse_env::<u16>("BRIDGE_STREAM_PORT", "a port number")? {
            pipeline.stream_port = port;
        }
        if let Some(port) = parse_env::<u16>("BRIDGE_SNAPSHOT_PORT", "a port number")? {
            pipeline.snapshot_port = port;
        }
        if let Some(fps) = parse_env::<u32>("BRIDGE_SNAPSHOT_FPS", "an integer frame rate")? {
            pipeline.snapshot_max_fps = fps;
        }
        if let Some(quality) = parse_env::<u8>("BRIDGE_SNAPSHOT_QUALITY", "an integer 1-100")? {
            pipeline.snapshot_quality = quality;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.pipelines.is_empty() {
            return Err(anyhow!("at least one pipeline must be configured"));
        }
        if self.tuning.drain_poll.is_zero() || self.tuning.accept_poll.is_zero() {
            return Err(anyhow!("poll intervals must be greater than zero"));
        }
        if self.health_log.is_zero() {
            return Err(anyhow!("health_log_secs must be greater than zero"));
        }

        let mut ids = HashSet::new();
        let mut ports = HashSet::new();
        for pipeline in &self.pipelines {
            let id = &pipeline.source_id;
            if id.trim().is_empty() {
                return Err(anyhow!("pipeline source_id must not be empty"));
            }
            if !ids.insert(id.as_str()) {
                return Err(anyhow!("duplicate pipeline source_id {}", id));
            }
            let geometry = pipeline.geometry;
            if geometry.width == 0 || geometry.height == 0 || geometry.fps == 0 {
                return Err(anyhow!("pipeline {}: invalid geometry {}", id, geometry));
            }
            if !(1..=100).contains(&pipeline.snapshot_quality) {
                return Err(anyhow!(
                    "pipeline {}: snapshot_quality must be within 1-100",
                    id
                ));
            }
            for port in [pipeline.stream_port, pipeline.snapshot_port] {
                if port == 0 {
                    return Err(anyhow!("pipeline {}: ports must be non-zero", id));
                }
                if !ports.insert(port) {
                    return Err(anyhow!("pipeline {}: port {} already in use", id, port));
                }
            }
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<BridgeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn parse_env<T: std::str::FromStr>(key: &str, expected: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be {}", key, expected)),
        _ => Ok(None),
    }
}

fn any_pipeline_override_set() -> bool {
    [
        "BRIDGE_SOURCE",
        "BRIDGE_STREAM_PORT",
        "BRIDGE_SNAPSHOT_PORT",
        "BRIDGE_SNAPSHOT_FPS",
        "BRIDGE_SNAPSHOT_QUALITY",
    ]
    .iter()
    .any(|key| std::env::var_os(key).is_some())
}
