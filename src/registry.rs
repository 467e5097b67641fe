use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};

use crate::pipeline::{PipelineConfig, PipelineController};
use crate::snapshot::StillImageCodec;
use crate::source::CaptureSource;

/// Thread-safe map of source id to pipeline.
///
/// Pipelines share one capture backend and one still-image codec. A pipeline
/// that stopped on a device fault stays registered (state `Stopped`) until it
/// is replaced or removed.
pub struct PipelineRegistry {
    source: Arc<dyn CaptureSource>,
    codec: Arc<dyn StillImageCodec>,
    pipelines: Mutex<HashMap<String, PipelineController>>,
}

impl PipelineRegistry {
    pub fn new(source: Arc<dyn CaptureSource>, codec: Arc<dyn StillImageCodec>) -> Self {
        Self {
            source,
            codec,
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    /// Start a pipeline for `config.source_id`.
    ///
    /// An existing pipeline for the same source is stopped and replaced first.
    /// When the new pipeline fails to start, nothing is registered for the id.
    pub fn start(&self, config: PipelineConfig) -> Result<PipelineController> {
        let mut pipelines = self.lock()?;
        if let Some(previous) = pipelines.remove(&config.source_id) {
            log::info!("replacing pipeline {}", config.source_id);
            previous.stop();
        }

        let id = config.source_id.clone();
        let controller = PipelineController::new(config, self.source.clone(), self.codec.clone());
        controller.start()?;
        pipelines.insert(id, controller.clone());
        Ok(controller)
    }

    /// Stop and remove one pipeline. Returns false when none was registered.
    pub fn stop(&self, source_id: &str) -> Result<bool> {
        let removed = self.lock()?.remove(source_id);
        match removed {
            Some(controller) => {
                controller.stop();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stop and remove every pipeline.
    pub fn stop_all(&self) -> Result<()> {
        let drained: Vec<PipelineController> =
            self.lock()?.drain().map(|(_, controller)| controller).collect();
        for controller in drained {
            controller.stop();
        }
        Ok(())
    }

    pub fn get(&self, source_id: &str) -> Result<Option<PipelineController>> {
        Ok(self.lock()?.get(source_id).cloned())
    }

    /// Registered source ids, sorted.
    pub fn source_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.lock()?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, PipelineController>>> {
        self.pipelines
            .lock()
            .map_err(|_| anyhow!("pipeline registry lock poisoned"))
    }
}
