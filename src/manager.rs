//! Group lifecycle for all configured cameras.

use anyhow::{anyhow, Context, Result};
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::CameraConfig;
use crate::frame::FrameSink;
use crate::source::StreamSource;
use crate::worker::{CameraWorker, WorkerReport, WorkerState};

/// Owns every `CameraWorker` for the lifetime of the ingestion service.
///
/// `start()` is all-or-nothing: if any camera fails to connect, the cameras
/// already started are shut down before the error is returned. `stop()`
/// returns only after every ingestion thread has exited and released its
/// connection.
#[derive(Debug)]
pub struct IngestionManager {
    workers: Vec<CameraWorker>,
}

impl IngestionManager {
    /// Build one worker per camera. All cameras share `source` and `sink`.
    pub fn initialize(
        cameras: Vec<CameraConfig>,
        source: Arc<dyn StreamSource>,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut workers = Vec::with_capacity(cameras.len());
        for (index, camera) in cameras.into_iter().enumerate() {
            let worker = CameraWorker::new(camera, Arc::clone(&source), Arc::clone(&sink))
                .with_context(|| format!("camera #{} is invalid", index))?;
            if !seen.insert(worker.id().to_string()) {
                return Err(anyhow!(
                    "camera #{} duplicates id '{}'; set distinct groupId/cameraId",
                    index,
                    worker.id()
                ));
            }
            workers.push(worker);
        }
        log::info!("ingestion manager initialized with {} cameras", workers.len());
        Ok(Self { workers })
    }

    /// Start every camera in configuration order.
    pub fn start(&mut self) -> Result<()> {
        for index in 0..self.workers.len() {
            if let Err(err) = self.workers[index].start() {
                log::error!(
                    "camera {} failed to start; rolling back {} started cameras",
                    self.workers[index].id(),
                    index
                );
                for started in &self.workers[..index] {
                    started.stop();
                }
                for started in &mut self.workers[..index] {
                    if let Err(join_err) = started.join() {
                        log::error!("{:#}", join_err);
                    }
                }
                return Err(err);
            }
        }
        log::info!("all {} cameras streaming", self.workers.len());
        Ok(())
    }

    /// Signal every worker, then wait for all of them.
    ///
    /// Signalling first lets the cameras wind down in parallel. Safe to call
    /// more than once.
    pub fn stop(&mut self) -> Result<()> {
        for worker in &self.workers {
            worker.stop();
        }
        let mut panicked = Vec::new();
        for worker in &mut self.workers {
            if let Err(err) = worker.join() {
                log::error!("{:#}", err);
                panicked.push(worker.id().to_string());
            }
        }
        if !panicked.is_empty() {
            return Err(anyhow!(
                "ingestion threads panicked: {}",
                panicked.join(", ")
            ));
        }
        log::info!("ingestion manager stopped");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn workers(&self) -> &[CameraWorker] {
        &self.workers
    }

    pub fn worker(&self, id: &str) -> Option<&CameraWorker> {
        self.workers.iter().find(|worker| worker.id() == id)
    }

    pub fn reports(&self) -> Vec<WorkerReport> {
        self.workers.iter().map(CameraWorker::report).collect()
    }

    /// Workers whose ingestion thread exited without being asked to.
    pub fn dead_workers(&self) -> Vec<WorkerReport> {
        self.reports()
            .into_iter()
            .filter(|report| report.state == WorkerState::Dead)
            .collect()
    }
}

impl Drop for IngestionManager {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("ingestion manager stop on drop failed: {:#}", err);
        }
    }
}
