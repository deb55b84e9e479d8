//! Per-camera worker.
//!
//! A `CameraWorker` owns one camera's connection lifecycle:
//!
//! ```text
//! Idle -> Connecting -> Streaming -> ShuttingDown -> Stopped
//!            |              |
//!            v              v
//!          Failed          Dead   (stream ended / loop panicked)
//! ```
//!
//! The ingestion loop runs on its own named thread, wrapped in a supervisor
//! that records an unexpected exit as `Dead` so the manager can see it.
//! Shutdown is cooperative: the flag is checked once per iteration, so an
//! in-flight read is never interrupted.

use anyhow::{anyhow, Result};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::config::CameraConfig;
use crate::fps::FrameRateTracker;
use crate::frame::{Frame, FrameSink};
use crate::source::{Connection, ReadOutcome, StreamSource, StreamUri};

const FAILURE_LOG_EVERY: u64 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkerState {
    Idle,
    Connecting,
    Streaming,
    ShuttingDown,
    Stopped,
    /// Connection could not be opened.
    Failed,
    /// Ingestion thread exited without a shutdown request.
    Dead,
}

impl WorkerState {
    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkerState::Stopped | WorkerState::Failed | WorkerState::Dead
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Connecting => "connecting",
            WorkerState::Streaming => "streaming",
            WorkerState::ShuttingDown => "shutting-down",
            WorkerState::Stopped => "stopped",
            WorkerState::Failed => "failed",
            WorkerState::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// Counters maintained by the ingestion loop.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkerStats {
    pub frames_delivered: u64,
    pub empty_reads: u64,
    pub read_errors: u64,
    pub sink_errors: u64,
    pub fps: f64,
}

/// Point-in-time view of a worker, as reported to the manager.
#[derive(Clone, Debug)]
pub struct WorkerReport {
    pub id: String,
    pub state: WorkerState,
    pub stats: WorkerStats,
    pub last_error: Option<String>,
}

// ----------------------------------------------------------------------------
// Shared status
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct StatusInner {
    state: WorkerState,
    stats: WorkerStats,
    last_error: Option<String>,
}

#[derive(Debug)]
struct WorkerStatus {
    inner: Mutex<StatusInner>,
}

impl WorkerStatus {
    fn new() -> Self {
        Self {
            inner: Mutex::new(StatusInner {
                state: WorkerState::Idle,
                stats: WorkerStats::default(),
                last_error: None,
            }),
        }
    }

    // A panic inside the loop can poison the lock; the data stays usable.
    fn lock(&self) -> MutexGuard<'_, StatusInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> WorkerState {
        self.lock().state
    }

    fn set_state(&self, state: WorkerState) {
        self.lock().state = state;
    }

    fn fail(&self, state: WorkerState, reason: String) {
        let mut inner = self.lock();
        inner.state = state;
        inner.last_error = Some(reason);
    }

    fn update(&self, f: impl FnOnce(&mut WorkerStats)) {
        f(&mut self.lock().stats);
    }
}

// ----------------------------------------------------------------------------
// CameraWorker
// ----------------------------------------------------------------------------

pub struct CameraWorker {
    camera: CameraConfig,
    id: String,
    source: Arc<dyn StreamSource>,
    sink: Arc<dyn FrameSink>,
    shutdown: Arc<AtomicBool>,
    status: Arc<WorkerStatus>,
    handle: Option<JoinHandle<()>>,
}

impl CameraWorker {
    /// Validate and normalize `camera`, then bind it to a source and sink.
    pub fn new(
        camera: CameraConfig,
        source: Arc<dyn StreamSource>,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Self> {
        camera.validate()?;
        let camera = camera.normalized();
        let id = camera.id();
        Ok(Self {
            camera,
            id,
            source,
            sink,
            shutdown: Arc::new(AtomicBool::new(false)),
            status: Arc::new(WorkerStatus::new()),
            handle: None,
        })
    }

    /// `group_id/camera_id`
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    pub fn state(&self) -> WorkerState {
        self.status.state()
    }

    pub fn stats(&self) -> WorkerStats {
        self.status.lock().stats.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.status.lock().last_error.clone()
    }

    pub fn report(&self) -> WorkerReport {
        let inner = self.status.lock();
        WorkerReport {
            id: self.id.clone(),
            state: inner.state,
            stats: inner.stats.clone(),
            last_error: inner.last_error.clone(),
        }
    }

    /// An ingestion thread was spawned and has not been joined yet.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Open the stream and spawn the ingestion thread.
    ///
    /// Only valid from `Idle`. A connection error moves the worker to
    /// `Failed` and is returned unchanged; there are no retries.
    pub fn start(&mut self) -> Result<()> {
        let state = self.state();
        if state != WorkerState::Idle {
            return Err(anyhow!(
                "camera {} cannot start from state {}",
                self.id,
                state
            ));
        }

        self.status.set_state(WorkerState::Connecting);
        let uri = StreamUri::from_camera(&self.camera);
        log::info!("camera {}: connecting to {}", self.id, uri);

        let connection = match self.source.open(&uri) {
            Ok(connection) => connection,
            Err(err) => {
                log::error!("camera {}: connect to {} failed: {:#}", self.id, uri, err);
                self.status.fail(WorkerState::Failed, format!("{:#}", err));
                return Err(err);
            }
        };

        self.status.set_state(WorkerState::Streaming);
        let ingest = IngestLoop {
            id: self.id.clone(),
            group_id: self.camera.group_id.clone(),
            camera_id: self.camera.camera_id.clone(),
            connection,
            tracker: FrameRateTracker::new(),
            sink: Arc::clone(&self.sink),
            shutdown: Arc::clone(&self.shutdown),
            status: Arc::clone(&self.status),
            sequence: 0,
            failures: 0,
            closed: false,
        };

        let spawned = thread::Builder::new()
            .name(format!("cam:{}", self.id))
            .spawn(move || supervise(ingest));
        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.status
                    .fail(WorkerState::Failed, format!("spawn ingestion thread: {}", err));
                Err(anyhow!(
                    "camera {}: failed to spawn ingestion thread: {}",
                    self.id,
                    err
                ))
            }
        }
    }

    /// Request shutdown. Never blocks; repeated calls are no-ops.
    ///
    /// A worker that was never started goes straight to `Stopped`.
    pub fn stop(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut inner = self.status.lock();
        match inner.state {
            WorkerState::Idle => inner.state = WorkerState::Stopped,
            state if state.is_terminal() => return,
            _ => {}
        }
        log::info!("camera {}: stop requested", self.id);
    }

    /// Wait for the ingestion thread to exit, if one is running.
    pub fn join(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle
            .join()
            .map_err(|_| anyhow!("camera {}: ingestion thread panicked", self.id))
    }

    /// `stop()` followed by `join()`.
    pub fn shutdown(&mut self) -> Result<()> {
        self.stop();
        self.join()
    }
}

impl fmt::Debug for CameraWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraWorker")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for CameraWorker {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("{:#}", err);
        }
    }
}

// ----------------------------------------------------------------------------
// Ingestion loop
// ----------------------------------------------------------------------------

struct IngestLoop {
    id: String,
    group_id: String,
    camera_id: String,
    connection: Box<dyn Connection>,
    tracker: FrameRateTracker,
    sink: Arc<dyn FrameSink>,
    shutdown: Arc<AtomicBool>,
    status: Arc<WorkerStatus>,
    sequence: u64,
    /// Consecutive empty or failed reads since the last delivered frame.
    failures: u64,
    closed: bool,
}

impl IngestLoop {
    /// Runs until shutdown (`Ok`) or until the stream ends (`Err`).
    fn run(mut self) -> Result<()> {
        log::info!("camera {}: streaming", self.id);
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                self.status.set_state(WorkerState::ShuttingDown);
                self.close_connection();
                self.status.set_state(WorkerState::Stopped);
                log::info!(
                    "camera {}: stopped after {} frames",
                    self.id,
                    self.sequence
                );
                return Ok(());
            }

            let started = Instant::now();
            let outcome = self.connection.read();
            let latency = started.elapsed();

            let image = match outcome {
                Ok(ReadOutcome::Frame(image)) => image,
                Ok(ReadOutcome::Empty) => {
                    self.failures += 1;
                    if should_log_failure(self.failures) {
                        log::warn!(
                            "camera {}: received blank frame ({} in a row)",
                            self.id,
                            self.failures
                        );
                    }
                    self.status.update(|stats| stats.empty_reads += 1);
                    continue;
                }
                Ok(ReadOutcome::EndOfStream) => {
                    self.close_connection();
                    return Err(anyhow!("stream ended after {} frames", self.sequence));
                }
                Err(err) => {
                    self.failures += 1;
                    if should_log_failure(self.failures) {
                        log::warn!(
                            "camera {}: read failed ({} in a row): {:#}",
                            self.id,
                            self.failures,
                            err
                        );
                    }
                    self.status.update(|stats| stats.read_errors += 1);
                    continue;
                }
            };

            if self.failures > 0 {
                log::info!(
                    "camera {}: frames resumed after {} failed reads",
                    self.id,
                    self.failures
                );
                self.failures = 0;
            }

            self.tracker.record_duration(latency);
            self.sequence += 1;
            let fps = self.tracker.fps();
            let frame = Frame {
                image,
                group_id: self.group_id.clone(),
                camera_id: self.camera_id.clone(),
                fps,
                sequence: self.sequence,
                latency,
            };
            log::trace!(
                "camera {}: frame #{} latency={:?} fps={:.2}",
                self.id,
                self.sequence,
                latency,
                fps
            );

            let delivered = self.sink.handle(frame);
            if let Err(err) = &delivered {
                log::warn!(
                    "camera {}: failed to process frame #{}: {:#}",
                    self.id,
                    self.sequence,
                    err
                );
            }
            self.status.update(|stats| {
                stats.fps = fps;
                match delivered {
                    Ok(()) => stats.frames_delivered += 1,
                    Err(_) => stats.sink_errors += 1,
                }
            });
        }
    }

    /// Close at most once, whichever exit path gets here first.
    fn close_connection(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.connection.close() {
            log::warn!("camera {}: close failed: {:#}", self.id, err);
        }
    }
}

// Covers unwinding out of `run` and a loop that never got a thread.
impl Drop for IngestLoop {
    fn drop(&mut self) {
        self.close_connection();
    }
}

/// Log the first failure of a streak, then every `FAILURE_LOG_EVERY`th.
fn should_log_failure(consecutive: u64) -> bool {
    consecutive == 1 || consecutive % FAILURE_LOG_EVERY == 0
}

/// Run the loop and classify how it ended.
fn supervise(ingest: IngestLoop) {
    let id = ingest.id.clone();
    let status = Arc::clone(&ingest.status);
    let shutdown = Arc::clone(&ingest.shutdown);

    let reason = match panic::catch_unwind(AssertUnwindSafe(move || ingest.run())) {
        Ok(Ok(())) => return,
        Ok(Err(err)) => format!("{:#}", err),
        Err(payload) => format!("ingestion loop panicked: {}", panic_message(payload.as_ref())),
    };

    if shutdown.load(Ordering::SeqCst) {
        log::info!("camera {}: exited during shutdown: {}", id, reason);
        status.fail(WorkerState::Stopped, reason);
    } else {
        log::error!("camera {}: worker is dead: {}", id, reason);
        status.fail(WorkerState::Dead, reason);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(WorkerState::Stopped.is_terminal());
        assert!(WorkerState::Failed.is_terminal());
        assert!(WorkerState::Dead.is_terminal());
        assert!(!WorkerState::Streaming.is_terminal());
        assert!(!WorkerState::Idle.is_terminal());
    }

    #[test]
    fn failure_streaks_are_logged_sparsely() {
        let logged: Vec<u64> = (1..=350).filter(|n| should_log_failure(*n)).collect();
        assert_eq!(logged, vec![1, 100, 200, 300]);
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }

    #[test]
    fn status_survives_poisoning() {
        let status = Arc::new(WorkerStatus::new());
        let poisoner = Arc::clone(&status);
        let _ = thread::spawn(move || {
            let _guard = poisoner.lock();
            panic!("poison the status lock");
        })
        .join();
        status.set_state(WorkerState::Dead);
        assert_eq!(status.state(), WorkerState::Dead);
    }
}
