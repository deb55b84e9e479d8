//! IP camera ingestion
//!
//! This crate pulls frames from any number of network cameras concurrently and
//! hands each one, with its camera identity and a rolling fps estimate, to a
//! downstream `FrameSink`.
//!
//! # Architecture
//!
//! - One `CameraWorker` per camera, each on its own thread, owning its
//!   connection and `FrameRateTracker` exclusively.
//! - `IngestionManager` starts the workers as a group (rolling back on the
//!   first connection failure) and stops them as a group (joining every
//!   thread before returning).
//! - The protocol layer is a `StreamSource` capability; the crate ships a
//!   synthetic source and, behind `rtsp-gstreamer`, a GStreamer RTSP source.
//!
//! Frames are delivered in read order per camera, with no ordering across
//! cameras. The sink is called synchronously, so a slow sink throttles the
//! camera feeding it rather than dropping frames.
//!
//! # Module Structure
//!
//! - `config`: camera settings, validation, daemon config file loading
//! - `fps`: bounded rolling frame-rate estimate
//! - `frame`: `Image`, `Frame`, `FrameSink`
//! - `source`: `StreamSource` / `Connection` capabilities and backends
//! - `worker`: per-camera state machine and supervised ingestion loop
//! - `manager`: group start/stop

pub mod config;
pub mod fps;
pub mod frame;
pub mod manager;
pub mod source;
pub mod worker;

pub use config::{CameraConfig, IngestConfig, Protocol, SourceKind};
pub use fps::FrameRateTracker;
pub use frame::{Frame, FrameSink, Image};
pub use manager::IngestionManager;
#[cfg(feature = "rtsp-gstreamer")]
pub use source::GstreamerSource;
pub use source::{Connection, ReadOutcome, StreamSource, StreamUri, SyntheticSource};
pub use worker::{CameraWorker, WorkerReport, WorkerState, WorkerStats};
