//! ipcamd - multi-camera ingestion daemon
//!
//! This daemon:
//! 1. Loads camera settings from a JSON or TOML config file
//! 2. Opens every camera through the configured stream source
//! 3. Logs delivered frames and periodic per-camera status
//! 4. Stops all cameras cleanly on Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use ipcam_ingest::{
    Frame, FrameSink, IngestConfig, IngestionManager, SourceKind, StreamSource, SyntheticSource,
    WorkerState,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (.json or .toml).
    #[arg(long, env = "IPCAM_CONFIG")]
    config: PathBuf,
    /// Override the configured stream source (synthetic, gstreamer).
    #[arg(long)]
    source: Option<SourceKind>,
}

/// Logs each frame's metadata; pixels are never logged.
struct LogSink;

impl FrameSink for LogSink {
    fn handle(&self, frame: Frame) -> Result<()> {
        log::debug!(
            "frame {} #{} {}x{} ({} bytes) fps={:.2}",
            frame.camera(),
            frame.sequence,
            frame.image.width,
            frame.image.height,
            frame.image.byte_len(),
            frame.fps
        );
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = IngestConfig::load_from(Some(&args.config))?;
    if let Some(source) = args.source {
        cfg.source = source;
    }

    let source = build_source(&cfg)?;
    let mut manager = IngestionManager::initialize(cfg.cameras.clone(), source, Arc::new(LogSink))?;

    // Installed before any camera connects; a Ctrl-C during a slow start
    // stays queued and is handled as soon as start returns.
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    manager.start()?;
    log::info!(
        "ipcamd running {} cameras via {:?} source",
        manager.len(),
        cfg.source
    );

    wait_for_shutdown(&manager, &rx, cfg.stats_interval);

    log::info!("stopping cameras...");
    manager.stop()?;
    Ok(())
}

/// Log status every `interval` until Ctrl-C or until every worker is dead.
fn wait_for_shutdown(manager: &IngestionManager, shutdown: &Receiver<()>, interval: Duration) {
    loop {
        match shutdown.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                log::info!("shutdown signal received");
                return;
            }
            Err(RecvTimeoutError::Timeout) => log_status(manager),
        }
        if manager
            .reports()
            .iter()
            .all(|report| report.state == WorkerState::Dead)
        {
            log::error!("every camera worker is dead; shutting down");
            return;
        }
    }
}

fn build_source(cfg: &IngestConfig) -> Result<Arc<dyn StreamSource>> {
    match cfg.source {
        SourceKind::Synthetic => Ok(Arc::new(SyntheticSource::new(cfg.synthetic.clone()))),
        #[cfg(feature = "rtsp-gstreamer")]
        SourceKind::Gstreamer => Ok(Arc::new(ipcam_ingest::GstreamerSource::new(
            cfg.gstreamer.clone(),
        )?)),
        #[cfg(not(feature = "rtsp-gstreamer"))]
        SourceKind::Gstreamer => Err(anyhow!(
            "gstreamer source requires the rtsp-gstreamer feature"
        )),
    }
}

fn log_status(manager: &IngestionManager) {
    for report in manager.reports() {
        match report.state {
            WorkerState::Dead => log::error!(
                "camera {} dead: {}",
                report.id,
                report.last_error.as_deref().unwrap_or("unknown")
            ),
            state => log::info!(
                "camera {} state={} frames={} fps={:.2} empty={} read_errors={} sink_errors={}",
                report.id,
                state,
                report.stats.frames_delivered,
                report.stats.fps,
                report.stats.empty_reads,
                report.stats.read_errors,
                report.stats.sink_errors
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipcam_ingest::config::SyntheticSettings;
    use ipcam_ingest::{CameraConfig, Protocol};
    use std::time::Instant;

    #[test]
    fn signal_sent_during_start_is_not_lost() -> Result<()> {
        let source = Arc::new(SyntheticSource::new(SyntheticSettings {
            target_fps: 50,
            width: 4,
            height: 4,
            jitter_ms: 0,
        }));
        let mut manager = IngestionManager::initialize(
            vec![CameraConfig::new(Protocol::Rtsp, "10.0.0.1").with_video_path("front")],
            source,
            Arc::new(LogSink),
        )?;

        let (tx, rx) = mpsc::channel();
        tx.send(())?;
        manager.start()?;

        let started = Instant::now();
        wait_for_shutdown(&manager, &rx, Duration::from_secs(60));
        assert!(started.elapsed() < Duration::from_secs(5));

        manager.stop()?;
        assert!(manager.workers().iter().all(|worker| !worker.is_running()));
        Ok(())
    }
}
