//! Synthetic stream source.
//!
//! Produces generated RGB frames at a fixed rate without touching the network.
//! Used by `ipcamd` when no real backend is configured and by tests.

use anyhow::Result;
use rand::Rng;
use std::time::Duration;

use super::{Connection, ReadOutcome, StreamSource, StreamUri};
use crate::config::SyntheticSettings;
use crate::frame::Image;

/// Opens synthetic connections; every URI succeeds.
#[derive(Clone, Debug)]
pub struct SyntheticSource {
    settings: SyntheticSettings,
}

impl SyntheticSource {
    pub fn new(settings: SyntheticSettings) -> Self {
        Self { settings }
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new(SyntheticSettings::default())
    }
}

impl StreamSource for SyntheticSource {
    fn open(&self, uri: &StreamUri) -> Result<Box<dyn Connection>> {
        log::info!("SyntheticSource: connected to {}", uri);
        Ok(Box::new(SyntheticConnection::new(self.settings.clone())))
    }
}

struct SyntheticConnection {
    settings: SyntheticSettings,
    frame_count: u64,
    /// Simulated scene state, bumped periodically to vary the pattern.
    scene_state: u8,
    closed: bool,
}

impl SyntheticConnection {
    fn new(settings: SyntheticSettings) -> Self {
        Self {
            settings,
            frame_count: 0,
            scene_state: 0,
            closed: false,
        }
    }

    fn frame_interval(&self) -> Duration {
        let base = Duration::from_secs(1) / self.settings.target_fps.max(1);
        if self.settings.jitter_ms == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=self.settings.jitter_ms);
        base + Duration::from_millis(jitter)
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.settings.width as usize) * (self.settings.height as usize) * 3;

        if self.frame_count.is_multiple_of(50) {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl Connection for SyntheticConnection {
    fn read(&mut self) -> Result<ReadOutcome> {
        if self.closed {
            return Ok(ReadOutcome::EndOfStream);
        }
        std::thread::sleep(self.frame_interval());
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Ok(ReadOutcome::Frame(Image::new(
            pixels,
            self.settings.width,
            self.settings.height,
        )))
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        log::debug!(
            "SyntheticSource: closed after {} frames",
            self.frame_count
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraConfig, Protocol};

    fn small_settings() -> SyntheticSettings {
        SyntheticSettings {
            target_fps: 200,
            width: 4,
            height: 2,
            jitter_ms: 0,
        }
    }

    fn uri() -> StreamUri {
        StreamUri::from_camera(&CameraConfig::new(Protocol::Rtsp, "stub").with_video_path("1"))
    }

    #[test]
    fn synthetic_source_produces_sized_frames() -> Result<()> {
        let source = SyntheticSource::new(small_settings());
        let mut connection = source.open(&uri())?;
        match connection.read()? {
            ReadOutcome::Frame(image) => {
                assert_eq!(image.width, 4);
                assert_eq!(image.height, 2);
                assert_eq!(image.byte_len(), 4 * 2 * 3);
            }
            other => panic!("expected a frame, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn consecutive_frames_differ() -> Result<()> {
        let source = SyntheticSource::new(small_settings());
        let mut connection = source.open(&uri())?;
        let (ReadOutcome::Frame(first), ReadOutcome::Frame(second)) =
            (connection.read()?, connection.read()?)
        else {
            panic!("expected two frames");
        };
        assert_ne!(first.data(), second.data());
        Ok(())
    }

    #[test]
    fn closed_connection_reports_end_of_stream() -> Result<()> {
        let source = SyntheticSource::new(small_settings());
        let mut connection = source.open(&uri())?;
        connection.close()?;
        assert!(matches!(connection.read()?, ReadOutcome::EndOfStream));
        Ok(())
    }
}
