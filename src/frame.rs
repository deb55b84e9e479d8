//! Produced frames and the downstream sink capability.
//!
//! - `Image`: immutable, self-contained pixel payload. Clones share the same
//!   allocation; nothing can write through it once built.
//! - `Frame`: one delivered frame plus camera identity and the fps estimate.
//! - `FrameSink`: the consumer every camera worker pushes frames into.
//!
//! A worker builds a fresh `Image` for every read, so a sink may keep frames
//! for as long as it likes without racing the next decode.

use anyhow::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// ----------------------------------------------------------------------------
// Image: owned pixel payload
// ----------------------------------------------------------------------------

/// Decoded pixels for one frame (packed RGB24 for the built-in sources).
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
}

impl Image {
    /// Take ownership of a decoded buffer.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data: data.into(),
            width,
            height,
        }
    }

    /// Copy pixels out of a buffer the caller will reuse.
    pub fn copy_from(data: &[u8], width: u32, height: u32) -> Self {
        Self {
            data: Arc::from(data),
            width,
            height,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// Pixel bytes are never written to logs.
impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Frame: what the sink receives
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Frame {
    pub image: Image,
    pub group_id: String,
    pub camera_id: String,
    /// Rolling fps estimate at the time this frame was read.
    pub fps: f64,
    /// 1-based position of this frame in the camera's delivered stream.
    pub sequence: u64,
    /// How long the read that produced this frame took.
    pub latency: Duration,
}

impl Frame {
    /// `group_id/camera_id`
    pub fn camera(&self) -> String {
        format!("{}/{}", self.group_id, self.camera_id)
    }
}

// ----------------------------------------------------------------------------
// FrameSink: downstream consumer
// ----------------------------------------------------------------------------

/// Receives frames from camera workers.
///
/// Called synchronously from every camera's ingestion thread, so
/// implementations must tolerate concurrent calls. A returned error is logged
/// by the worker and never stops the stream.
pub trait FrameSink: Send + Sync {
    fn handle(&self, frame: Frame) -> Result<()>;
}

impl<F> FrameSink for F
where
    F: Fn(Frame) -> Result<()> + Send + Sync,
{
    fn handle(&self, frame: Frame) -> Result<()> {
        self(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn copied_image_is_independent_of_source_buffer() {
        let mut buffer = vec![1u8, 2, 3, 4];
        let image = Image::copy_from(&buffer, 2, 2);
        buffer.iter_mut().for_each(|b| *b = 0);
        assert_eq!(image.data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn image_clones_share_contents() {
        let image = Image::new(vec![9u8; 12], 2, 2);
        let clone = image.clone();
        assert_eq!(image, clone);
        assert_eq!(clone.byte_len(), 12);
    }

    #[test]
    fn image_debug_omits_pixels() {
        let image = Image::new(vec![7u8; 3], 1, 1);
        let rendered = format!("{:?}", image);
        assert!(rendered.contains("bytes: 3"));
        assert!(!rendered.contains("[7"));
    }

    #[test]
    fn closures_act_as_sinks() -> Result<()> {
        let seen = Mutex::new(Vec::new());
        let sink = |frame: Frame| -> Result<()> {
            seen.lock().unwrap().push(frame.camera());
            Ok(())
        };
        sink.handle(Frame {
            image: Image::new(Vec::new(), 0, 0),
            group_id: "g".to_string(),
            camera_id: "c".to_string(),
            fps: 0.0,
            sequence: 1,
            latency: Duration::ZERO,
        })?;
        assert_eq!(seen.into_inner().unwrap(), vec!["g/c".to_string()]);
        Ok(())
    }
}
