//! GStreamer-backed RTSP source.
//!
//! Pipeline: `rtspsrc ! decodebin ! videoconvert ! video/x-raw,format=RGB ! appsink`.
//! Each pulled sample is copied into an owned `Image` before the GStreamer
//! buffer mapping is released. `open` only succeeds once the pipeline is
//! Playing; an error posted on the bus afterwards ends the stream.

use anyhow::{anyhow, Context, Result};
use std::time::Duration;

use super::{Connection, ReadOutcome, StreamSource, StreamUri};
use crate::config::GstreamerSettings;
use crate::frame::Image;

#[derive(Clone, Debug)]
pub struct GstreamerSource {
    settings: GstreamerSettings,
}

impl GstreamerSource {
    pub fn new(settings: GstreamerSettings) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;
        Ok(Self { settings })
    }
}

impl StreamSource for GstreamerSource {
    fn open(&self, uri: &StreamUri) -> Result<Box<dyn Connection>> {
        let description = format!(
            "rtspsrc location=\"{}\" latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            uri.as_str()
        );
        let connection = GstreamerConnection::launch(&description, &self.settings)
            .with_context(|| format!("connect to {}", uri))?;
        log::info!("GstreamerSource: connected to {}", uri);
        Ok(Box::new(connection))
    }
}

struct GstreamerConnection {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_timeout: Duration,
    ended: bool,
}

impl GstreamerConnection {
    /// Build the pipeline, set it Playing and wait until it gets there.
    ///
    /// `set_state` on a network source usually answers `Async`, so a camera
    /// that refuses the connection only shows up while waiting on the state
    /// change or as an error on the bus.
    fn launch(description: &str, settings: &GstreamerSettings) -> Result<Self> {
        let pipeline = gstreamer::parse::launch(description)
            .context("build pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("pipeline description is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));

        // From here on, Drop returns the pipeline to Null on every error path.
        let connection = Self {
            pipeline,
            appsink,
            frame_timeout: settings.frame_timeout,
            ended: false,
        };
        connection.wait_for_playing(settings.connect_timeout)?;
        Ok(connection)
    }

    fn wait_for_playing(&self, timeout: Duration) -> Result<()> {
        let started = self.pipeline.set_state(gstreamer::State::Playing);
        if let Some(err) = self.pending_bus_error() {
            return Err(err);
        }
        started.context("set pipeline to Playing")?;

        let (result, current, _pending) = self.pipeline.state(clock_time(timeout));
        if let Some(err) = self.pending_bus_error() {
            return Err(err);
        }
        match result {
            Ok(gstreamer::StateChangeSuccess::Async) => Err(anyhow!(
                "pipeline still {:?} after {:?}",
                current,
                timeout
            )),
            Ok(_) => Ok(()),
            Err(_) => Err(anyhow!("pipeline failed to reach Playing (stuck in {:?})", current)),
        }
    }

    fn pending_bus_error(&self) -> Option<anyhow::Error> {
        let bus = self.pipeline.bus()?;
        let message =
            bus.timed_pop_filtered(gstreamer::ClockTime::ZERO, &[gstreamer::MessageType::Error])?;
        match message.view() {
            gstreamer::MessageView::Error(err) => Some(bus_error(&err)),
            _ => None,
        }
    }

    /// Drain pending bus messages. An error ends the stream for good.
    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    log::error!("GstreamerConnection: {}", bus_error(&err));
                    self.ended = true;
                }
                MessageView::Eos(..) => {
                    log::debug!("GstreamerConnection: end of stream on bus");
                }
                _ => {}
            }
        }
    }
}

impl Connection for GstreamerConnection {
    fn read(&mut self) -> Result<ReadOutcome> {
        self.poll_bus();
        if self.ended {
            return Ok(ReadOutcome::EndOfStream);
        }

        // Samples queued before EOS are still delivered.
        let Some(sample) = self.appsink.try_pull_sample(clock_time(self.frame_timeout)) else {
            if self.appsink.is_eos() {
                self.ended = true;
                return Ok(ReadOutcome::EndOfStream);
            }
            return Ok(ReadOutcome::Empty);
        };
        let image = sample_to_image(&sample)?;
        if image.is_empty() {
            return Ok(ReadOutcome::Empty);
        }
        Ok(ReadOutcome::Frame(image))
    }

    fn close(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Null)
            .context("set pipeline to Null")?;
        Ok(())
    }
}

impl Drop for GstreamerConnection {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

fn clock_time(duration: Duration) -> gstreamer::ClockTime {
    gstreamer::ClockTime::from_nseconds(duration.as_nanos() as u64)
}

fn bus_error(err: &gstreamer::message::Error) -> anyhow::Error {
    anyhow!(
        "gstreamer error from {}: {}",
        err.src()
            .map(|src| src.path_string().to_string())
            .unwrap_or_else(|| "pipeline".to_string()),
        err.error()
    )
}

fn sample_to_image(sample: &gstreamer::Sample) -> Result<Image> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok(Image::copy_from(data, width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok(Image::new(pixels, width, height))
}
