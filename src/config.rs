use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SYNTHETIC_FPS: u32 = 10;
const DEFAULT_SYNTHETIC_WIDTH: u32 = 640;
const DEFAULT_SYNTHETIC_HEIGHT: u32 = 480;
const DEFAULT_FRAME_TIMEOUT_MS: u64 = 500;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_STATS_INTERVAL_SECS: u64 = 5;

// -------------------- Per-camera settings --------------------

/// Streaming protocol a camera speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum Protocol {
    Rtsp,
    Onvif,
}

impl Protocol {
    /// URI scheme used to reach the camera's media stream.
    ///
    /// ONVIF devices publish their media over RTSP, so both map to `rtsp`.
    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Rtsp | Protocol::Onvif => "rtsp",
        }
    }
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            // RSTP is the historical spelling some deployments still carry.
            "RTSP" | "RSTP" => Ok(Protocol::Rtsp),
            "ONVIF" => Ok(Protocol::Onvif),
            other => Err(anyhow!(
                "unsupported protocol '{}'; expected RTSP or ONVIF",
                other
            )),
        }
    }
}

impl TryFrom<String> for Protocol {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Rtsp => f.write_str("RTSP"),
            Protocol::Onvif => f.write_str("ONVIF"),
        }
    }
}

/// Settings for a single camera.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraConfig {
    pub protocol: Protocol,
    pub host: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, alias = "videoUri")]
    pub video_path: String,
    /// Defaults to `host` when empty.
    #[serde(default)]
    pub group_id: String,
    /// Defaults to `video_path` when empty.
    #[serde(default)]
    pub camera_id: String,
}

impl CameraConfig {
    pub fn new(protocol: Protocol, host: impl Into<String>) -> Self {
        Self {
            protocol,
            host: host.into(),
            user: String::new(),
            password: String::new(),
            video_path: String::new(),
            group_id: String::new(),
            camera_id: String::new(),
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_video_path(mut self, video_path: impl Into<String>) -> Self {
        self.video_path = video_path.into();
        self
    }

    pub fn with_ids(mut self, group_id: impl Into<String>, camera_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self.camera_id = camera_id.into();
        self
    }

    /// Check required fields. `protocol` is already constrained by its type.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("camera host is required"));
        }
        if self.host.contains('/') || self.host.contains('@') {
            return Err(anyhow!(
                "camera host '{}' must be a bare host[:port] without path or credentials",
                self.host
            ));
        }
        Ok(())
    }

    /// Fill empty `group_id` / `camera_id` from `host` / `video_path`.
    pub fn normalized(mut self) -> Self {
        if self.group_id.is_empty() {
            self.group_id = self.host.clone();
        }
        if self.camera_id.is_empty() {
            self.camera_id = self.video_path.clone();
        }
        self
    }

    /// Worker identity, `group_id/camera_id`.
    pub fn id(&self) -> String {
        format!("{}/{}", self.group_id, self.camera_id)
    }
}

// -------------------- Daemon settings --------------------

/// Stream source backend the daemon opens cameras with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Synthetic,
    Gstreamer,
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "synthetic" | "stub" => Ok(SourceKind::Synthetic),
            "gstreamer" => Ok(SourceKind::Gstreamer),
            other => Err(anyhow!(
                "unknown source '{}'; expected synthetic or gstreamer",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct IngestConfigFile {
    source: Option<String>,
    synthetic: Option<SyntheticConfigFile>,
    gstreamer: Option<GstreamerConfigFile>,
    cameras: Option<Vec<CameraConfig>>,
    stats_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SyntheticConfigFile {
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    jitter_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct GstreamerConfigFile {
    frame_timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub source: SourceKind,
    pub synthetic: SyntheticSettings,
    pub gstreamer: GstreamerSettings,
    pub cameras: Vec<CameraConfig>,
    pub stats_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticSettings {
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    pub jitter_ms: u64,
}

impl Default for SyntheticSettings {
    fn default() -> Self {
        Self {
            target_fps: DEFAULT_SYNTHETIC_FPS,
            width: DEFAULT_SYNTHETIC_WIDTH,
            height: DEFAULT_SYNTHETIC_HEIGHT,
            jitter_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GstreamerSettings {
    /// How long one read waits for a decoded sample before reporting `Empty`.
    pub frame_timeout: Duration,
    /// How long `open` waits for the pipeline to reach Playing.
    pub connect_timeout: Duration,
}

impl Default for GstreamerSettings {
    fn default() -> Self {
        Self {
            frame_timeout: Duration::from_millis(DEFAULT_FRAME_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }
}

impl IngestConfig {
    /// Load from the file named by `IPCAM_CONFIG`, then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("IPCAM_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => IngestConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: IngestConfigFile) -> Result<Self> {
        let source = match file.source.as_deref() {
            Some(source) => source.parse()?,
            None => SourceKind::Synthetic,
        };
        let synthetic_file = file.synthetic.unwrap_or_default();
        let defaults = SyntheticSettings::default();
        let synthetic = SyntheticSettings {
            target_fps: synthetic_file.target_fps.unwrap_or(defaults.target_fps),
            width: synthetic_file.width.unwrap_or(defaults.width),
            height: synthetic_file.height.unwrap_or(defaults.height),
            jitter_ms: synthetic_file.jitter_ms.unwrap_or(defaults.jitter_ms),
        };
        let gstreamer_file = file.gstreamer.unwrap_or_default();
        let gstreamer = GstreamerSettings {
            frame_timeout: Duration::from_millis(
                gstreamer_file
                    .frame_timeout_ms
                    .unwrap_or(DEFAULT_FRAME_TIMEOUT_MS),
            ),
            connect_timeout: Duration::from_millis(
                gstreamer_file
                    .connect_timeout_ms
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            ),
        };
        Ok(Self {
            source,
            synthetic,
            gstreamer,
            cameras: file.cameras.unwrap_or_default(),
            stats_interval: Duration::from_secs(
                file.stats_interval_secs
                    .unwrap_or(DEFAULT_STATS_INTERVAL_SECS),
            ),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(source) = std::env::var("IPCAM_SOURCE") {
            if !source.trim().is_empty() {
                self.source = source.parse()?;
            }
        }
        if let Ok(fps) = std::env::var("IPCAM_SYNTHETIC_FPS") {
            self.synthetic.target_fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("IPCAM_SYNTHETIC_FPS must be an integer"))?;
        }
        if let Ok(interval) = std::env::var("IPCAM_STATS_INTERVAL_SECS") {
            let seconds: u64 = interval.trim().parse().map_err(|_| {
                anyhow!("IPCAM_STATS_INTERVAL_SECS must be an integer number of seconds")
            })?;
            self.stats_interval = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(anyhow!("no cameras configured"));
        }
        for (index, camera) in self.cameras.iter().enumerate() {
            camera
                .validate()
                .with_context(|| format!("camera #{} is invalid", index))?;
        }
        if self.synthetic.target_fps == 0 {
            return Err(anyhow!("synthetic target_fps must be >= 1"));
        }
        if self.stats_interval.is_zero() {
            return Err(anyhow!("stats interval must be greater than zero"));
        }
        if self.gstreamer.connect_timeout.is_zero() {
            return Err(anyhow!("gstreamer connect_timeout_ms must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<IngestConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
