use blinkmon_core::{BlinkConfig, TensorLayout, ValueRange};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Daemon configuration.
///
/// Loaded from an optional TOML file named by `BLINKMON_CONFIG`, then
/// overridden by `BLINKMON_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Requested capture size; the driver may negotiate another.
    pub capture_width: u32,
    pub capture_height: u32,
    /// Frames discarded after opening the camera (AGC/AE stabilization).
    pub warmup_frames: usize,
    /// WebSocket endpoint that receives frames and metrics.
    pub endpoint_url: String,
    pub connect_timeout_secs: u64,
    /// Outbound messages that may wait for the socket writer.
    pub outbox_capacity: usize,
    pub jpeg_quality: u8,
    pub blink: BlinkConfig,
    pub series_capacity: usize,
    pub value_range: ValueRange,
    /// Face mesh ONNX model.
    pub model_path: PathBuf,
    pub model_layout: TensorLayout,
    /// Seconds between session summaries in the log; 0 disables them.
    pub stats_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            capture_width: 1280,
            capture_height: 720,
            warmup_frames: 4,
            endpoint_url: "ws://localhost:8000/monitoring/websocket_process".to_string(),
            connect_timeout_secs: 10,
            outbox_capacity: 32,
            jpeg_quality: blinkmon_hw::encode::DEFAULT_JPEG_QUALITY,
            blink: BlinkConfig::default(),
            series_capacity: blinkmon_core::series::DEFAULT_SERIES_CAPACITY,
            value_range: ValueRange::default(),
            model_path: default_model_dir().join("face_landmark.onnx"),
            model_layout: TensorLayout::default(),
            stats_interval_secs: 10,
        }
    }
}

impl Config {
    /// Load the config file (if `BLINKMON_CONFIG` is set) and apply
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("BLINKMON_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `BLINKMON_*` overrides looked up through `lookup`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key);

        if let Some(v) = get("BLINKMON_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = get("BLINKMON_ENDPOINT_URL") {
            self.endpoint_url = v;
        }
        if let Some(v) = get("BLINKMON_MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }

        parse_into(&get, "BLINKMON_CAPTURE_WIDTH", &mut self.capture_width);
        parse_into(&get, "BLINKMON_CAPTURE_HEIGHT", &mut self.capture_height);
        parse_into(&get, "BLINKMON_WARMUP_FRAMES", &mut self.warmup_frames);
        parse_into(
            &get,
            "BLINKMON_CONNECT_TIMEOUT_SECS",
            &mut self.connect_timeout_secs,
        );
        parse_into(&get, "BLINKMON_OUTBOX_CAPACITY", &mut self.outbox_capacity);
        parse_into(&get, "BLINKMON_JPEG_QUALITY", &mut self.jpeg_quality);
        parse_into(&get, "BLINKMON_EAR_THRESHOLD", &mut self.blink.threshold);
        parse_into(
            &get,
            "BLINKMON_MIN_CONSECUTIVE_FRAMES",
            &mut self.blink.min_consecutive_frames,
        );
        parse_into(
            &get,
            "BLINKMON_MAX_CONSECUTIVE_FRAMES",
            &mut self.blink.max_consecutive_frames,
        );
        parse_into(&get, "BLINKMON_SERIES_CAPACITY", &mut self.series_capacity);
        parse_into(
            &get,
            "BLINKMON_STATS_INTERVAL_SECS",
            &mut self.stats_interval_secs,
        );

        match get("BLINKMON_MODEL_LAYOUT").as_deref() {
            Some("nchw") => self.model_layout = TensorLayout::Nchw,
            Some("nhwc") => self.model_layout = TensorLayout::Nhwc,
            Some(other) => tracing::warn!(value = other, "ignoring BLINKMON_MODEL_LAYOUT"),
            None => {}
        }

        match get("BLINKMON_VALUE_RANGE").as_deref() {
            Some("dynamic") => self.value_range = ValueRange::Dynamic,
            Some("fixed") => {
                let (mut min, mut max) = match self.value_range {
                    ValueRange::Fixed { min, max } => (min, max),
                    ValueRange::Dynamic => (-0.1, 0.8),
                };
                parse_into(&get, "BLINKMON_VALUE_RANGE_MIN", &mut min);
                parse_into(&get, "BLINKMON_VALUE_RANGE_MAX", &mut max);
                self.value_range = ValueRange::Fixed { min, max };
            }
            Some(other) => tracing::warn!(value = other, "ignoring BLINKMON_VALUE_RANGE"),
            None => {}
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}

/// `$XDG_DATA_HOME/blinkmon/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("blinkmon/models")
}

fn parse_into<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = get(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable config value"),
    }
}
