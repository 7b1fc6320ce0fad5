use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG_PATH: &str = "config.toml";
const CONFIG_PATH_ENV: &str = "TRAFCAM_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("traffic thresholds out of order: fluid_below={fluid_below} saturated_at={saturated_at}")]
    InvalidThresholds { fluid_below: u32, saturated_at: u32 },
    #[error("invalid setting {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },
}

fn default_http_port() -> u16 {
    8000
}

fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
            cors_origins: default_cors_origins(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("traffic.db")
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_video_dir() -> PathBuf {
    PathBuf::from("video_test")
}

fn default_video_extensions() -> Vec<String> {
    vec!["mp4".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoConfig {
    #[serde(default = "default_video_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_video_extensions")]
    pub extensions: Vec<String>,
    /// File inside `directory` activated at boot.
    #[serde(default)]
    pub startup: Option<String>,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            directory: default_video_dir(),
            extensions: default_video_extensions(),
            startup: None,
        }
    }
}

fn default_open_timeout_ms() -> u64 {
    10_000
}

fn default_first_frame_timeout_ms() -> u64 {
    15_000
}

fn default_reconnect_base_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    10_000
}

fn default_max_reconnects_per_minute() -> u32 {
    10
}

fn default_frame_stride() -> u32 {
    2
}

fn default_live_width() -> i32 {
    640
}

fn default_live_height() -> i32 {
    360
}

fn default_file_width() -> i32 {
    960
}

fn default_file_height() -> i32 {
    540
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    #[serde(default = "default_first_frame_timeout_ms")]
    pub first_frame_timeout_ms: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_max_reconnects_per_minute")]
    pub max_reconnects_per_minute: u32,
    #[serde(default = "default_frame_stride")]
    pub frame_stride: u32,
    #[serde(default = "default_live_width")]
    pub live_width: i32,
    #[serde(default = "default_live_height")]
    pub live_height: i32,
    #[serde(default = "default_file_width")]
    pub file_width: i32,
    #[serde(default = "default_file_height")]
    pub file_height: i32,
}

impl SourceConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn first_frame_timeout(&self) -> Duration {
        Duration::from_millis(self.first_frame_timeout_ms)
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            open_timeout_ms: default_open_timeout_ms(),
            first_frame_timeout_ms: default_first_frame_timeout_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_reconnects_per_minute: default_max_reconnects_per_minute(),
            frame_stride: default_frame_stride(),
            live_width: default_live_width(),
            live_height: default_live_height(),
            file_width: default_file_width(),
            file_height: default_file_height(),
        }
    }
}

fn default_model_path() -> String {
    "models/traffic.onnx".to_string()
}

fn default_confidence_threshold() -> f32 {
    0.35
}

fn default_nms_iou() -> f32 {
    0.5
}

fn default_intra_threads() -> usize {
    4
}

/// How raw model class ids map onto the six tracked classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassMap {
    /// Model trained on exactly Person, Bicycle, Car, Motorcycle, Bus, Truck (ids 0..=5).
    #[default]
    Traffic,
    /// Stock COCO-80 model.
    Coco,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_model_path")]
    pub model_path: String,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_nms_iou")]
    pub nms_iou: f32,
    #[serde(default)]
    pub class_map: ClassMap,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            confidence_threshold: default_confidence_threshold(),
            nms_iou: default_nms_iou(),
            class_map: ClassMap::default(),
            intra_threads: default_intra_threads(),
        }
    }
}

fn default_tracker_iou() -> f32 {
    0.3
}

fn default_max_missed() -> u32 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_tracker_iou")]
    pub iou_threshold: f32,
    #[serde(default = "default_max_missed")]
    pub max_missed: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: default_tracker_iou(),
            max_missed: default_max_missed(),
        }
    }
}

fn default_fluid_below() -> u32 {
    5
}

fn default_saturated_at() -> u32 {
    15
}

fn default_fps_smoothing() -> f64 {
    0.1
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrafficConfig {
    #[serde(default = "default_fluid_below")]
    pub fluid_below: u32,
    #[serde(default = "default_saturated_at")]
    pub saturated_at: u32,
    #[serde(default = "default_fps_smoothing")]
    pub fps_smoothing: f64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            fluid_below: default_fluid_below(),
            saturated_at: default_saturated_at(),
            fps_smoothing: default_fps_smoothing(),
        }
    }
}

fn default_jpeg_quality() -> i32 {
    60
}

fn default_boundary() -> String {
    "frame".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: i32,
    #[serde(default = "default_boundary")]
    pub boundary: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: default_jpeg_quality(),
            boundary: default_boundary(),
        }
    }
}

fn default_subscriber_queue() -> usize {
    32
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            subscriber_queue: default_subscriber_queue(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub videos: VideoConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub traffic: TrafficConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
}

impl Config {
    /// Loads from `$TRAFCAM_CONFIG`, falling back to `config.toml`. A missing
    /// default file yields the built-in defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load_from(path),
            Err(_) if !Path::new(DEFAULT_CONFIG_PATH).exists() => {
                tracing::warn!("{} not found, using defaults", DEFAULT_CONFIG_PATH);
                let config = Config::default();
                config.validate()?;
                Ok(config)
            }
            Err(_) => Self::load_from(DEFAULT_CONFIG_PATH),
        }
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.traffic.fluid_below > self.traffic.saturated_at {
            return Err(ConfigError::InvalidThresholds {
                fluid_below: self.traffic.fluid_below,
                saturated_at: self.traffic.saturated_at,
            });
        }
        if !(self.traffic.fps_smoothing > 0.0 && self.traffic.fps_smoothing <= 1.0) {
            return Err(ConfigError::InvalidSetting {
                key: "traffic.fps_smoothing",
                reason: format!("{} is not in (0, 1]", self.traffic.fps_smoothing),
            });
        }
        if self.source.frame_stride == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "source.frame_stride",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(ConfigError::InvalidSetting {
                key: "stream.jpeg_quality",
                reason: format!("{} is not in 1..=100", self.stream.jpeg_quality),
            });
        }
        if self.broadcast.subscriber_queue == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "broadcast.subscriber_queue",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
