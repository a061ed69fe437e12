//! Configuration management for the monitor service.
//!
//! Configuration is layered from configuration files and environment
//! variables, then validated before any component is built from it.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the monitor service.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// HTTP / WebSocket server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// UDP camera listener configuration
    #[serde(default)]
    pub udp: UdpConfig,

    /// Static source address to camera name table, as `[[cameras]]` entries.
    /// IPs are not used as keys since the config layer splits keys on dots.
    #[serde(default)]
    pub cameras: Vec<CameraEntry>,

    /// Compact camera table, `ip:name,ip:name` (convenient for env vars)
    #[serde(default)]
    pub cameras_list: Option<String>,

    /// Dispatcher and worker pool configuration
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Detector configuration
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Frame buffer configuration
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Metadata database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics exporter configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// HTTP / WebSocket server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP server binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Interval between keepalive pings on WebSocket connections
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// A WebSocket connection silent for this long is considered gone
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Outbound messages queued per viewer. A viewer whose queue is full
    /// when a frame arrives is disconnected, so this is the number of frames
    /// a slow viewer may fall behind before it is cut off.
    #[serde(default = "default_viewer_queue_size")]
    pub viewer_queue_size: usize,
}

/// UDP camera listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UdpConfig {
    /// Whether to listen for UDP cameras at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address the UDP socket binds to
    #[serde(default = "default_udp_bind_address")]
    pub bind_address: String,

    /// Receive buffer size for a single datagram
    #[serde(default = "default_datagram_size")]
    pub datagram_size: usize,

    /// Largest frame the assembler accumulates before resetting
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

/// One entry of the camera table.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CameraEntry {
    /// Source IP address of the camera
    pub address: String,

    /// Human readable camera name
    pub name: String,
}

/// Dispatcher and worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// Number of detection workers, each with its own detector
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Capacity of the detection task queue
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Only every Nth frame per camera is offered to the motion gate
    #[serde(default = "default_process_every_nth")]
    pub process_every_nth: u64,
}

/// Detector configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Per-pixel grayscale difference counted as changed
    #[serde(default = "default_motion_pixel_threshold")]
    pub motion_pixel_threshold: u8,

    /// Changed pixel count above which a frame has motion
    #[serde(default = "default_motion_min_changed_pixels")]
    pub motion_min_changed_pixels: u64,

    /// Minimum confidence for object detections
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,

    /// YOLOv8 ONNX model; without one, workers find no objects
    #[serde(default)]
    pub model_path: Option<PathBuf>,

    /// Square input resolution the model was exported with
    #[serde(default = "default_model_input_size")]
    pub model_input_size: u32,

    /// Overlap above which the weaker of two boxes is discarded
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,

    /// Class names indexed by class id; built-in names are used when empty
    #[serde(default)]
    pub class_labels: Vec<String>,
}

/// Frame buffer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// Directory flushed images are written to
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,

    /// Frames a single camera may hold between flushes
    #[serde(default = "default_per_camera_limit")]
    pub per_camera_limit: usize,

    /// Interval between periodic flushes in seconds
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

/// Metadata database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL; no database is used when unset
    #[serde(default = "default_database_url")]
    pub url: Option<String>,

    /// Maximum number of pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Prometheus exporter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Install the exporter
    #[serde(default)]
    pub enabled: bool,

    /// Port for the exporter's HTTP listener
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_ping_interval_secs() -> u64 {
    20
}
fn default_read_timeout_secs() -> u64 {
    60
}
fn default_viewer_queue_size() -> usize {
    32
}
fn default_udp_bind_address() -> String {
    "0.0.0.0:81".to_string()
}
fn default_datagram_size() -> usize {
    2048
}
fn default_max_frame_bytes() -> usize {
    4 * 1024 * 1024
}
fn default_num_workers() -> usize {
    4
}
fn default_queue_size() -> usize {
    100
}
fn default_process_every_nth() -> u64 {
    1
}
fn default_motion_pixel_threshold() -> u8 {
    30
}
fn default_motion_min_changed_pixels() -> u64 {
    500
}
fn default_min_confidence() -> f32 {
    0.6
}
fn default_model_input_size() -> u32 {
    640
}
fn default_iou_threshold() -> f32 {
    0.45
}
fn default_image_dir() -> PathBuf {
    PathBuf::from("./static/images")
}
fn default_per_camera_limit() -> usize {
    10
}
fn default_flush_interval_secs() -> u64 {
    30
}
fn default_database_url() -> Option<String> {
    Some("sqlite://data/images.db".to_string())
}
fn default_max_connections() -> u32 {
    1
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}
fn default_metrics_port() -> u16 {
    9090
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            ping_interval_secs: default_ping_interval_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            viewer_queue_size: default_viewer_queue_size(),
        }
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_udp_bind_address(),
            datagram_size: default_datagram_size(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            queue_size: default_queue_size(),
            process_every_nth: default_process_every_nth(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            motion_pixel_threshold: default_motion_pixel_threshold(),
            motion_min_changed_pixels: default_motion_min_changed_pixels(),
            min_confidence: default_min_confidence(),
            model_path: None,
            model_input_size: default_model_input_size(),
            iou_threshold: default_iou_threshold(),
            class_labels: Vec::new(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            image_dir: default_image_dir(),
            per_camera_limit: default_per_camera_limit(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            run_migrations: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with WATCHPOST_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g. WATCHPOST_BUFFER__FLUSH_INTERVAL_SECS=10
            .add_source(
                Environment::with_prefix("WATCHPOST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("WATCHPOST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        self.server
            .bind_address
            .parse::<SocketAddr>()
            .map_err(|e| ConfigValidationError::InvalidValue {
                field: "server.bind_address".to_string(),
                message: e.to_string(),
            })?;

        if self.server.viewer_queue_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "server.viewer_queue_size".to_string(),
                message: "Viewer queue must hold at least one message".to_string(),
            });
        }

        if self.server.read_timeout_secs <= self.server.ping_interval_secs {
            return Err(ConfigValidationError::InvalidValue {
                field: "server.read_timeout_secs".to_string(),
                message: "Read timeout must be longer than the ping interval".to_string(),
            });
        }

        if self.udp.enabled {
            self.udp
                .bind_address
                .parse::<SocketAddr>()
                .map_err(|e| ConfigValidationError::InvalidValue {
                    field: "udp.bind_address".to_string(),
                    message: e.to_string(),
                })?;

            if self.udp.datagram_size == 0 {
                return Err(ConfigValidationError::InvalidValue {
                    field: "udp.datagram_size".to_string(),
                    message: "Datagram size must be greater than 0".to_string(),
                });
            }

            if self.udp.max_frame_bytes < self.udp.datagram_size {
                return Err(ConfigValidationError::InvalidValue {
                    field: "udp.max_frame_bytes".to_string(),
                    message: "Frame limit must be at least one datagram".to_string(),
                });
            }
        }

        if self.processing.num_workers == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "processing.num_workers".to_string(),
                message: "At least one worker is required".to_string(),
            });
        }

        if self.processing.queue_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "processing.queue_size".to_string(),
                message: "Queue size must be greater than 0".to_string(),
            });
        }

        if self.processing.process_every_nth == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "processing.process_every_nth".to_string(),
                message: "Interval must be at least 1".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.detector.min_confidence) {
            return Err(ConfigValidationError::InvalidValue {
                field: "detector.min_confidence".to_string(),
                message: "Confidence must be within [0, 1]".to_string(),
            });
        }

        if self.detector.model_input_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "detector.model_input_size".to_string(),
                message: "Input size must be greater than 0".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.detector.iou_threshold) {
            return Err(ConfigValidationError::InvalidValue {
                field: "detector.iou_threshold".to_string(),
                message: "Overlap threshold must be within [0, 1]".to_string(),
            });
        }

        if self.buffer.image_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "buffer.image_dir".to_string(),
            ));
        }

        if self.buffer.per_camera_limit == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "buffer.per_camera_limit".to_string(),
                message: "Limit must be greater than 0".to_string(),
            });
        }

        if self.buffer.flush_interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "buffer.flush_interval_secs".to_string(),
                message: "Flush interval must be greater than 0".to_string(),
            });
        }

        for entry in &self.cameras {
            if entry.address.is_empty() || entry.name.is_empty() {
                return Err(ConfigValidationError::MissingField(
                    "cameras[].address/name".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// All configured cameras, table entries first, then the compact list.
    pub fn camera_entries(&self) -> Vec<CameraEntry> {
        let mut entries = self.cameras.clone();
        if let Some(list) = &self.cameras_list {
            entries.extend(parse_camera_list(list));
        }
        entries
    }
}

/// Parse the compact `ip:name,ip:name` camera table.
///
/// Pairs that do not split into exactly two non-empty parts are skipped.
pub fn parse_camera_list(list: &str) -> Vec<CameraEntry> {
    list.split(',')
        .filter_map(|pair| {
            let parts: Vec<&str> = pair.trim().split(':').collect();
            match parts.as_slice() {
                [address, name] if !address.trim().is_empty() && !name.trim().is_empty() => {
                    Some(CameraEntry {
                        address: address.trim().to_string(),
                        name: name.trim().to_string(),
                    })
                }
                _ => None,
            }
        })
        .collect()
}

impl ServerConfig {
    /// Get keepalive ping interval as Duration.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Get read deadline as Duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl BufferConfig {
    /// Get flush interval as Duration.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> MonitorConfig {
        MonitorConfig {
            server: ServerConfig::default(),
            udp: UdpConfig::default(),
            cameras: vec![CameraEntry {
                address: "192.168.1.29".to_string(),
                name: "brama".to_string(),
            }],
            cameras_list: None,
            processing: ProcessingConfig::default(),
            detector: DetectorConfig::default(),
            buffer: BufferConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = create_test_config();
        config.processing.num_workers = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_per_camera_limit_rejected() {
        let mut config = create_test_config();
        config.buffer.per_camera_limit = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_frame_limit_below_datagram_rejected() {
        let mut config = create_test_config();
        config.udp.max_frame_bytes = 100;
        config.udp.datagram_size = 2048;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_bind_address() {
        let mut config = create_test_config();
        config.server.bind_address = "not-an-address".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_read_timeout_must_exceed_ping_interval() {
        let mut config = create_test_config();
        config.server.ping_interval_secs = 30;
        config.server.read_timeout_secs = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_detector_defaults() {
        let detector = DetectorConfig::default();
        assert_eq!(detector.model_input_size, 640);
        assert!(detector.model_path.is_none());
        assert!(detector.class_labels.is_empty());
    }

    #[test]
    fn test_invalid_iou_threshold_rejected() {
        let mut config = create_test_config();
        config.detector.iou_threshold = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_camera_table_from_toml() {
        let config: MonitorConfig = Config::builder()
            .add_source(File::from_str(
                r#"
                [[cameras]]
                address = "192.168.1.29"
                name = "brama"

                [[cameras]]
                address = "192.168.1.32"
                name = "drzwi"
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.cameras.len(), 2);
        assert_eq!(config.cameras[0].address, "192.168.1.29");
        assert_eq!(config.cameras[1].name, "drzwi");
        assert_eq!(config.server.viewer_queue_size, 32);
    }

    #[test]
    fn test_parse_camera_list() {
        let entries = parse_camera_list("192.168.1.32:drzwi, 192.168.1.29 : brama,broken,:x");
        assert_eq!(
            entries,
            vec![
                CameraEntry {
                    address: "192.168.1.32".to_string(),
                    name: "drzwi".to_string(),
                },
                CameraEntry {
                    address: "192.168.1.29".to_string(),
                    name: "brama".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_camera_entries_merges_compact_list() {
        let mut config = create_test_config();
        config.cameras_list = Some("10.0.0.5:garaz".to_string());
        let entries = config.camera_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].name, "garaz");
    }
}
