//! Logship Configuration
//!
//! This module provides configuration structures for the log shipping
//! pipeline: bucketing, the local disk writer, the replicating client and the
//! collector server.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::bucket::TimeBucketer;

/// Main Logship configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogshipConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Time bucket configuration
    #[serde(default)]
    pub bucket: BucketConfig,

    /// Local disk writer configuration
    #[serde(default)]
    pub disk: DiskConfig,

    /// Replicating client configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Collector server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Hostname written into rows and filenames
    pub hostname: String,

    /// Data directory for control state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Time bucket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Buckets per hour; must evenly divide 60
    #[serde(default = "default_buckets_per_hour")]
    pub buckets_per_hour: u32,
}

/// File compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
    Lz4,
}

impl Compression {
    /// File extension including the compression suffix
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::None => "log",
            Compression::Gzip => "log.gz",
            Compression::Lz4 => "log.lz4",
        }
    }
}

/// What the logger does with a row for a backend that reports unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnavailablePolicy {
    /// Write anyway; the row may be lost if the disk really fills up
    Write,
    /// Skip the backend and count the row as dropped
    Drop,
}

/// Local disk writer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Write rows to local disk
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Root directory for log files
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Filename pattern with `{VAR}` placeholders
    #[serde(default = "default_filename_pattern")]
    pub filename_pattern: String,

    /// File compression
    #[serde(default = "default_compression")]
    pub compression: Compression,

    /// Minimum free bytes on the log volume before reporting unavailable
    #[serde(default = "default_required_free_space")]
    pub required_free_space_bytes: u64,

    /// Version number rendered into `LOG_VERSION`
    #[serde(default = "default_log_version")]
    pub log_version: u32,

    /// Environment variable that supplies `REGION`
    #[serde(default = "default_region_env")]
    pub region_env: String,

    /// Behaviour when a backend reports unavailable
    #[serde(default = "default_on_unavailable")]
    pub on_unavailable: UnavailablePolicy,
}

/// Replicating client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Ship rows to a remote collector
    #[serde(default)]
    pub enabled: bool,

    /// Collector address (host:port)
    #[serde(default = "default_collector_address")]
    pub collector_address: String,

    /// Maximum buffered payload bytes before rows are dropped
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity_bytes: usize,

    /// Background flush interval in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Collector server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to accept client connections on
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Durable cursor file (defaults to `<data_dir>/control.json`)
    #[serde(default)]
    pub control_state_path: Option<PathBuf>,

    /// Client sessions remembered in the cursor file
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/logship")
}

fn default_buckets_per_hour() -> u32 {
    12
}

fn default_true() -> bool {
    true
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/var/log/logship")
}

fn default_filename_pattern() -> String {
    "{LOG_TYPE}-{LOG_VERSION}-{CLIENT_HOST}".to_string()
}

fn default_compression() -> Compression {
    Compression::Gzip
}

fn default_required_free_space() -> u64 {
    1024 * 1024 * 1024
}

fn default_log_version() -> u32 {
    1
}

fn default_region_env() -> String {
    "REGION".to_string()
}

fn default_on_unavailable() -> UnavailablePolicy {
    UnavailablePolicy::Write
}

fn default_collector_address() -> String {
    "127.0.0.1:7411".to_string()
}

fn default_buffer_capacity() -> usize {
    64 * 1024 * 1024
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    30000
}

fn default_bind_address() -> String {
    "0.0.0.0:7411".to_string()
}

fn default_max_sessions() -> usize {
    4096
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            buckets_per_hour: default_buckets_per_hour(),
        }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_dir: default_base_dir(),
            filename_pattern: default_filename_pattern(),
            compression: default_compression(),
            required_free_space_bytes: default_required_free_space(),
            log_version: default_log_version(),
            region_env: default_region_env(),
            on_unavailable: default_on_unavailable(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            collector_address: default_collector_address(),
            buffer_capacity_bytes: default_buffer_capacity(),
            flush_interval_ms: default_flush_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            control_state_path: None,
            max_sessions: default_max_sessions(),
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

impl ClientConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl LogshipConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: LogshipConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.hostname.is_empty() {
            return Err(crate::Error::Config("node.hostname cannot be empty".into()));
        }

        self.bucketer()?;

        if self.disk.enabled {
            crate::naming::FileNamer::new(&self.disk.filename_pattern, "", None)?;
        }

        if self.client.enabled {
            if self.client.collector_address.is_empty() {
                return Err(crate::Error::Config(
                    "client.collector_address cannot be empty".into(),
                ));
            }
            if self.client.buffer_capacity_bytes == 0 {
                return Err(crate::Error::Config(
                    "client.buffer_capacity_bytes must be positive".into(),
                ));
            }
        }

        if self.server.max_sessions == 0 {
            return Err(crate::Error::Config(
                "server.max_sessions must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Bucketer for the configured width
    pub fn bucketer(&self) -> crate::Result<TimeBucketer> {
        TimeBucketer::new(self.bucket.buckets_per_hour)
    }

    /// Get the durable cursor path
    pub fn control_state_path(&self) -> PathBuf {
        self.server
            .control_state_path
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("control.json"))
    }
}
