//! Configuration management for zreplica
//!
//! Configuration is layered: built-in defaults, then an optional file
//! (YAML, TOML or JSON), then `ZREPLICA__SECTION__KEY` environment
//! variables. Command-line flags are applied on top by the binary.
//!
//! # Examples
//!
//! ```rust
//! use zreplica_config::ConfigBuilder;
//!
//! let config = ConfigBuilder::new()
//!     .add_defaults()
//!     .add_env_prefix("ZREPLICA")
//!     .build()
//!     .expect("Failed to load configuration");
//!
//! println!("Tag prefix: {}", config.replication.tag_prefix);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use zreplica_types::{BufferSize, CompressionLevel, FreeFraction};

pub mod builder;
pub mod error;
pub mod loader;

pub use builder::ConfigBuilder;
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

/// Main configuration structure for zreplica
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Replication decisions
    pub replication: ReplicationConfig,
    /// Stream pipeline
    pub transfer: TransferConfig,
    /// External tool locations
    pub tools: ToolsConfig,
    /// Remote command channel
    pub ssh: SshConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Replication decision settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Fraction of the target that must stay free before a transfer
    pub min_free_fraction: FreeFraction,
    /// Leading part of every tool-created snapshot name
    pub tag_prefix: String,
    /// Host identity embedded in tags; `uname -n` when unset
    #[serde(default)]
    pub host_id: Option<String>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            min_free_fraction: FreeFraction::default(),
            tag_prefix: "zreplica".to_string(),
            host_id: None,
        }
    }
}

/// Stream pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Compress on the producer host
    pub compress: bool,
    /// zstd level used when compressing
    pub compression_level: CompressionLevel,
    /// Decoupling buffer capacity in bytes, 0 disables it
    pub buffer_size: BufferSize,
    /// Milliseconds between progress log lines
    pub progress_interval_ms: u64,
}

impl TransferConfig {
    /// Progress reporting interval
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Compression level, if compression is enabled
    pub fn compression(&self) -> Option<CompressionLevel> {
        self.compress.then_some(self.compression_level)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            compress: true,
            compression_level: CompressionLevel::default(),
            buffer_size: BufferSize::default(),
            progress_interval_ms: 5_000,
        }
    }
}

/// Locations of the external tools
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Snapshot engine binary
    pub zfs: String,
    /// Remote shell binary
    pub ssh: String,
    /// Compressor binary on the source host
    pub zstd: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            zfs: "zfs".to_string(),
            ssh: "ssh".to_string(),
            zstd: "zstd".to_string(),
        }
    }
}

/// Remote command channel settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SshConfig {
    /// Port, when not the ssh default
    #[serde(default)]
    pub port: Option<u16>,
    /// Identity file passed with `-i`
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Extra `-o` options
    #[serde(default)]
    pub options: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log file path
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_file: None,
        }
    }
}
