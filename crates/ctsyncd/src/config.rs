//! Configuration file support for ctsyncd
//!
//! Loads and validates ctsyncd configuration from TOML files.
//! Default location: /etc/sonic/ctsyncd.conf
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-2: Baseline Configuration - Defaults for every setting
//! - CM-6: Configuration Settings - Validated before use

use crate::error::{CtsyncError, Result};
use crate::filter_builder::DEFAULT_BRIDGE_INTERFACE;
use crate::timeout_watcher::{DEFAULT_TCP_TIMEOUT_FILE, DEFAULT_TIMEOUT_DIR, DEFAULT_UDP_TIMEOUT_FILE};
use crate::udp_refresh::DEFAULT_UDP_REFRESH_INTERVAL_SECS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sonic/ctsyncd.conf";

/// Capture session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Forward IPv6 and TCP creation events, disable the WAN gate
    #[serde(default)]
    pub extended_mode: bool,

    /// Receive timeout in milliseconds, bounds shutdown latency
    #[serde(default = "default_recv_timeout")]
    pub recv_timeout_ms: u64,

    /// Kernel receive buffer size
    #[serde(default = "default_recv_buffer")]
    pub recv_buffer_bytes: usize,
}

/// Filter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Interface whose subnet broadcast is excluded
    #[serde(default = "default_bridge_interface")]
    pub bridge_interface: String,

    /// LAN interfaces excluded at startup
    #[serde(default)]
    pub lan_interfaces: Vec<String>,

    /// WAN interface; its presence marks WAN up at startup
    #[serde(default)]
    pub wan_interface: Option<String>,
}

/// Timeout file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_timeout_dir")]
    pub directory: PathBuf,

    #[serde(default = "default_tcp_file")]
    pub tcp_file: String,

    #[serde(default = "default_udp_file")]
    pub udp_file: String,

    /// Notification poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// UDP timestamp refresh interval in seconds
    #[serde(default = "default_udp_refresh_interval")]
    pub udp_refresh_interval_secs: u64,
}

/// Dispatch queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum queued messages before records are dropped
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

/// Complete ctsyncd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CtsyncConfig {
    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub filter: FilterConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,
}

// Default functions
fn default_recv_timeout() -> u64 {
    250
}

fn default_recv_buffer() -> usize {
    1024 * 1024
}

fn default_bridge_interface() -> String {
    DEFAULT_BRIDGE_INTERFACE.to_string()
}

fn default_timeout_dir() -> PathBuf {
    PathBuf::from(DEFAULT_TIMEOUT_DIR)
}

fn default_tcp_file() -> String {
    DEFAULT_TCP_TIMEOUT_FILE.to_string()
}

fn default_udp_file() -> String {
    DEFAULT_UDP_TIMEOUT_FILE.to_string()
}

fn default_poll_interval() -> u64 {
    200
}

fn default_udp_refresh_interval() -> u64 {
    DEFAULT_UDP_REFRESH_INTERVAL_SECS
}

fn default_queue_depth() -> usize {
    1024
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            extended_mode: false,
            recv_timeout_ms: default_recv_timeout(),
            recv_buffer_bytes: default_recv_buffer(),
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            bridge_interface: default_bridge_interface(),
            lan_interfaces: Vec::new(),
            wan_interface: None,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            directory: default_timeout_dir(),
            tcp_file: default_tcp_file(),
            udp_file: default_udp_file(),
            poll_interval_ms: default_poll_interval(),
            udp_refresh_interval_secs: default_udp_refresh_interval(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
        }
    }
}

impl CtsyncConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                CtsyncError::Configuration(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                eprintln!(
                    "ctsyncd: Config file {} not found, using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(e) => Err(CtsyncError::Io(e)),
        }
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.capture.recv_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.timeouts.poll_interval_ms)
    }

    pub fn udp_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.timeouts.udp_refresh_interval_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.queue_depth == 0 {
            return Err(CtsyncError::Configuration(
                "queue_depth must be > 0".to_string(),
            ));
        }

        if self.capture.recv_timeout_ms == 0 {
            // A zero SO_RCVTIMEO blocks forever
            return Err(CtsyncError::Configuration(
                "recv_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.timeouts.poll_interval_ms == 0 || self.timeouts.udp_refresh_interval_secs == 0 {
            return Err(CtsyncError::Configuration(
                "timeout intervals must be > 0".to_string(),
            ));
        }

        if self.timeouts.tcp_file.is_empty() || self.timeouts.udp_file.is_empty() {
            return Err(CtsyncError::Configuration(
                "timeout file names must not be empty".to_string(),
            ));
        }

        if self.filter.bridge_interface.is_empty() {
            return Err(CtsyncError::Configuration(
                "bridge_interface must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
