//! Configuration loading and validation for carpd

use carp::{CarpRequest, CarpState, GlobalConfig};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] ValidationErrors),

    #[error("Duplicate vhid {vhid} on {interface}")]
    DuplicateRouter { interface: String, vhid: u32 },
}

impl From<ConfigError> for common::Error {
    fn from(err: ConfigError) -> Self {
        common::Error::config(err)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,

    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub monitor: MonitorSettings,

    #[serde(default)]
    pub virtual_routers: Vec<VirtualRouterSettings>,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), ValidationErrors> {
        self.metrics.validate()?;
        self.monitor.validate()?;
        for router in &self.virtual_routers {
            router.validate()?;
        }
        Ok(())
    }
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub format: Option<String>,
}

/// Prometheus endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,

    #[validate(custom = "validate_listen_addr")]
    pub listen_addr: String,
}

/// Link monitor and packet input settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MonitorSettings {
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_poll_interval")]
    pub link_poll_interval: Duration,

    /// Capacity of the inbound frame queue shared by all interfaces
    #[validate(range(min = 16, max = 65536))]
    pub frame_queue: usize,
}

/// One virtual router to create at startup
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct VirtualRouterSettings {
    #[validate(length(min = 1, max = 15))]
    pub interface: String,

    #[validate(range(min = 1, max = 255))]
    pub vhid: u32,

    #[serde(default = "default_advbase")]
    #[validate(range(min = 1, max = 255))]
    pub advbase: u32,

    #[serde(default)]
    #[validate(range(max = 254))]
    pub advskew: u32,

    #[serde(default)]
    #[validate(custom = "validate_key")]
    pub key: String,

    #[validate(length(min = 1))]
    pub addresses: Vec<IpAddr>,

    #[serde(default)]
    pub peer: Option<Ipv4Addr>,

    #[serde(default)]
    pub peer6: Option<Ipv6Addr>,

    /// Force Backup or Master right after creation
    #[serde(default)]
    pub state: Option<CarpState>,
}

fn default_advbase() -> u32 {
    1
}

impl VirtualRouterSettings {
    /// Control-plane request creating this router.
    pub fn to_request(&self) -> CarpRequest {
        CarpRequest {
            state: self.state,
            advbase: Some(self.advbase),
            advskew: Some(self.advskew),
            key: Some(self.key.as_bytes().to_vec()),
            addresses: self.addresses.clone(),
            peer: self.peer,
            peer6: self.peer6,
        }
    }
}

// Default implementations

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:9742".to_string(),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            link_poll_interval: Duration::from_secs(1),
            frame_queue: 1024,
        }
    }
}

// Custom validators

fn validate_listen_addr(addr: &str) -> Result<(), ValidationError> {
    addr.parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("listen_addr_invalid"))
}

fn validate_poll_interval(interval: &Duration) -> Result<(), ValidationError> {
    let millis = interval.as_millis();
    if !(10..=60_000).contains(&millis) {
        return Err(ValidationError::new("link_poll_interval_out_of_range"));
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<(), ValidationError> {
    if key.len() > carp::CARP_KEY_LEN {
        return Err(ValidationError::new("key_too_long"));
    }
    Ok(())
}

// Configuration loading implementation

impl Config {
    /// Load configuration from default search paths
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load from `path` when given, otherwise from the search paths
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) if !path.is_file() => Err(ConfigError::FileNotFound(path.to_path_buf())),
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(path)
            }
            None => Self::load(),
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        config.check_unique_routers()?;
        Ok(config)
    }

    fn check_unique_routers(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for router in &self.virtual_routers {
            if !seen.insert((router.interface.as_str(), router.vhid)) {
                return Err(ConfigError::DuplicateRouter {
                    interface: router.interface.clone(),
                    vhid: router.vhid,
                });
            }
        }
        Ok(())
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/carp/carpd.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./carpd.yaml"));

        paths.into_iter().find(|p| p.is_file())
    }

    /// Get home directory config path
    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/carp/carpd.yaml"))
    }
}
