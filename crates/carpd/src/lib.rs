//! carpd - CARP daemon
//!
//! Creates the virtual routers described in a YAML file on the host's
//! interfaces and keeps them running.
//!
//! # Components
//!
//! - **Daemon**: owns the control plane and feeds it received frames
//! - **LinkMonitor**: reports link and address changes
//! - **MetricsServer**: Prometheus `/metrics` endpoint

pub mod config;
pub mod daemon;
pub mod http_server;
pub mod metrics;
pub mod monitor;

pub use config::{Config, ConfigError};
pub use daemon::Daemon;
pub use http_server::MetricsServer;
pub use metrics::MetricsRegistry;
pub use monitor::{LinkMonitor, LinkSource, LinkState};
