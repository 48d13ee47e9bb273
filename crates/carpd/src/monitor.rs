//! Link monitor.
//!
//! Polls interface flags and addresses and reports changes to the control
//! plane: link up/down, local address changes and interfaces that vanished.

use carp::ControlPlane;
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Observed state of one interface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkState {
    pub up: bool,
    pub addresses: Vec<IpAddr>,
}

/// Source of link observations
pub trait LinkSource: Send + Sync {
    fn links(&self) -> io::Result<HashMap<String, LinkState>>;
}

/// Interfaces of the running host
#[cfg(target_os = "linux")]
pub struct HostLinks;

#[cfg(target_os = "linux")]
impl LinkSource for HostLinks {
    fn links(&self) -> io::Result<HashMap<String, LinkState>> {
        Ok(carp::interface_snapshot()?
            .into_iter()
            .map(|(name, link)| {
                (
                    name,
                    LinkState {
                        up: link.up,
                        addresses: link.addresses,
                    },
                )
            })
            .collect())
    }
}

pub struct LinkMonitor {
    control: Arc<ControlPlane>,
    source: Arc<dyn LinkSource>,
    interval: Duration,
    last: HashMap<String, LinkState>,
}

impl LinkMonitor {
    pub fn new(control: Arc<ControlPlane>, source: Arc<dyn LinkSource>, interval: Duration) -> Self {
        Self {
            control,
            source,
            interval,
            last: HashMap::new(),
        }
    }

    /// Compare the current observation with the previous one and push
    /// differences for every interface hosting virtual routers.
    pub async fn poll_once(&mut self) {
        let links = match self.source.links() {
            Ok(links) => links,
            Err(e) => {
                warn!(error = %e, "Failed to read interface state");
                return;
            }
        };

        for name in self.control.interfaces().await {
            let Some(current) = links.get(&name) else {
                info!(interface = %name, "Interface disappeared");
                self.control.interface_removed(&name).await;
                self.last.remove(&name);
                continue;
            };

            let previous = self.last.get(&name);
            if previous.map(|p| p.up) != Some(current.up) {
                info!(interface = %name, up = current.up, "Link state changed");
                if let Err(e) = self.control.set_link_state(&name, current.up).await {
                    debug!(interface = %name, error = %e, "Link state not applied");
                }
            }

            let mut addresses = current.addresses.clone();
            addresses.sort();
            if previous.map(|p| &p.addresses) != Some(&addresses) {
                debug!(interface = %name, count = addresses.len(), "Local addresses changed");
                if let Err(e) = self
                    .control
                    .set_local_addresses(&name, addresses.clone())
                    .await
                {
                    debug!(interface = %name, error = %e, "Local addresses not applied");
                }
            }

            self.last.insert(
                name,
                LinkState {
                    up: current.up,
                    addresses,
                },
            );
        }
    }

    /// Poll forever at the configured interval.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.poll_once().await;
            }
        })
    }
}
