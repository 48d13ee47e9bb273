//! Daemon wiring: control plane, frame pump, link monitor and metrics.

use crate::config::{Config, VirtualRouterSettings};
use crate::http_server::MetricsServer;
use crate::metrics::{MetricsRegistry, spawn_event_recorder};
use crate::monitor::{LinkMonitor, LinkSource};
use carp::{ControlPlane, GlobalConfig, GlobalRegistry, InboundFrame, NetworkProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Received datagrams tagged with their interface
pub type FrameReceiver = mpsc::Receiver<(String, InboundFrame)>;

pub struct Daemon {
    control: Arc<ControlPlane>,
    metrics: Arc<MetricsRegistry>,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    pub fn new(global: GlobalConfig, provider: Arc<dyn NetworkProvider>) -> Self {
        let registry = GlobalRegistry::new(global);
        let metrics = Arc::new(MetricsRegistry::new(registry.clone()));
        let recorder = spawn_event_recorder(metrics.clone(), registry.subscribe());

        Self {
            control: Arc::new(ControlPlane::new(registry, provider)),
            metrics,
            tasks: vec![recorder],
        }
    }

    pub fn control(&self) -> &Arc<ControlPlane> {
        &self.control
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Create every configured virtual router. Stops at the first failure.
    pub async fn configure(&self, routers: &[VirtualRouterSettings]) -> common::Result<()> {
        for router in routers {
            let status = self
                .control
                .set(&router.interface, router.vhid, router.to_request())
                .await
                .map_err(|e| {
                    common::Error::carp(format!(
                        "vhid {} on {}: {}",
                        router.vhid, router.interface, e
                    ))
                })?;
            info!(
                interface = %status.interface,
                vhid = status.vhid,
                state = %status.state,
                "Virtual router configured"
            );
        }
        Ok(())
    }

    /// Feed received frames into the control plane.
    pub fn start_pump(&mut self, mut frames: FrameReceiver) {
        let control = self.control.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some((interface, frame)) = frames.recv().await {
                control.input(&interface, &frame).await;
            }
        }));
    }

    pub fn start_monitor(&mut self, source: Arc<dyn LinkSource>, interval: Duration) {
        let monitor = LinkMonitor::new(self.control.clone(), source, interval);
        self.tasks.push(monitor.spawn());
    }

    pub fn start_metrics_server(&mut self, listen_addr: String) {
        let server = MetricsServer::new(self.metrics.clone(), listen_addr);
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "Metrics server failed");
            }
        }));
    }

    /// Destroy every router, withdrawing its addresses, and stop all tasks.
    pub async fn shutdown(self) {
        info!("Shutting down, destroying all virtual routers");
        for task in &self.tasks {
            task.abort();
        }
        self.control.shutdown().await;
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Run the daemon on the host network until SIGINT or SIGTERM.
#[cfg(target_os = "linux")]
pub async fn run(config: Config) -> common::Result<()> {
    use crate::monitor::HostLinks;
    use carp::LinuxNetwork;

    let (network, frames) = LinuxNetwork::new(config.monitor.frame_queue);
    let mut daemon = Daemon::new(config.global.clone(), Arc::new(network));
    daemon.start_pump(frames);

    if let Err(e) = daemon.configure(&config.virtual_routers).await {
        daemon.shutdown().await;
        return Err(e);
    }

    daemon.start_monitor(Arc::new(HostLinks), config.monitor.link_poll_interval);
    if config.metrics.enabled {
        daemon.start_metrics_server(config.metrics.listen_addr.clone());
    }

    wait_for_signal().await?;
    daemon.shutdown().await;
    Ok(())
}

#[cfg(target_os = "linux")]
async fn wait_for_signal() -> common::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received SIGINT");
        }
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}
