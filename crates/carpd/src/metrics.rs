//! Prometheus metrics for carpd.

use carp::{CarpState, GlobalRegistry, StateEvent, StatsSnapshot};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::warn;

/// Labels identifying one virtual router
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouterLabels {
    pub interface: String,
    pub vhid: String,
}

/// Labels for state transition metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
    pub interface: String,
    pub vhid: String,
    pub from: String,
    pub to: String,
}

/// Labels for protocol counters
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PacketLabels {
    /// Counter name (ipackets, badauth, ...)
    pub counter: String,
}

/// Metrics registry with all CARP metrics
pub struct MetricsRegistry {
    /// Prometheus registry
    pub registry: Registry,

    carp: Arc<GlobalRegistry>,

    /// Current state (0=init, 1=backup, 2=master)
    state: Family<RouterLabels, Gauge>,
    /// Skew currently advertised, demotion included
    effective_advskew: Family<RouterLabels, Gauge>,
    adverts_sent: Family<RouterLabels, Gauge>,
    adverts_received: Family<RouterLabels, Gauge>,
    state_transitions_total: Family<TransitionLabels, Counter>,
    demotion: Gauge,
    packets_total: Family<PacketLabels, Counter>,
    last_stats: Mutex<StatsSnapshot>,
}

fn state_value(state: CarpState) -> i64 {
    match state {
        CarpState::Init => 0,
        CarpState::Backup => 1,
        CarpState::Master => 2,
    }
}

impl MetricsRegistry {
    /// Create a new metrics registry reading from `carp`
    pub fn new(carp: Arc<GlobalRegistry>) -> Self {
        let mut registry = Registry::default();

        let state = Family::<RouterLabels, Gauge>::default();
        registry.register(
            "carp_state",
            "Current router state (0=init, 1=backup, 2=master)",
            state.clone(),
        );

        let effective_advskew = Family::<RouterLabels, Gauge>::default();
        registry.register(
            "carp_effective_advskew",
            "Advertised skew including demotion",
            effective_advskew.clone(),
        );

        let adverts_sent = Family::<RouterLabels, Gauge>::default();
        registry.register(
            "carp_adverts_sent",
            "Advertisements sent by the router",
            adverts_sent.clone(),
        );

        let adverts_received = Family::<RouterLabels, Gauge>::default();
        registry.register(
            "carp_adverts_received",
            "Authenticated advertisements received by the router",
            adverts_received.clone(),
        );

        let state_transitions_total = Family::<TransitionLabels, Counter>::default();
        registry.register(
            "carp_state_transitions",
            "Total router state transitions",
            state_transitions_total.clone(),
        );

        let demotion = Gauge::default();
        registry.register(
            "carp_demotion",
            "Global demotion counter",
            demotion.clone(),
        );

        let packets_total = Family::<PacketLabels, Counter>::default();
        registry.register(
            "carp_packets",
            "Protocol packet counters",
            packets_total.clone(),
        );

        Self {
            registry,
            carp,
            state,
            effective_advskew,
            adverts_sent,
            adverts_received,
            state_transitions_total,
            demotion,
            packets_total,
            last_stats: Mutex::new(StatsSnapshot::default()),
        }
    }

    /// Count one state transition
    pub fn record_transition(&self, event: &StateEvent) {
        self.state_transitions_total
            .get_or_create(&TransitionLabels {
                interface: event.interface.clone(),
                vhid: event.vhid.to_string(),
                from: event.from.to_string(),
                to: event.to.to_string(),
            })
            .inc();
    }

    /// Pull current values from the CARP registry. Called before every scrape.
    pub async fn refresh(&self) {
        self.demotion.set(i64::from(self.carp.demotion()));

        // Destroyed routers must not linger
        self.state.clear();
        self.effective_advskew.clear();
        self.adverts_sent.clear();
        self.adverts_received.clear();

        for router in self.carp.routers() {
            let status = router.status(false).await;
            let labels = RouterLabels {
                interface: status.interface.clone(),
                vhid: status.vhid.to_string(),
            };
            self.state
                .get_or_create(&labels)
                .set(state_value(status.state));
            self.effective_advskew
                .get_or_create(&labels)
                .set(i64::from(status.effective_advskew));
            self.adverts_sent
                .get_or_create(&labels)
                .set(status.stats.adverts_sent as i64);
            self.adverts_received
                .get_or_create(&labels)
                .set(status.stats.adverts_received as i64);
        }

        self.update_packets(self.carp.stats().snapshot());
    }

    fn update_packets(&self, current: StatsSnapshot) {
        let mut last = self
            .last_stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let pairs = [
            ("ipackets", current.ipackets, last.ipackets),
            ("ipackets6", current.ipackets6, last.ipackets6),
            ("badsum", current.badsum, last.badsum),
            ("badttl", current.badttl, last.badttl),
            ("badlen", current.badlen, last.badlen),
            ("badvhid", current.badvhid, last.badvhid),
            ("badver", current.badver, last.badver),
            ("badauth", current.badauth, last.badauth),
            ("badif", current.badif, last.badif),
            ("opackets", current.opackets, last.opackets),
            ("opackets6", current.opackets6, last.opackets6),
            ("oerrors", current.oerrors, last.oerrors),
            ("preempt", current.preempt, last.preempt),
        ];
        for (name, now, before) in pairs {
            let counter = self.packets_total.get_or_create(&PacketLabels {
                counter: name.to_string(),
            });
            counter.inc_by(now.saturating_sub(before));
        }

        *last = current;
    }
}

/// Count state transitions as they are published.
pub fn spawn_event_recorder(
    metrics: Arc<MetricsRegistry>,
    mut events: broadcast::Receiver<StateEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => metrics.record_transition(&event),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "State event recorder lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use carp::GlobalConfig;
    use prometheus_client::encoding::text::encode;

    fn render(metrics: &MetricsRegistry) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, &metrics.registry).unwrap();
        buffer
    }

    #[tokio::test]
    async fn test_transition_counter() {
        let metrics = MetricsRegistry::new(GlobalRegistry::new(GlobalConfig::default()));
        let event = StateEvent {
            interface: "eth0".to_string(),
            vhid: 3,
            from: CarpState::Backup,
            to: CarpState::Master,
            reason: "timeout".to_string(),
        };
        metrics.record_transition(&event);
        metrics.record_transition(&event);

        let text = render(&metrics);
        assert!(text.contains(
            r#"carp_state_transitions_total{interface="eth0",vhid="3",from="BACKUP",to="MASTER"} 2"#
        ));
    }

    #[tokio::test]
    async fn test_refresh_exports_demotion_and_packets() {
        let carp = GlobalRegistry::new(GlobalConfig::default());
        let metrics = MetricsRegistry::new(carp.clone());

        carp.demote(40, "test");
        metrics.refresh().await;
        let text = render(&metrics);
        assert!(text.contains("carp_demotion 40"));
        assert!(text.contains(r#"carp_packets_total{counter="badauth"} 0"#));

        carp.shutdown().await;
    }
}
