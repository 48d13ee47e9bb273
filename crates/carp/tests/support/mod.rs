//! In-memory link shared by simulated CARP hosts.
//!
//! Every host owns one port named `sim0` on the bus. Advertisements sent by
//! one port are queued to every other port that joined the family's
//! multicast group (or whose address is the unicast destination) and pumped
//! into that host's control plane by a task, so delivery never happens while
//! the sender holds engine locks.

#![allow(dead_code)]

use bytes::Bytes;
use carp::{
    AddressFamily, CarpRequest, CarpState, CarpStatus, ControlPlane, GlobalConfig, GlobalRegistry,
    InboundFrame, NetworkProvider, NetworkTransport, OutboundPacket,
};
use std::collections::BTreeSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const INTERFACE: &str = "sim0";

/// One host's attachment to the bus
pub struct Port {
    pub addr4: Ipv4Addr,
    pub addr6: Ipv6Addr,
    joined: [AtomicBool; 2],
    up: AtomicBool,
    muted: AtomicBool,
    fail_sends: AtomicBool,
    promisc: AtomicBool,
    routes: Mutex<BTreeSet<IpAddr>>,
    pub sent: AtomicUsize,
    pub gratuitous: AtomicUsize,
    inbox: mpsc::UnboundedSender<InboundFrame>,
}

impl Port {
    fn own_address(&self, family: AddressFamily) -> IpAddr {
        match family {
            AddressFamily::Inet => IpAddr::V4(self.addr4),
            AddressFamily::Inet6 => IpAddr::V6(self.addr6),
        }
    }

    fn family_slot(family: AddressFamily) -> usize {
        match family {
            AddressFamily::Inet => 0,
            AddressFamily::Inet6 => 1,
        }
    }

    fn accepts(&self, family: AddressFamily, dst: IpAddr) -> bool {
        if dst == family.multicast_group() {
            self.joined[Self::family_slot(family)].load(Ordering::SeqCst)
        } else {
            dst == self.own_address(family)
        }
    }
}

/// The shared link
#[derive(Default)]
pub struct SimBus {
    ports: Mutex<Vec<Arc<Port>>>,
}

impl SimBus {
    pub fn new() -> Arc<Self> {
        // RUST_LOG=carp=debug shows protocol traces for a failing test
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        Arc::new(Self::default())
    }

    /// Attach host `n` (addresses 10.0.0.n and fe80::n) to the bus.
    pub fn host(self: &Arc<Self>, n: u8, config: GlobalConfig) -> SimHost {
        let (inbox, mut rx) = mpsc::unbounded_channel();
        let port = Arc::new(Port {
            addr4: Ipv4Addr::new(10, 0, 0, n),
            addr6: Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, u16::from(n)),
            joined: [AtomicBool::new(false), AtomicBool::new(false)],
            up: AtomicBool::new(true),
            muted: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            promisc: AtomicBool::new(false),
            routes: Mutex::new(BTreeSet::new()),
            sent: AtomicUsize::new(0),
            gratuitous: AtomicUsize::new(0),
            inbox,
        });
        self.ports.lock().unwrap().push(port.clone());

        let provider = SimProvider {
            bus: Arc::downgrade(self),
            port: port.clone(),
        };
        let control = Arc::new(ControlPlane::new(
            GlobalRegistry::new(config),
            Arc::new(provider),
        ));

        let pump_control = control.clone();
        let pump = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                pump_control.input(INTERFACE, &frame).await;
            }
        });

        SimHost {
            control,
            port,
            pump,
        }
    }

    fn deliver(&self, from: &Port, packet: &OutboundPacket) {
        let ports = self.ports.lock().unwrap().clone();
        for port in ports {
            if std::ptr::eq(port.as_ref(), from) || !port.accepts(packet.family, packet.dst) {
                continue;
            }
            let _ = port.inbox.send(InboundFrame {
                src: from.own_address(packet.family),
                dst: packet.dst,
                ttl: packet.ttl,
                payload: packet.payload.clone(),
            });
        }
    }
}

struct SimProvider {
    bus: Weak<SimBus>,
    port: Arc<Port>,
}

impl NetworkProvider for SimProvider {
    fn open(&self, interface: &str) -> io::Result<Arc<dyn NetworkTransport>> {
        if interface != INTERFACE {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Interface {} not found", interface),
            ));
        }
        Ok(Arc::new(SimTransport {
            bus: self.bus.clone(),
            port: self.port.clone(),
        }))
    }
}

struct SimTransport {
    bus: Weak<SimBus>,
    port: Arc<Port>,
}

impl NetworkTransport for SimTransport {
    fn send_advertisement(&self, packet: &OutboundPacket) -> io::Result<()> {
        if self.port.fail_sends.load(Ordering::SeqCst) {
            return Err(io::Error::other("simulated send failure"));
        }
        self.port.sent.fetch_add(1, Ordering::SeqCst);
        if self.port.muted.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.deliver(&self.port, packet);
        }
        Ok(())
    }

    fn send_gratuitous(&self, _addr: IpAddr, _lladdr: [u8; 6]) -> io::Result<()> {
        self.port.gratuitous.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn join_multicast(&self, family: AddressFamily) -> io::Result<()> {
        self.port.joined[Port::family_slot(family)].store(true, Ordering::SeqCst);
        Ok(())
    }

    fn leave_multicast(&self, family: AddressFamily) -> io::Result<()> {
        self.port.joined[Port::family_slot(family)].store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_promiscuous(&self, enabled: bool) -> io::Result<()> {
        self.port.promisc.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn add_route(&self, addr: IpAddr) -> io::Result<()> {
        self.port.routes.lock().unwrap().insert(addr);
        Ok(())
    }

    fn del_route(&self, addr: IpAddr) -> io::Result<()> {
        self.port.routes.lock().unwrap().remove(&addr);
        Ok(())
    }

    fn is_up(&self) -> bool {
        self.port.up.load(Ordering::SeqCst)
    }

    fn local_addresses(&self) -> io::Result<Vec<IpAddr>> {
        Ok(vec![IpAddr::V4(self.port.addr4), IpAddr::V6(self.port.addr6)])
    }
}

/// A simulated host: one control plane on one bus port
pub struct SimHost {
    pub control: Arc<ControlPlane>,
    pub port: Arc<Port>,
    pump: JoinHandle<()>,
}

impl Drop for SimHost {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl SimHost {
    /// Create or update `vhid` with the given skew, key and addresses.
    pub async fn configure(
        &self,
        vhid: u32,
        advskew: u32,
        key: &[u8],
        addresses: &[&str],
    ) -> CarpStatus {
        let request = CarpRequest {
            advskew: Some(advskew),
            key: Some(key.to_vec()),
            addresses: addresses.iter().map(|a| a.parse().unwrap()).collect(),
            ..Default::default()
        };
        self.control.set(INTERFACE, vhid, request).await.unwrap()
    }

    pub async fn state(&self, vhid: u32) -> CarpState {
        self.control.get(INTERFACE, vhid, false).await.unwrap().state
    }

    pub fn registry(&self) -> &Arc<GlobalRegistry> {
        self.control.context()
    }

    /// Stop putting advertisements on the wire, as if the host hung.
    pub fn mute(&self, muted: bool) {
        self.port.muted.store(muted, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.port.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Change link state the way a link monitor would report it.
    pub async fn set_link(&self, up: bool) {
        self.port.up.store(up, Ordering::SeqCst);
        self.control.set_link_state(INTERFACE, up).await.unwrap();
    }

    pub fn routes(&self) -> BTreeSet<IpAddr> {
        self.port.routes.lock().unwrap().clone()
    }

    pub fn joined(&self, family: AddressFamily) -> bool {
        self.port.joined[Port::family_slot(family)].load(Ordering::SeqCst)
    }

    pub fn promiscuous(&self) -> bool {
        self.port.promisc.load(Ordering::SeqCst)
    }

    /// Inject a raw frame as if it had arrived from the wire.
    pub async fn inject(&self, src: IpAddr, ttl: u8, payload: Bytes) {
        let frame = InboundFrame {
            src,
            dst: AddressFamily::of(&src).multicast_group(),
            ttl,
            payload,
        };
        self.control.input(INTERFACE, &frame).await;
    }
}

/// Global configuration for simulated hosts
pub fn global(preempt: bool) -> GlobalConfig {
    GlobalConfig {
        preempt,
        ..Default::default()
    }
}

/// Hosts currently in Master for `vhid`.
pub async fn masters(hosts: &[&SimHost], vhid: u32) -> usize {
    let mut count = 0;
    for host in hosts {
        if host.state(vhid).await == CarpState::Master {
            count += 1;
        }
    }
    count
}
