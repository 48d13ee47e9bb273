//! CARP virtual router state machine.
//!
//! State transitions:
//! - Init -> Backup (link up, addresses attached, protocol allowed)
//! - Backup -> Master (master down timer expiry, preemption, or a master
//!   that advertises too slowly to survive)
//! - Master -> Backup (a more frequent advertisement is received)
//! - any -> Init (link down, protocol disallowed, last address removed)
//!
//! Every entry point (timer expiry, received frame, administrative command)
//! takes the router's own lock, so transitions of one router are strictly
//! ordered. A router never locks its interface group.

use crate::auth::AuthEngine;
use crate::interface::Interface;
use crate::packet::Advertisement;
use crate::registry::{CarpStats, GlobalRegistry, LogLevel};
use crate::transport::OutboundPacket;
use crate::types::{
    AddressFamily, AddressSet, CARP_ADVERTISEMENT, CARP_DFLTTL, CARP_SENDAD_MAX_ERRORS,
    CARP_SENDAD_MIN_SUCCESS, CARP_VERSION, CarpState, CarpStatus, RouterConfig, RouterKey,
    RouterStats, StateEvent, advertisement_interval, virtual_mac,
};
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Advertise,
    MasterDown,
}

/// A one-shot timer task. Every arm or cancel bumps the generation, so a task
/// that already woke up can tell it was superseded.
#[derive(Debug, Default)]
struct Timer {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl Timer {
    fn cancel(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    fn is_armed(&self) -> bool {
        self.handle.is_some()
    }
}

struct RouterInner {
    config: RouterConfig,
    state: CarpState,
    addresses: AddressSet,
    auth: AuthEngine,
    counter: u64,
    init_counter: bool,
    sendad_errors: u32,
    sendad_success: u32,
    /// Demotion currently applied for send errors
    senderr_applied: i32,
    suppressed: bool,
    /// Demotion currently applied for link down / disallowed
    ifdown_applied: i32,
    ad_timer: Timer,
    md_timer: Timer,
    stats: RouterStats,
    destroyed: bool,
}

impl RouterInner {
    fn timer_mut(&mut self, kind: TimerKind) -> &mut Timer {
        match kind {
            TimerKind::Advertise => &mut self.ad_timer,
            TimerKind::MasterDown => &mut self.md_timer,
        }
    }

    fn has_family(&self, family: AddressFamily) -> bool {
        self.addresses.iter().any(|a| AddressFamily::of(a) == family)
    }

    fn prepare_auth(&mut self) {
        self.auth = AuthEngine::prepare(&self.config.key, self.config.vhid, &self.addresses);
    }

    fn cancel_timers(&mut self) {
        self.ad_timer.cancel();
        self.md_timer.cancel();
    }
}

/// One CARP virtual router, identified by interface and VHID
pub struct VirtualRouter {
    key: RouterKey,
    link: Arc<Interface>,
    ctx: Arc<GlobalRegistry>,
    this: Weak<VirtualRouter>,
    inner: Mutex<RouterInner>,
}

impl std::fmt::Debug for VirtualRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualRouter")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl VirtualRouter {
    /// Create a router in Init and register it with the process context.
    ///
    /// The router stays in Init until addresses are attached and
    /// [`VirtualRouter::refresh_link_state`] finds the link usable.
    pub fn new(config: RouterConfig, link: Arc<Interface>, ctx: Arc<GlobalRegistry>) -> Arc<Self> {
        let key = RouterKey::new(link.name(), config.vhid);
        let auth = AuthEngine::prepare(&config.key, config.vhid, &AddressSet::new());

        let router = Arc::new_cyclic(|this| Self {
            key: key.clone(),
            link,
            ctx: ctx.clone(),
            this: this.clone(),
            inner: Mutex::new(RouterInner {
                config,
                state: CarpState::Init,
                addresses: AddressSet::new(),
                auth,
                counter: 0,
                init_counter: true,
                sendad_errors: 0,
                sendad_success: 0,
                senderr_applied: 0,
                suppressed: false,
                ifdown_applied: 0,
                ad_timer: Timer::default(),
                md_timer: Timer::default(),
                stats: RouterStats::default(),
                destroyed: false,
            }),
        });

        ctx.register(key, Arc::downgrade(&router));
        router
    }

    pub fn key(&self) -> &RouterKey {
        &self.key
    }

    pub fn vhid(&self) -> u8 {
        self.key.vhid
    }

    pub fn interface(&self) -> &Arc<Interface> {
        &self.link
    }

    pub async fn state(&self) -> CarpState {
        self.inner.lock().await.state
    }

    pub async fn config(&self) -> RouterConfig {
        self.inner.lock().await.config.clone()
    }

    pub async fn addresses(&self) -> AddressSet {
        self.inner.lock().await.addresses.clone()
    }

    pub async fn stats(&self) -> RouterStats {
        self.inner.lock().await.stats.clone()
    }

    /// Whether this router has at least one address of `family`.
    pub async fn serves(&self, family: AddressFamily) -> bool {
        self.inner.lock().await.has_family(family)
    }

    /// Snapshot for the control surface. The key is only included for
    /// privileged callers.
    pub async fn status(&self, privileged: bool) -> CarpStatus {
        let inner = self.inner.lock().await;
        let mut addresses = Vec::new();
        let mut addresses6 = Vec::new();
        for addr in &inner.addresses {
            match addr {
                IpAddr::V4(a) => addresses.push(*a),
                IpAddr::V6(a) => addresses6.push(*a),
            }
        }

        CarpStatus {
            interface: self.key.interface.clone(),
            vhid: self.key.vhid,
            state: inner.state,
            advbase: inner.config.advbase,
            advskew: inner.config.advskew,
            effective_advskew: self.ctx.demoted_skew(inner.config.advskew),
            addresses,
            addresses6,
            key: privileged.then(|| inner.config.key.clone()),
            peer: inner.config.peer,
            peer6: inner.config.peer6,
            stats: inner.stats.clone(),
        }
    }

    /// Add a virtual address. Returns false if it was already attached.
    pub async fn attach_address(&self, addr: IpAddr) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.destroyed || !inner.addresses.insert(addr) {
            return false;
        }
        inner.prepare_auth();

        if inner.state == CarpState::Master {
            self.add_route(addr);
        }
        self.refresh_locked(&mut inner);
        true
    }

    /// Remove a virtual address. Returns false if it was not attached.
    pub async fn detach_address(&self, addr: IpAddr) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.destroyed || !inner.addresses.remove(&addr) {
            return false;
        }
        inner.prepare_auth();

        if inner.state == CarpState::Master {
            self.del_route(addr);
        }
        if inner.addresses.is_empty() {
            inner.cancel_timers();
            self.set_state(&mut inner, CarpState::Init, "last address removed");
        }
        true
    }

    /// Apply new timing, key or peer settings. The VHID cannot change.
    pub async fn reconfigure(&self, mut config: RouterConfig) {
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return;
        }
        config.vhid = self.key.vhid;
        let key_changed = config.key != inner.config.key;
        inner.config = config;
        if key_changed {
            inner.prepare_auth();
        }

        match inner.state {
            CarpState::Master => self.send_ad(&mut inner),
            CarpState::Backup => self.setrun(&mut inner),
            CarpState::Init => {}
        }
    }

    /// Administratively force a state. Init is not a valid target.
    pub async fn force_state(&self, target: CarpState) {
        let mut inner = self.inner.lock().await;
        if inner.destroyed || inner.state == target {
            return;
        }

        match (inner.state, target) {
            (CarpState::Master, CarpState::Backup) => {
                inner.ad_timer.cancel();
                self.set_state(&mut inner, CarpState::Backup, "user requested");
                self.setrun(&mut inner);
                self.withdraw_routes(&inner);
            }
            (CarpState::Backup, CarpState::Master) => {
                self.master_down(&mut inner, "user requested");
            }
            _ => {}
        }
    }

    /// Advertise immediately if currently Master.
    pub async fn send_if_master(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.destroyed && inner.state == CarpState::Master {
            self.send_ad(&mut inner);
        }
    }

    /// Re-evaluate link state and protocol allowance.
    pub async fn refresh_link_state(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.destroyed {
            self.refresh_locked(&mut inner);
        }
    }

    /// Leave Init if the link is usable; re-arm the timer of the current state.
    pub async fn on_interface_ready(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.destroyed {
            self.setrun(&mut inner);
        }
    }

    pub async fn on_interface_down_or_disallowed(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.destroyed {
            self.go_down(&mut inner);
        }
    }

    pub async fn on_interface_up_or_allowed(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.destroyed {
            self.come_up(&mut inner);
        }
    }

    /// Take over as Master. Only valid in Backup.
    pub async fn on_master_lost(&self, reason: &str) {
        let mut inner = self.inner.lock().await;
        if !inner.destroyed {
            self.master_down(&mut inner, reason);
        }
    }

    /// Process an advertisement received from `src` with the given TTL.
    pub async fn on_advertisement_received(&self, advert: &Advertisement, src: IpAddr, ttl: u8) {
        let mut inner = self.inner.lock().await;
        if !inner.destroyed {
            self.process_advertisement(&mut inner, advert, src, ttl);
        }
    }

    /// Feed one send outcome into the send-error demotion logic.
    pub async fn record_send_result(&self, ok: bool) {
        let mut inner = self.inner.lock().await;
        if !inner.destroyed {
            self.record_send(&mut inner, ok);
        }
    }

    /// Stop the router for good.
    ///
    /// Withdraws routes, returns every demotion this router applied, cancels
    /// both timers and waits for their tasks to finish before unregistering.
    pub async fn destroy(&self) {
        let timers = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;

            if inner.state == CarpState::Master {
                self.withdraw_routes(&inner);
            }
            if inner.suppressed {
                self.ctx.demote(inner.ifdown_applied.saturating_neg(), "vhid removed");
                inner.ifdown_applied = 0;
                inner.suppressed = false;
            }
            if inner.senderr_applied != 0 {
                self.ctx.demote(inner.senderr_applied.saturating_neg(), "vhid removed");
                inner.senderr_applied = 0;
            }
            self.set_state(inner, CarpState::Init, "vhid removed");

            let mut timers = Vec::new();
            for timer in [&mut inner.ad_timer, &mut inner.md_timer] {
                timer.generation = timer.generation.wrapping_add(1);
                if let Some(handle) = timer.handle.take() {
                    handle.abort();
                    timers.push(handle);
                }
            }
            timers
        };

        for handle in timers {
            let _ = handle.await;
        }
        self.ctx.unregister(&self.key);
    }

    async fn timer_expired(&self, kind: TimerKind, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return;
        }
        let timer = inner.timer_mut(kind);
        if timer.generation != generation {
            return;
        }
        // Detach our own handle so re-arming below does not abort this task
        timer.handle = None;

        match kind {
            TimerKind::Advertise => {
                if inner.state == CarpState::Master {
                    self.send_ad(&mut inner);
                }
            }
            TimerKind::MasterDown => self.master_down(&mut inner, "timeout"),
        }
    }

    fn arm(&self, inner: &mut RouterInner, kind: TimerKind, after: Duration) {
        let timer = inner.timer_mut(kind);
        timer.cancel();
        let generation = timer.generation;
        let router = self.this.clone();

        timer.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(router) = router.upgrade() {
                router.timer_expired(kind, generation).await;
            }
        }));
    }

    fn link_usable(&self) -> bool {
        self.link.is_up() && self.ctx.allowed()
    }

    fn refresh_locked(&self, inner: &mut RouterInner) {
        if self.link_usable() {
            self.come_up(inner);
        } else {
            self.go_down(inner);
        }
    }

    fn setrun(&self, inner: &mut RouterInner) {
        if !self.link_usable() || inner.addresses.is_empty() {
            return;
        }

        match inner.state {
            CarpState::Init => {
                self.set_state(inner, CarpState::Backup, "initialization complete");
                self.setrun(inner);
            }
            CarpState::Backup => {
                inner.ad_timer.cancel();
                let interval = inner.config.master_down_interval();
                self.arm(inner, TimerKind::MasterDown, interval);
            }
            CarpState::Master => {
                let skew = self.ctx.demoted_skew(inner.config.advskew);
                let interval = advertisement_interval(u32::from(inner.config.advbase), skew);
                self.arm(inner, TimerKind::Advertise, interval);
            }
        }
    }

    fn go_down(&self, inner: &mut RouterInner) {
        inner.cancel_timers();
        if inner.state == CarpState::Master {
            self.withdraw_routes(inner);
        }

        let reason = if self.ctx.allowed() {
            "hardware interface down"
        } else {
            "protocol disallowed"
        };
        self.set_state(inner, CarpState::Init, reason);

        if !inner.suppressed {
            let adj = self.ctx.ifdown_adj();
            self.ctx.demote(adj, "interface down");
            inner.ifdown_applied = adj;
            inner.suppressed = true;
        }
    }

    fn come_up(&self, inner: &mut RouterInner) {
        if inner.suppressed {
            self.ctx.demote(inner.ifdown_applied.saturating_neg(), "interface up");
            inner.ifdown_applied = 0;
            inner.suppressed = false;
        }
        if inner.state == CarpState::Init {
            self.setrun(inner);
        }
    }

    fn master_down(&self, inner: &mut RouterInner, reason: &str) {
        if inner.state != CarpState::Backup {
            debug!(vhid = self.key.vhid, interface = %self.key.interface, state = %inner.state,
                "master down event outside Backup ignored");
            return;
        }

        inner.md_timer.cancel();
        self.set_state(inner, CarpState::Master, reason);
        self.send_ad(inner);

        let lladdr = virtual_mac(self.key.vhid);
        for addr in &inner.addresses {
            if let Err(e) = self.link.transport().send_gratuitous(*addr, lladdr) {
                warn!(vhid = self.key.vhid, address = %addr, error = %e,
                    "Failed to send gratuitous announcement");
            }
        }
        for addr in &inner.addresses {
            self.add_route(*addr);
        }
    }

    fn send_ad(&self, inner: &mut RouterInner) {
        if inner.init_counter {
            inner.counter = rand::random();
            inner.init_counter = false;
        } else {
            inner.counter = inner.counter.wrapping_add(1);
        }

        let advskew = self.ctx.demoted_skew(inner.config.advskew);
        let digest = inner.auth.generate(inner.counter);
        let payload = Advertisement::new(
            self.key.vhid,
            inner.config.advbase,
            advskew,
            inner.counter,
            digest,
        )
        .encode();

        for family in AddressFamily::ALL {
            if !inner.has_family(family) {
                continue;
            }

            let packet = OutboundPacket {
                family,
                src: self
                    .link
                    .preferred_source(family)
                    .unwrap_or_else(|| family.unspecified()),
                dst: inner
                    .config
                    .peer_for(family)
                    .unwrap_or_else(|| family.multicast_group()),
                ttl: CARP_DFLTTL,
                payload: payload.clone(),
            };

            let stats = self.ctx.stats();
            match self.link.transport().send_advertisement(&packet) {
                Ok(()) => {
                    inner.stats.adverts_sent += 1;
                    match family {
                        AddressFamily::Inet => CarpStats::inc(&stats.opackets),
                        AddressFamily::Inet6 => CarpStats::inc(&stats.opackets6),
                    }
                    self.record_send(inner, true);
                }
                Err(e) => {
                    inner.stats.send_errors += 1;
                    CarpStats::inc(&stats.oerrors);
                    debug!(vhid = self.key.vhid, interface = %self.key.interface, %family,
                        error = %e, "Failed to send advertisement");
                    self.record_send(inner, false);
                }
            }
        }

        let interval = advertisement_interval(u32::from(inner.config.advbase), advskew);
        self.arm(inner, TimerKind::Advertise, interval);
    }

    fn record_send(&self, inner: &mut RouterInner, ok: bool) {
        if !ok {
            inner.sendad_errors = inner.sendad_errors.saturating_add(1);
            inner.sendad_success = 0;
            if inner.sendad_errors == CARP_SENDAD_MAX_ERRORS && inner.senderr_applied == 0 {
                let adj = self.ctx.senderr_adj();
                self.ctx.demote(adj, "send error");
                inner.senderr_applied = adj;
            }
        } else if inner.sendad_errors >= CARP_SENDAD_MAX_ERRORS {
            inner.sendad_success += 1;
            if inner.sendad_success >= CARP_SENDAD_MIN_SUCCESS {
                if inner.senderr_applied != 0 {
                    self.ctx.demote(inner.senderr_applied.saturating_neg(), "send ok");
                    inner.senderr_applied = 0;
                }
                inner.sendad_errors = 0;
                inner.sendad_success = 0;
            }
        } else {
            inner.sendad_errors = 0;
        }
    }

    fn process_advertisement(
        &self,
        inner: &mut RouterInner,
        advert: &Advertisement,
        src: IpAddr,
        ttl: u8,
    ) {
        let stats = self.ctx.stats();
        let verbose = self.ctx.log_enabled(LogLevel::Debug);

        if advert.vhid != self.key.vhid {
            CarpStats::inc(&stats.badvhid);
            return;
        }

        if self.link.is_local(&src) {
            CarpStats::inc(&stats.badif);
            inner.stats.own_packets += 1;
            if verbose {
                debug!(vhid = self.key.vhid, %src, "dropping advertisement from own address");
            }
            return;
        }

        if advert.version != CARP_VERSION || advert.kind != CARP_ADVERTISEMENT {
            CarpStats::inc(&stats.badver);
            if verbose {
                debug!(vhid = self.key.vhid, version = advert.version, kind = advert.kind,
                    "invalid version or type");
            }
            return;
        }

        let family = AddressFamily::of(&src);
        if inner.config.peer_for(family).is_none() && ttl != CARP_DFLTTL {
            CarpStats::inc(&stats.badttl);
            if verbose {
                debug!(vhid = self.key.vhid, ttl, %src, "received ttl != 255");
            }
            return;
        }

        if !inner.auth.verify(advert.counter, &advert.digest) {
            CarpStats::inc(&stats.badauth);
            inner.stats.bad_auth += 1;
            if verbose {
                debug!(vhid = self.key.vhid, %src, "incorrect hash");
            }
            return;
        }

        inner.stats.adverts_received += 1;
        // No replay protection: the received counter is taken as is.
        inner.counter = advert.counter;
        inner.init_counter = false;
        if inner.sendad_errors < CARP_SENDAD_MAX_ERRORS {
            inner.sendad_errors = 0;
        }

        let own_skew = self.ctx.demoted_skew(inner.config.advskew);
        let own = advertisement_interval(u32::from(inner.config.advbase), own_skew);
        let theirs = advertisement_interval(u32::from(advert.advbase), advert.advskew);

        match inner.state {
            CarpState::Init => {}
            CarpState::Master => {
                // The sender advertises at least as often: yield to it
                if own >= theirs {
                    inner.ad_timer.cancel();
                    self.set_state(inner, CarpState::Backup, "more frequent advertisement received");
                    self.setrun(inner);
                    self.withdraw_routes(inner);
                }
            }
            CarpState::Backup => {
                if self.ctx.preempt() && own < theirs {
                    CarpStats::inc(&stats.preempt);
                    self.master_down(inner, "preempting a slower master");
                    return;
                }

                let timeout = advertisement_interval(3 * u32::from(inner.config.advbase), own_skew);
                if timeout < theirs {
                    self.master_down(inner, "master will time out");
                    return;
                }

                self.setrun(inner);
            }
        }
    }

    fn set_state(&self, inner: &mut RouterInner, to: CarpState, reason: &str) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;

        match to {
            CarpState::Master => inner.stats.master_transitions += 1,
            CarpState::Backup => inner.stats.backup_transitions += 1,
            CarpState::Init => {}
        }

        if self.ctx.log_enabled(LogLevel::Info) {
            info!(vhid = self.key.vhid, interface = %self.key.interface, %from, %to, reason,
                "CARP state change");
        }

        self.ctx.publish(StateEvent {
            interface: self.key.interface.clone(),
            vhid: self.key.vhid,
            from,
            to,
            reason: reason.to_string(),
        });
    }

    fn add_route(&self, addr: IpAddr) {
        if let Err(e) = self.link.transport().add_route(addr) {
            warn!(vhid = self.key.vhid, address = %addr, error = %e, "Failed to install address");
        }
    }

    fn del_route(&self, addr: IpAddr) {
        if let Err(e) = self.link.transport().del_route(addr) {
            warn!(vhid = self.key.vhid, address = %addr, error = %e, "Failed to withdraw address");
        }
    }

    fn withdraw_routes(&self, inner: &RouterInner) {
        for addr in &inner.addresses {
            self.del_route(*addr);
        }
    }

    #[cfg(test)]
    async fn timers_armed(&self) -> (bool, bool) {
        let inner = self.inner.lock().await;
        (inner.ad_timer.is_armed(), inner.md_timer.is_armed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::GlobalConfig;
    use crate::transport::MockNetworkTransport;
    use crate::types::CARP_MAXSKEW;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Harness {
        router: Arc<VirtualRouter>,
        ctx: Arc<GlobalRegistry>,
        link: Arc<Interface>,
        sent: Arc<AtomicUsize>,
        fail_sends: Arc<AtomicBool>,
        routes: Arc<AtomicUsize>,
    }

    fn harness(config: RouterConfig, global: GlobalConfig) -> Harness {
        let sent = Arc::new(AtomicUsize::new(0));
        let fail_sends = Arc::new(AtomicBool::new(false));
        let routes = Arc::new(AtomicUsize::new(0));

        let mut mock = MockNetworkTransport::new();
        mock.expect_is_up().return_const(true);
        mock.expect_local_addresses()
            .returning(|| Ok(vec!["192.0.2.10".parse().unwrap()]));
        {
            let sent = sent.clone();
            let fail_sends = fail_sends.clone();
            mock.expect_send_advertisement().returning(move |_| {
                if fail_sends.load(Ordering::SeqCst) {
                    Err(std::io::Error::other("no buffer space"))
                } else {
                    sent.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }
        mock.expect_send_gratuitous().returning(|_, _| Ok(()));
        {
            let routes = routes.clone();
            mock.expect_add_route().returning(move |_| {
                routes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        {
            let routes = routes.clone();
            mock.expect_del_route().returning(move |_| {
                routes.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let ctx = GlobalRegistry::new(global);
        let link = Arc::new(Interface::new("eth0", Arc::new(mock)));
        let router = VirtualRouter::new(config, link.clone(), ctx.clone());

        Harness {
            router,
            ctx,
            link,
            sent,
            fail_sends,
            routes,
        }
    }

    fn scenario_config(advskew: u8) -> RouterConfig {
        RouterConfig {
            vhid: 7,
            advbase: 1,
            advskew,
            key: b"k".to_vec(),
            ..Default::default()
        }
    }

    fn advert_from(key: &[u8], vhid: u8, advbase: u8, advskew: u8, addrs: &[IpAddr]) -> Advertisement {
        let auth = AuthEngine::prepare(key, vhid, addrs);
        Advertisement::new(vhid, advbase, advskew, 99, auth.generate(99))
    }

    fn vip() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    fn peer() -> IpAddr {
        "192.0.2.20".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_stays_in_init_without_addresses() {
        let h = harness(scenario_config(0), GlobalConfig::default());
        h.router.refresh_link_state().await;
        assert_eq!(h.router.state().await, CarpState::Init);
        assert_eq!(h.router.timers_armed().await, (false, false));

        assert!(h.router.attach_address(vip()).await);
        assert_eq!(h.router.state().await, CarpState::Backup);
        assert_eq!(h.router.timers_armed().await, (false, true));
        assert!(!h.router.attach_address(vip()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_down_timer_promotes() {
        let h = harness(scenario_config(0), GlobalConfig::default());
        h.router.attach_address(vip()).await;
        assert_eq!(h.router.state().await, CarpState::Backup);

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert_eq!(h.router.state().await, CarpState::Backup);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.router.state().await, CarpState::Master);
        assert_eq!(h.sent.load(Ordering::SeqCst), 1);
        assert_eq!(h.routes.load(Ordering::SeqCst), 1);
        assert_eq!(h.router.timers_armed().await, (true, false));

        // Advertisements keep flowing once per advbase
        tokio::time::sleep(Duration::from_millis(2_050)).await;
        assert_eq!(h.sent.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backup_timer_reset_by_advertisement() {
        let h = harness(scenario_config(100), GlobalConfig::default());
        h.router.attach_address(vip()).await;

        let advert = advert_from(b"k", 7, 1, 0, &[vip()]);
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            h.router.on_advertisement_received(&advert, peer(), 255).await;
        }
        assert_eq!(h.router.state().await, CarpState::Backup);
        assert_eq!(h.router.stats().await.adverts_received, 5);

        // Silence: 3 * 1s + 100/256s later the backup takes over
        tokio::time::sleep(Duration::from_millis(3_300)).await;
        assert_eq!(h.router.state().await, CarpState::Backup);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.router.state().await, CarpState::Master);
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_yields_to_more_frequent_advertisement() {
        let h = harness(scenario_config(100), GlobalConfig::default());
        h.router.attach_address(vip()).await;
        h.router.force_state(CarpState::Master).await;
        assert_eq!(h.router.state().await, CarpState::Master);
        assert_eq!(h.routes.load(Ordering::SeqCst), 1);

        // Slower master is ignored
        let slower = advert_from(b"k", 7, 1, 200, &[vip()]);
        h.router.on_advertisement_received(&slower, peer(), 255).await;
        assert_eq!(h.router.state().await, CarpState::Master);

        // Equal interval wins over us
        let equal = advert_from(b"k", 7, 1, 100, &[vip()]);
        h.router.on_advertisement_received(&equal, peer(), 255).await;
        assert_eq!(h.router.state().await, CarpState::Backup);
        assert_eq!(h.routes.load(Ordering::SeqCst), 0);
        assert_eq!(h.router.timers_armed().await, (false, true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_preempt_slower_master() {
        let global = GlobalConfig {
            preempt: true,
            ..Default::default()
        };
        let h = harness(scenario_config(0), global);
        h.router.attach_address(vip()).await;

        let slower = advert_from(b"k", 7, 1, 100, &[vip()]);
        h.router.on_advertisement_received(&slower, peer(), 255).await;
        assert_eq!(h.router.state().await, CarpState::Master);
        assert_eq!(h.ctx.stats().snapshot().preempt, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_will_time_out() {
        let h = harness(scenario_config(0), GlobalConfig::default());
        h.router.attach_address(vip()).await;

        // A master advertising every 4s is slower than our 3s master-down
        let sluggish = advert_from(b"k", 7, 4, 0, &[vip()]);
        h.router.on_advertisement_received(&sluggish, peer(), 255).await;
        assert_eq!(h.router.state().await, CarpState::Master);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_advertisements_are_counted() {
        let h = harness(scenario_config(0), GlobalConfig::default());
        h.router.attach_address(vip()).await;

        let wrong_key = advert_from(b"other", 7, 1, 0, &[vip()]);
        h.router.on_advertisement_received(&wrong_key, peer(), 255).await;

        let good = advert_from(b"k", 7, 1, 0, &[vip()]);
        h.router.on_advertisement_received(&good, peer(), 64).await;
        h.router
            .on_advertisement_received(&good, "192.0.2.10".parse().unwrap(), 255)
            .await;

        let mut old = good;
        old.version = 1;
        h.router.on_advertisement_received(&old, peer(), 255).await;

        let other_vhid = advert_from(b"k", 8, 1, 0, &[vip()]);
        h.router.on_advertisement_received(&other_vhid, peer(), 255).await;

        let snapshot = h.ctx.stats().snapshot();
        assert_eq!(snapshot.badauth, 1);
        assert_eq!(snapshot.badttl, 1);
        assert_eq!(snapshot.badif, 1);
        assert_eq!(snapshot.badver, 1);
        assert_eq!(snapshot.badvhid, 1);

        let stats = h.router.stats().await;
        assert_eq!(stats.bad_auth, 1);
        assert_eq!(stats.own_packets, 1);
        assert_eq!(stats.adverts_received, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unicast_peer_skips_ttl_check() {
        let config = RouterConfig {
            peer: Some("192.0.2.20".parse().unwrap()),
            ..scenario_config(0)
        };
        let h = harness(config, GlobalConfig::default());
        h.router.attach_address(vip()).await;

        let advert = advert_from(b"k", 7, 1, 0, &[vip()]);
        h.router.on_advertisement_received(&advert, peer(), 63).await;
        assert_eq!(h.ctx.stats().snapshot().badttl, 0);
        assert_eq!(h.router.stats().await.adverts_received, 1);
    }

    #[tokio::test]
    async fn test_send_error_demotion_is_edge_triggered() {
        let h = harness(scenario_config(0), GlobalConfig::default());

        for _ in 0..2 {
            h.router.record_send_result(false).await;
        }
        assert_eq!(h.ctx.demotion(), 0);

        h.router.record_send_result(false).await;
        assert_eq!(h.ctx.demotion(), CARP_MAXSKEW);

        for _ in 0..5 {
            h.router.record_send_result(false).await;
        }
        assert_eq!(h.ctx.demotion(), CARP_MAXSKEW);

        h.router.record_send_result(true).await;
        h.router.record_send_result(true).await;
        h.router.record_send_result(false).await;
        h.router.record_send_result(true).await;
        h.router.record_send_result(true).await;
        assert_eq!(h.ctx.demotion(), CARP_MAXSKEW);

        h.router.record_send_result(true).await;
        assert_eq!(h.ctx.demotion(), 0);

        for _ in 0..3 {
            h.router.record_send_result(true).await;
        }
        assert_eq!(h.ctx.demotion(), 0);
    }

    #[tokio::test]
    async fn test_interleaved_failures_never_demote() {
        let h = harness(scenario_config(0), GlobalConfig::default());
        for _ in 0..10 {
            h.router.record_send_result(false).await;
            h.router.record_send_result(false).await;
            h.router.record_send_result(true).await;
        }
        assert_eq!(h.ctx.demotion(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_transport_demotes_master() {
        let h = harness(scenario_config(0), GlobalConfig::default());
        h.router.attach_address(vip()).await;
        h.router.force_state(CarpState::Master).await;

        h.fail_sends.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        assert_eq!(h.ctx.demotion(), CARP_MAXSKEW);
        assert_eq!(h.router.status(false).await.effective_advskew, CARP_MAXSKEW as u8);

        // Demoted interval is 1 + 240/256s; three good sends undo the demotion
        h.fail_sends.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(h.ctx.demotion(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_down_suppresses_once() {
        let h = harness(scenario_config(0), GlobalConfig::default());
        h.router.attach_address(vip()).await;
        h.router.force_state(CarpState::Master).await;

        h.link.set_up(false);
        h.router.refresh_link_state().await;
        h.router.refresh_link_state().await;
        assert_eq!(h.router.state().await, CarpState::Init);
        assert_eq!(h.ctx.demotion(), CARP_MAXSKEW);
        assert_eq!(h.routes.load(Ordering::SeqCst), 0);
        assert_eq!(h.router.timers_armed().await, (false, false));

        h.link.set_up(true);
        h.router.refresh_link_state().await;
        assert_eq!(h.ctx.demotion(), 0);
        assert_eq!(h.router.state().await, CarpState::Backup);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_returns_demotion() {
        let h = harness(scenario_config(0), GlobalConfig::default());
        h.router.attach_address(vip()).await;

        h.link.set_up(false);
        h.router.on_interface_down_or_disallowed().await;
        for _ in 0..3 {
            h.router.record_send_result(false).await;
        }
        assert_eq!(h.ctx.demotion(), 2 * CARP_MAXSKEW);

        let key = h.router.key().clone();
        assert!(h.ctx.lookup(&key).is_some());
        h.router.destroy().await;
        assert_eq!(h.ctx.demotion(), 0);
        assert!(h.ctx.lookup(&key).is_none());
        assert_eq!(h.router.timers_armed().await, (false, false));

        // Destroyed routers ignore further input
        let advert = advert_from(b"k", 7, 1, 0, &[vip()]);
        h.router.on_advertisement_received(&advert, peer(), 255).await;
        assert_eq!(h.router.stats().await.adverts_received, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_events_published() {
        let h = harness(scenario_config(0), GlobalConfig::default());
        let mut events = h.ctx.subscribe();
        h.router.attach_address(vip()).await;
        h.router.force_state(CarpState::Master).await;

        let first = events.recv().await.unwrap();
        assert_eq!((first.from, first.to), (CarpState::Init, CarpState::Backup));
        assert_eq!(first.reason, "initialization complete");

        let second = events.recv().await.unwrap();
        assert_eq!((second.from, second.to), (CarpState::Backup, CarpState::Master));
        assert_eq!(second.reason, "user requested");
    }

    #[tokio::test(start_paused = true)]
    async fn test_detaching_last_address_returns_to_init() {
        let h = harness(scenario_config(0), GlobalConfig::default());
        h.router.attach_address(vip()).await;
        h.router.force_state(CarpState::Master).await;

        assert!(h.router.detach_address(vip()).await);
        assert_eq!(h.router.state().await, CarpState::Init);
        assert_eq!(h.routes.load(Ordering::SeqCst), 0);
        assert!(!h.router.detach_address(vip()).await);
    }
}
