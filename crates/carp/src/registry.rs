//! Process-wide CARP context.
//!
//! One [`GlobalRegistry`] is created per process (or per simulated host) and
//! handed to every interface group and virtual router. It owns the tunable
//! knobs, the global demotion counter, protocol statistics, the table of live
//! routers and the deferred "advertise now" task.

use crate::state_machine::VirtualRouter;
use crate::types::{CARP_MAXSKEW, RouterKey, StateEvent};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Verbosity of protocol logging, on top of the subscriber's own filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off = 0,
    Info = 1,
    Debug = 2,
}

impl From<u8> for LogLevel {
    fn from(value: u8) -> Self {
        match value {
            0 => LogLevel::Off,
            1 => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }
}

/// Initial values of the global knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Accept and send advertisements at all
    pub allow: bool,

    /// Let a backup take over from a slower master
    pub preempt: bool,

    pub log_level: LogLevel,

    /// Starting value of the demotion counter
    pub demotion: i32,

    /// Demotion applied after repeated send failures
    pub senderr_demotion_factor: i32,

    /// Demotion applied while an interface is down
    pub ifdown_demotion_factor: i32,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            allow: true,
            preempt: false,
            log_level: LogLevel::Info,
            demotion: 0,
            senderr_demotion_factor: CARP_MAXSKEW,
            ifdown_demotion_factor: CARP_MAXSKEW,
        }
    }
}

/// Protocol counters shared by every router of the process
#[derive(Debug, Default)]
pub struct CarpStats {
    pub ipackets: AtomicU64,
    pub ipackets6: AtomicU64,
    pub badsum: AtomicU64,
    pub badttl: AtomicU64,
    pub badlen: AtomicU64,
    pub badvhid: AtomicU64,
    pub badver: AtomicU64,
    pub badauth: AtomicU64,
    pub badif: AtomicU64,
    pub opackets: AtomicU64,
    pub opackets6: AtomicU64,
    pub oerrors: AtomicU64,
    pub preempt: AtomicU64,
}

/// Point-in-time copy of [`CarpStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub ipackets: u64,
    pub ipackets6: u64,
    pub badsum: u64,
    pub badttl: u64,
    pub badlen: u64,
    pub badvhid: u64,
    pub badver: u64,
    pub badauth: u64,
    pub badif: u64,
    pub opackets: u64,
    pub opackets6: u64,
    pub oerrors: u64,
    pub preempt: u64,
}

impl CarpStats {
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            ipackets: load(&self.ipackets),
            ipackets6: load(&self.ipackets6),
            badsum: load(&self.badsum),
            badttl: load(&self.badttl),
            badlen: load(&self.badlen),
            badvhid: load(&self.badvhid),
            badver: load(&self.badver),
            badauth: load(&self.badauth),
            badif: load(&self.badif),
            opackets: load(&self.opackets),
            opackets6: load(&self.opackets6),
            oerrors: load(&self.oerrors),
            preempt: load(&self.preempt),
        }
    }
}

/// Process-wide CARP state
pub struct GlobalRegistry {
    allow: AtomicBool,
    preempt: AtomicBool,
    log_level: AtomicU8,
    demotion: AtomicI32,
    senderr_adj: AtomicI32,
    ifdown_adj: AtomicI32,
    stats: CarpStats,
    routers: DashMap<RouterKey, Weak<VirtualRouter>>,
    events: broadcast::Sender<StateEvent>,
    send_all: Arc<Notify>,
    send_all_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for GlobalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalRegistry")
            .field("allow", &self.allowed())
            .field("preempt", &self.preempt())
            .field("demotion", &self.demotion())
            .field("routers", &self.routers.len())
            .finish_non_exhaustive()
    }
}

impl GlobalRegistry {
    /// Create the registry and start its deferred send task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: GlobalConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let registry = Arc::new(Self {
            allow: AtomicBool::new(config.allow),
            preempt: AtomicBool::new(config.preempt),
            log_level: AtomicU8::new(config.log_level as u8),
            demotion: AtomicI32::new(config.demotion),
            senderr_adj: AtomicI32::new(config.senderr_demotion_factor),
            ifdown_adj: AtomicI32::new(config.ifdown_demotion_factor),
            stats: CarpStats::default(),
            routers: DashMap::new(),
            events,
            send_all: Arc::new(Notify::new()),
            send_all_task: Mutex::new(None),
        });

        let task = tokio::spawn(send_all_loop(
            Arc::downgrade(&registry),
            registry.send_all.clone(),
        ));
        *registry
            .send_all_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        registry
    }

    pub fn allowed(&self) -> bool {
        self.allow.load(Ordering::Acquire)
    }

    /// Enable or disable the protocol and push the change to every router.
    pub async fn set_allowed(&self, allowed: bool) {
        if self.allow.swap(allowed, Ordering::AcqRel) == allowed {
            return;
        }
        if self.log_enabled(LogLevel::Info) {
            info!(allowed, "CARP protocol allowance changed");
        }
        for router in self.routers() {
            router.refresh_link_state().await;
        }
    }

    pub fn preempt(&self) -> bool {
        self.preempt.load(Ordering::Relaxed)
    }

    pub fn set_preempt(&self, preempt: bool) {
        self.preempt.store(preempt, Ordering::Relaxed);
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::from(self.log_level.load(Ordering::Relaxed))
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.log_level.store(level as u8, Ordering::Relaxed);
    }

    pub fn log_enabled(&self, level: LogLevel) -> bool {
        self.log_level() >= level
    }

    /// Current demotion counter, unclamped.
    pub fn demotion(&self) -> i32 {
        self.demotion.load(Ordering::Acquire)
    }

    /// Add `delta` to the demotion counter and schedule advertisements from
    /// every master so peers see the new skew. The counter saturates at the
    /// `i32` bounds.
    pub fn demote(&self, delta: i32, reason: &str) {
        if delta == 0 {
            return;
        }
        let previous = self.update_demotion(|current| current.saturating_add(delta));
        self.demotion_changed(previous, reason);
    }

    /// Set the counter to an absolute value. The difference to the current
    /// value is applied in one atomic step.
    pub fn set_demotion(&self, value: i32) {
        let previous = self.update_demotion(|_| value);
        if previous != value {
            self.demotion_changed(previous, "administratively set");
        }
    }

    fn update_demotion(&self, f: impl Fn(i32) -> i32) -> i32 {
        match self
            .demotion
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(f(current))
            }) {
            Ok(previous) | Err(previous) => previous,
        }
    }

    fn demotion_changed(&self, previous: i32, reason: &str) {
        if self.log_enabled(LogLevel::Info) {
            let demotion = self.demotion();
            let delta = i64::from(demotion) - i64::from(previous);
            info!(delta, demotion, reason, "demotion adjusted");
        }
        self.send_all.notify_one();
    }

    /// Skew actually advertised: `advskew` plus demotion, clamped.
    pub fn demoted_skew(&self, advskew: u8) -> u8 {
        i32::from(advskew)
            .saturating_add(self.demotion())
            .clamp(0, CARP_MAXSKEW) as u8
    }

    pub fn senderr_adj(&self) -> i32 {
        self.senderr_adj.load(Ordering::Relaxed)
    }

    pub fn set_senderr_adj(&self, adj: i32) {
        self.senderr_adj.store(adj, Ordering::Relaxed);
    }

    pub fn ifdown_adj(&self) -> i32 {
        self.ifdown_adj.load(Ordering::Relaxed)
    }

    pub fn set_ifdown_adj(&self, adj: i32) {
        self.ifdown_adj.store(adj, Ordering::Relaxed);
    }

    pub fn stats(&self) -> &CarpStats {
        &self.stats
    }

    /// Subscribe to state change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: StateEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn register(&self, key: RouterKey, router: Weak<VirtualRouter>) {
        self.routers.insert(key, router);
    }

    pub(crate) fn unregister(&self, key: &RouterKey) {
        self.routers.remove(key);
    }

    /// Look up a live router.
    pub fn lookup(&self, key: &RouterKey) -> Option<Arc<VirtualRouter>> {
        self.routers.get(key).and_then(|entry| entry.value().upgrade())
    }

    /// Every live router, sorted by key.
    pub fn routers(&self) -> Vec<Arc<VirtualRouter>> {
        let mut routers: Vec<_> = self
            .routers
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        routers.sort_by(|a, b| a.key().cmp(b.key()));
        routers
    }

    /// Request an immediate advertisement from every master. Runs on the
    /// registry's own task, never on the caller's.
    pub fn schedule_send_all(&self) {
        self.send_all.notify_one();
    }

    /// Stop the deferred send task.
    pub async fn shutdown(&self) {
        let task = self
            .send_all_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for GlobalRegistry {
    fn drop(&mut self) {
        let task = self
            .send_all_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

async fn send_all_loop(registry: Weak<GlobalRegistry>, notify: Arc<Notify>) {
    loop {
        notify.notified().await;
        let Some(registry) = registry.upgrade() else {
            break;
        };
        let routers = registry.routers();
        debug!(routers = routers.len(), "sending advertisements from all masters");
        for router in routers {
            router.send_if_master().await;
        }
    }
}
