//! Administrative control surface.
//!
//! [`ControlPlane`] maps interface names to [`InterfaceGroup`]s and exposes
//! get/set/list style operations on virtual routers. All input is validated
//! here, so invalid values never reach a state machine. A failed `set` leaves
//! no partially created group or router behind.

use crate::group::InterfaceGroup;
use crate::interface::Interface;
use crate::registry::GlobalRegistry;
use crate::state_machine::VirtualRouter;
use crate::transport::{InboundFrame, NetworkProvider};
use crate::types::{CARP_KEY_LEN, CarpState, CarpStatus, RouterConfig};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

/// Control surface errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid vhid {0}: must be between 1 and 255")]
    InvalidVhid(u32),

    #[error("invalid advbase {0}: must be between 1 and 255")]
    InvalidAdvbase(u32),

    #[error("invalid advskew {0}: must be below 255")]
    InvalidAdvskew(u32),

    #[error("key is {0} bytes, at most 20 allowed")]
    KeyTooLong(usize),

    #[error("no vhid {vhid} on {interface}")]
    NoSuchVhid { interface: String, vhid: u32 },

    #[error("no CARP configuration on {0}")]
    NoSuchInterface(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<ControlError> for common::Error {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::Io(e) => common::Error::Io(e),
            other => common::Error::carp(other.to_string()),
        }
    }
}

/// Fields of a `set` request; `None` leaves the current value alone
#[derive(Debug, Clone, Default)]
pub struct CarpRequest {
    /// Force Backup or Master
    pub state: Option<CarpState>,
    pub advbase: Option<u32>,
    pub advskew: Option<u32>,
    pub key: Option<Vec<u8>>,
    /// Virtual addresses to attach
    pub addresses: Vec<IpAddr>,
    pub peer: Option<Ipv4Addr>,
    pub peer6: Option<Ipv6Addr>,
}

impl CarpRequest {
    fn validate(&self) -> Result<(), ControlError> {
        if let Some(advbase) = self.advbase {
            if advbase == 0 || advbase > 255 {
                return Err(ControlError::InvalidAdvbase(advbase));
            }
        }
        if let Some(advskew) = self.advskew {
            if advskew >= 255 {
                return Err(ControlError::InvalidAdvskew(advskew));
            }
        }
        if let Some(key) = &self.key {
            if key.len() > CARP_KEY_LEN {
                return Err(ControlError::KeyTooLong(key.len()));
            }
        }
        Ok(())
    }

    /// Overlay the request onto `config`. Values were validated beforehand.
    fn apply(&self, config: &mut RouterConfig) {
        if let Some(advbase) = self.advbase {
            config.advbase = advbase as u8;
        }
        if let Some(advskew) = self.advskew {
            config.advskew = advskew as u8;
        }
        if let Some(key) = &self.key {
            config.key = key.clone();
        }
        if self.peer.is_some() {
            config.peer = self.peer;
        }
        if self.peer6.is_some() {
            config.peer6 = self.peer6;
        }
    }
}

fn check_vhid(vhid: u32) -> Result<u8, ControlError> {
    match u8::try_from(vhid) {
        Ok(v) if v != 0 => Ok(v),
        _ => Err(ControlError::InvalidVhid(vhid)),
    }
}

/// Entry point for configuration and packet input
pub struct ControlPlane {
    ctx: Arc<GlobalRegistry>,
    provider: Arc<dyn NetworkProvider>,
    groups: Mutex<HashMap<String, Arc<InterfaceGroup>>>,
}

impl ControlPlane {
    pub fn new(ctx: Arc<GlobalRegistry>, provider: Arc<dyn NetworkProvider>) -> Self {
        Self {
            ctx,
            provider,
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<GlobalRegistry> {
        &self.ctx
    }

    /// Create or update the virtual router `vhid` on `interface`.
    pub async fn set(
        &self,
        interface: &str,
        vhid: u32,
        request: CarpRequest,
    ) -> Result<CarpStatus, ControlError> {
        let vhid = check_vhid(vhid)?;
        request.validate()?;

        let mut groups = self.groups.lock().await;

        let (group, new_group) = match groups.get(interface) {
            Some(group) => (group.clone(), false),
            None => {
                let transport = self.provider.open(interface)?;
                let link = Arc::new(Interface::new(interface, transport));
                (Arc::new(InterfaceGroup::new(link, self.ctx.clone())), true)
            }
        };

        let (router, new_router) = match group.router(vhid).await {
            Some(router) => {
                let mut config = router.config().await;
                request.apply(&mut config);
                router.reconfigure(config).await;
                (router, false)
            }
            None => {
                let mut config = RouterConfig::new(vhid);
                request.apply(&mut config);
                let router =
                    VirtualRouter::new(config, group.interface().clone(), self.ctx.clone());
                if let Err(e) = group.add_router(router.clone()).await {
                    router.destroy().await;
                    return Err(e.into());
                }
                (router, true)
            }
        };

        for addr in &request.addresses {
            if let Err(e) = group.attach_address(&router, *addr).await {
                if new_router {
                    group.remove_router(vhid).await;
                }
                if new_group {
                    group.teardown().await;
                }
                return Err(e.into());
            }
        }

        if new_group {
            groups.insert(interface.to_string(), group);
        }
        drop(groups);

        if new_router {
            info!(interface, vhid, "Created virtual router");
            router.refresh_link_state().await;
        }
        if let Some(state) = request.state {
            router.force_state(state).await;
        }

        Ok(router.status(true).await)
    }

    /// Status of one router. The key is only returned to privileged callers.
    pub async fn get(
        &self,
        interface: &str,
        vhid: u32,
        privileged: bool,
    ) -> Result<CarpStatus, ControlError> {
        let router = self.find(interface, vhid).await?;
        Ok(router.status(privileged).await)
    }

    /// Status of every router on `interface`, in creation order.
    pub async fn list(
        &self,
        interface: &str,
        privileged: bool,
    ) -> Result<Vec<CarpStatus>, ControlError> {
        let group = self.group(interface).await?;
        let mut statuses = Vec::new();
        for router in group.routers().await {
            statuses.push(router.status(privileged).await);
        }
        Ok(statuses)
    }

    /// Attach one virtual address to an existing router.
    pub async fn attach_address(
        &self,
        interface: &str,
        vhid: u32,
        addr: IpAddr,
    ) -> Result<bool, ControlError> {
        let vhid8 = check_vhid(vhid)?;
        let groups = self.groups.lock().await;
        let group = groups
            .get(interface)
            .cloned()
            .ok_or_else(|| ControlError::NoSuchInterface(interface.to_string()))?;
        let router = group.router(vhid8).await.ok_or(ControlError::NoSuchVhid {
            interface: interface.to_string(),
            vhid,
        })?;
        Ok(group.attach_address(&router, addr).await?)
    }

    /// Detach one virtual address. Detaching the last address destroys the
    /// router, and the group with it once no routers remain.
    pub async fn detach_address(
        &self,
        interface: &str,
        vhid: u32,
        addr: IpAddr,
    ) -> Result<bool, ControlError> {
        let vhid8 = check_vhid(vhid)?;
        let mut groups = self.groups.lock().await;
        let group = groups
            .get(interface)
            .cloned()
            .ok_or_else(|| ControlError::NoSuchInterface(interface.to_string()))?;
        let router = group.router(vhid8).await.ok_or(ControlError::NoSuchVhid {
            interface: interface.to_string(),
            vhid,
        })?;

        let removed = group.detach_address(&router, addr).await;
        if removed && router.addresses().await.is_empty() {
            group.remove_router(vhid8).await;
            info!(interface, vhid, "Last address detached, destroyed virtual router");
            if group.is_empty().await {
                group.teardown().await;
                groups.remove(interface);
            }
        }
        Ok(removed)
    }

    /// Destroy a router; the interface group goes away with its last router.
    pub async fn destroy(&self, interface: &str, vhid: u32) -> Result<(), ControlError> {
        let vhid8 = check_vhid(vhid)?;
        let mut groups = self.groups.lock().await;
        let group = groups
            .get(interface)
            .cloned()
            .ok_or_else(|| ControlError::NoSuchInterface(interface.to_string()))?;

        if group.remove_router(vhid8).await.is_none() {
            return Err(ControlError::NoSuchVhid {
                interface: interface.to_string(),
                vhid,
            });
        }
        info!(interface, vhid, "Destroyed virtual router");

        if group.is_empty().await {
            group.teardown().await;
            groups.remove(interface);
        }
        Ok(())
    }

    /// The interface disappeared: drop everything configured on it.
    pub async fn interface_removed(&self, interface: &str) {
        let group = self.groups.lock().await.remove(interface);
        if let Some(group) = group {
            info!(interface, "Interface removed, destroying its virtual routers");
            group.teardown().await;
        }
    }

    pub async fn set_link_state(&self, interface: &str, up: bool) -> Result<(), ControlError> {
        self.group(interface).await?.set_link_state(up).await;
        Ok(())
    }

    pub async fn set_local_addresses(
        &self,
        interface: &str,
        addrs: Vec<IpAddr>,
    ) -> Result<(), ControlError> {
        self.group(interface).await?.set_local_addresses(addrs).await;
        Ok(())
    }

    /// Deliver a received frame. Frames for unknown interfaces are dropped.
    pub async fn input(&self, interface: &str, frame: &InboundFrame) {
        let group = self.groups.lock().await.get(interface).cloned();
        if let Some(group) = group {
            group.forward(frame).await;
        }
    }

    /// Interfaces that currently host virtual routers, sorted.
    pub async fn interfaces(&self) -> Vec<String> {
        let mut names: Vec<_> = self.groups.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Destroy every router and stop background work.
    pub async fn shutdown(&self) {
        let groups: Vec<_> = self.groups.lock().await.drain().map(|(_, g)| g).collect();
        for group in groups {
            group.teardown().await;
        }
        self.ctx.shutdown().await;
    }

    async fn group(&self, interface: &str) -> Result<Arc<InterfaceGroup>, ControlError> {
        self.groups
            .lock()
            .await
            .get(interface)
            .cloned()
            .ok_or_else(|| ControlError::NoSuchInterface(interface.to_string()))
    }

    async fn find(&self, interface: &str, vhid: u32) -> Result<Arc<VirtualRouter>, ControlError> {
        let vhid8 = check_vhid(vhid)?;
        self.group(interface)
            .await?
            .router(vhid8)
            .await
            .ok_or(ControlError::NoSuchVhid {
                interface: interface.to_string(),
                vhid,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::GlobalConfig;
    use crate::transport::{MockNetworkTransport, NetworkTransport};

    struct MockProvider {
        fail_join: bool,
    }

    impl NetworkProvider for MockProvider {
        fn open(&self, interface: &str) -> io::Result<Arc<dyn NetworkTransport>> {
            if interface == "missing0" {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such device"));
            }
            let mut mock = MockNetworkTransport::new();
            mock.expect_is_up().return_const(true);
            mock.expect_local_addresses().returning(|| Ok(Vec::new()));
            mock.expect_set_promiscuous().returning(|_| Ok(()));
            if self.fail_join {
                mock.expect_join_multicast()
                    .returning(|_| Err(io::Error::other("join failed")));
            } else {
                mock.expect_join_multicast().returning(|_| Ok(()));
            }
            mock.expect_leave_multicast().returning(|_| Ok(()));
            mock.expect_send_advertisement().returning(|_| Ok(()));
            mock.expect_send_gratuitous().returning(|_, _| Ok(()));
            mock.expect_add_route().returning(|_| Ok(()));
            mock.expect_del_route().returning(|_| Ok(()));
            Ok(Arc::new(mock))
        }
    }

    fn control(fail_join: bool) -> ControlPlane {
        ControlPlane::new(
            GlobalRegistry::new(GlobalConfig::default()),
            Arc::new(MockProvider { fail_join }),
        )
    }

    fn request(addr: &str) -> CarpRequest {
        CarpRequest {
            advskew: Some(100),
            key: Some(b"k".to_vec()),
            addresses: vec![addr.parse().unwrap()],
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation() {
        let control = control(false);

        assert!(matches!(
            control.set("eth0", 0, CarpRequest::default()).await,
            Err(ControlError::InvalidVhid(0))
        ));
        assert!(matches!(
            control.set("eth0", 256, CarpRequest::default()).await,
            Err(ControlError::InvalidVhid(256))
        ));

        let bad_skew = CarpRequest {
            advskew: Some(255),
            ..Default::default()
        };
        assert!(matches!(
            control.set("eth0", 1, bad_skew).await,
            Err(ControlError::InvalidAdvskew(255))
        ));

        let bad_base = CarpRequest {
            advbase: Some(256),
            ..Default::default()
        };
        assert!(matches!(
            control.set("eth0", 1, bad_base).await,
            Err(ControlError::InvalidAdvbase(256))
        ));

        let long_key = CarpRequest {
            key: Some(vec![0u8; 21]),
            ..Default::default()
        };
        assert!(matches!(
            control.set("eth0", 1, long_key).await,
            Err(ControlError::KeyTooLong(21))
        ));

        assert!(control.interfaces().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_get_list() {
        let control = control(false);
        let status = control.set("eth0", 7, request("10.0.0.1")).await.unwrap();
        assert_eq!(status.state, CarpState::Backup);
        assert_eq!(status.advskew, 100);
        assert_eq!(status.addresses, vec!["10.0.0.1".parse::<Ipv4Addr>().unwrap()]);

        control.set("eth0", 3, request("10.0.0.3")).await.unwrap();

        let unprivileged = control.get("eth0", 7, false).await.unwrap();
        assert_eq!(unprivileged.key, None);
        let privileged = control.get("eth0", 7, true).await.unwrap();
        assert_eq!(privileged.key, Some(b"k".to_vec()));

        let vhids: Vec<u8> = control
            .list("eth0", false)
            .await
            .unwrap()
            .iter()
            .map(|s| s.vhid)
            .collect();
        assert_eq!(vhids, vec![7, 3]);

        assert!(matches!(
            control.get("eth0", 9, false).await,
            Err(ControlError::NoSuchVhid { vhid: 9, .. })
        ));
        assert!(matches!(
            control.list("eth1", false).await,
            Err(ControlError::NoSuchInterface(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_and_force_state() {
        let control = control(false);
        control.set("eth0", 7, request("10.0.0.1")).await.unwrap();

        let update = CarpRequest {
            advskew: Some(20),
            state: Some(CarpState::Master),
            ..Default::default()
        };
        let status = control.set("eth0", 7, update).await.unwrap();
        assert_eq!(status.advskew, 20);
        assert_eq!(status.state, CarpState::Master);
        assert_eq!(status.key, Some(b"k".to_vec()));

        let demote = CarpRequest {
            state: Some(CarpState::Backup),
            ..Default::default()
        };
        let status = control.set("eth0", 7, demote).await.unwrap();
        assert_eq!(status.state, CarpState::Backup);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_set_leaves_nothing_behind() {
        let control = control(true);
        let err = control.set("eth0", 7, request("10.0.0.1")).await.unwrap_err();
        assert!(matches!(err, ControlError::Io(_)));
        assert!(control.interfaces().await.is_empty());
        assert!(control.context().routers().is_empty());
        assert_eq!(control.context().demotion(), 0);

        let err = control
            .set("missing0", 1, CarpRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Io(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_drops_empty_group() {
        let control = control(false);
        control.set("eth0", 7, request("10.0.0.1")).await.unwrap();
        control.set("eth0", 8, request("10.0.0.2")).await.unwrap();

        control.destroy("eth0", 7).await.unwrap();
        assert_eq!(control.interfaces().await, vec!["eth0".to_string()]);
        assert!(matches!(
            control.destroy("eth0", 7).await,
            Err(ControlError::NoSuchVhid { .. })
        ));

        control.destroy("eth0", 8).await.unwrap();
        assert!(control.interfaces().await.is_empty());
        assert!(control.context().routers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_and_detach_address() {
        let control = control(false);
        control.set("eth0", 7, request("10.0.0.1")).await.unwrap();

        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert!(control.attach_address("eth0", 7, v6).await.unwrap());
        assert!(!control.attach_address("eth0", 7, v6).await.unwrap());
        assert_eq!(control.get("eth0", 7, false).await.unwrap().addresses6.len(), 1);

        assert!(control.detach_address("eth0", 7, v6).await.unwrap());
        assert!(matches!(
            control.attach_address("eth0", 9, v6).await,
            Err(ControlError::NoSuchVhid { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_detach_destroys_router_and_group() {
        let control = control(false);
        control.set("eth0", 7, request("10.0.0.1")).await.unwrap();
        control.set("eth0", 8, request("10.0.0.2")).await.unwrap();

        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(control.detach_address("eth0", 7, addr).await.unwrap());
        assert!(matches!(
            control.get("eth0", 7, false).await,
            Err(ControlError::NoSuchVhid { vhid: 7, .. })
        ));
        assert_eq!(control.interfaces().await, vec!["eth0".to_string()]);
        assert_eq!(control.context().routers().len(), 1);

        let addr: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(control.detach_address("eth0", 8, addr).await.unwrap());
        assert!(matches!(
            control.get("eth0", 8, false).await,
            Err(ControlError::NoSuchInterface(_))
        ));
        assert!(control.interfaces().await.is_empty());
        assert!(control.context().routers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interface_removed_and_shutdown() {
        let control = control(false);
        control.set("eth0", 7, request("10.0.0.1")).await.unwrap();
        control.set("eth1", 7, request("10.0.1.1")).await.unwrap();

        control.interface_removed("eth0").await;
        assert_eq!(control.interfaces().await, vec!["eth1".to_string()]);

        control.shutdown().await;
        assert!(control.interfaces().await.is_empty());
        assert!(control.context().routers().is_empty());
    }

    #[test]
    fn test_error_converts_to_common() {
        let err: common::Error = ControlError::InvalidVhid(0).into();
        assert!(matches!(err, common::Error::Carp(_)));
    }
}
