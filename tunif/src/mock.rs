//! Mock platform for testing
//!
//! [`MockPlatform`] implements [`TunPlatform`] without touching the OS. It
//! hands out increasing fake descriptors, records every establish, release,
//! readiness wait and exemption as a [`MockEvent`], and tracks how many
//! handles are live at once. Failure switches simulate permission denial,
//! device errors and rejected DNS servers.
//!
//! Clones share state, so a test can keep one clone for assertions while the
//! manager owns another.
//!
//! # Example
//!
//! ```
//! use tunif::mock::{MockEvent, MockPlatform};
//! use tunif::{TunnelConfig, TunnelInterfaceManager};
//!
//! let platform = MockPlatform::new();
//! let manager = TunnelInterfaceManager::new(platform.clone(), TunnelConfig::default());
//!
//! assert!(manager.ensure_open());
//! manager.close();
//!
//! assert_eq!(platform.establish_count(), 1);
//! assert_eq!(platform.live_handles(), 0);
//! assert!(matches!(platform.events().last(), Some(MockEvent::Released(_))));
//! ```

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::platform::{InterfaceBuilder, RawDescriptor, TunHandle, TunPlatform};

/// First descriptor handed out by a fresh mock
const FIRST_FD: RawDescriptor = 100;

/// Something the mock platform observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    /// An interface was materialized
    Established(RawDescriptor),
    /// A handle was dropped
    Released(RawDescriptor),
    /// The readiness wait ran for a handle
    ReadyWait {
        fd: RawDescriptor,
        has_ipv6_routes: bool,
    },
    /// A socket was exempted from the tunnel
    Exempted(RawDescriptor),
}

/// Everything the manager put into one builder
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceRequest {
    pub addresses: Vec<(IpAddr, u8)>,
    pub dns_servers: Vec<IpAddr>,
    pub routes: Vec<IpNet>,
    pub disallowed_apps: Vec<String>,
    pub mtu: Option<u16>,
    pub blocking: Option<bool>,
}

#[derive(Debug)]
struct MockState {
    deny_permission: bool,
    fail_establish: bool,
    reject_routes: bool,
    refuse_apps: bool,
    refuse_exemptions: bool,
    rejected_dns: HashSet<IpAddr>,
    ready_delay: Option<Duration>,

    next_fd: RawDescriptor,
    live: usize,
    peak_live: usize,
    establish_calls: usize,
    events: Vec<MockEvent>,
    last_request: Option<InterfaceRequest>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            deny_permission: false,
            fail_establish: false,
            reject_routes: false,
            refuse_apps: false,
            refuse_exemptions: false,
            rejected_dns: HashSet::new(),
            ready_delay: None,
            next_fd: FIRST_FD,
            live: 0,
            peak_live: 0,
            establish_calls: 0,
            events: Vec::new(),
            last_request: None,
        }
    }
}

/// Deterministic fake platform
#[derive(Debug, Clone, Default)]
pub struct MockPlatform {
    state: Arc<Mutex<MockState>>,
}

impl MockPlatform {
    /// Create a platform that grants permission and accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the capability check fail
    pub fn deny_permission(&self, deny: bool) {
        self.state.lock().deny_permission = deny;
    }

    /// Make `establish` fail
    pub fn fail_establish(&self, fail: bool) {
        self.state.lock().fail_establish = fail;
    }

    /// Make `add_route` fail
    pub fn reject_routes(&self, reject: bool) {
        self.state.lock().reject_routes = reject;
    }

    /// Make `add_disallowed_application` fail
    pub fn refuse_apps(&self, refuse: bool) {
        self.state.lock().refuse_apps = refuse;
    }

    /// Make `exempt_socket` fail
    pub fn refuse_exemptions(&self, refuse: bool) {
        self.state.lock().refuse_exemptions = refuse;
    }

    /// Reject a DNS server address in every future request
    pub fn reject_dns(&self, address: IpAddr) {
        self.state.lock().rejected_dns.insert(address);
    }

    /// Stop rejecting DNS server addresses
    pub fn accept_all_dns(&self) {
        self.state.lock().rejected_dns.clear();
    }

    /// Sleep this long inside every readiness wait
    pub fn set_ready_delay(&self, delay: Option<Duration>) {
        self.state.lock().ready_delay = delay;
    }

    /// Recorded events, oldest first
    pub fn events(&self) -> Vec<MockEvent> {
        self.state.lock().events.clone()
    }

    /// Forget recorded events
    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Number of successful `establish` calls
    pub fn establish_count(&self) -> usize {
        self.state.lock().establish_calls
    }

    /// Handles currently alive
    pub fn live_handles(&self) -> usize {
        self.state.lock().live
    }

    /// Most handles ever alive at the same time
    pub fn peak_live_handles(&self) -> usize {
        self.state.lock().peak_live
    }

    /// The request assembled by the most recent builder that reached `establish`
    pub fn last_request(&self) -> Option<InterfaceRequest> {
        self.state.lock().last_request.clone()
    }

    /// How often `fd` was released
    pub fn release_count(&self, fd: RawDescriptor) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|event| **event == MockEvent::Released(fd))
            .count()
    }
}

impl TunPlatform for MockPlatform {
    type Handle = MockHandle;
    type Builder = MockBuilder;

    fn has_tunnel_permission(&self) -> bool {
        !self.state.lock().deny_permission
    }

    fn new_builder(&self) -> MockBuilder {
        MockBuilder {
            state: Arc::clone(&self.state),
            request: InterfaceRequest::default(),
        }
    }

    fn wait_until_ready(&self, handle: &MockHandle, has_ipv6_routes: bool) {
        let delay = {
            let mut state = self.state.lock();
            state.events.push(MockEvent::ReadyWait {
                fd: handle.fd,
                has_ipv6_routes,
            });
            state.ready_delay
        };

        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
    }

    fn exempt_socket(&self, socket: RawDescriptor) -> bool {
        let mut state = self.state.lock();
        if state.refuse_exemptions {
            return false;
        }
        state.events.push(MockEvent::Exempted(socket));
        true
    }
}

/// Builder half of the mock
#[derive(Debug)]
pub struct MockBuilder {
    state: Arc<Mutex<MockState>>,
    request: InterfaceRequest,
}

impl InterfaceBuilder for MockBuilder {
    type Handle = MockHandle;

    fn add_address(&mut self, address: IpAddr, prefix_len: u8) -> Result<()> {
        self.request.addresses.push((address, prefix_len));
        Ok(())
    }

    fn add_dns_server(&mut self, server: IpAddr) -> Result<()> {
        if self.state.lock().rejected_dns.contains(&server) {
            return Err(Error::Rejected(format!("DNS server {}", server)));
        }
        self.request.dns_servers.push(server);
        Ok(())
    }

    fn add_route(&mut self, route: IpNet) -> Result<()> {
        if self.state.lock().reject_routes {
            return Err(Error::Rejected(format!("route {}", route)));
        }
        self.request.routes.push(route);
        Ok(())
    }

    fn add_disallowed_application(&mut self, app: &str) -> Result<()> {
        if self.state.lock().refuse_apps {
            return Err(Error::NotSupported(format!("cannot exclude {}", app)));
        }
        self.request.disallowed_apps.push(app.to_string());
        Ok(())
    }

    fn set_mtu(&mut self, mtu: u16) {
        self.request.mtu = Some(mtu);
    }

    fn set_blocking(&mut self, blocking: bool) {
        self.request.blocking = Some(blocking);
    }

    fn establish(self) -> Result<MockHandle> {
        let mut state = self.state.lock();
        state.last_request = Some(self.request);

        if state.fail_establish {
            return Err(Error::DeviceCreation("mock device failure".into()));
        }

        let fd = state.next_fd;
        state.next_fd += 1;
        state.establish_calls += 1;
        state.live += 1;
        state.peak_live = state.peak_live.max(state.live);
        state.events.push(MockEvent::Established(fd));
        drop(state);

        Ok(MockHandle {
            fd,
            state: self.state,
        })
    }
}

/// Fake interface handle; records its release when dropped
#[derive(Debug)]
pub struct MockHandle {
    fd: RawDescriptor,
    state: Arc<Mutex<MockState>>,
}

impl TunHandle for MockHandle {
    fn raw_fd(&self) -> RawDescriptor {
        self.fd
    }

    fn name(&self) -> Option<&str> {
        Some("mock0")
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.live -= 1;
        state.events.push(MockEvent::Released(self.fd));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_handles_get_distinct_descriptors() {
        let platform = MockPlatform::new();

        let first = platform.new_builder().establish().unwrap();
        let second = platform.new_builder().establish().unwrap();
        assert_ne!(first.raw_fd(), second.raw_fd());
        assert_eq!(platform.live_handles(), 2);
        assert_eq!(platform.peak_live_handles(), 2);

        let fd = first.raw_fd();
        drop(first);
        assert_eq!(platform.live_handles(), 1);
        assert_eq!(platform.release_count(fd), 1);
    }

    #[test]
    fn test_builder_records_request() {
        let platform = MockPlatform::new();
        let dns = IpAddr::V4(Ipv4Addr::new(10, 64, 0, 1));

        let mut builder = platform.new_builder();
        builder
            .add_address(IpAddr::V4(Ipv4Addr::new(10, 64, 0, 2)), 32)
            .unwrap();
        builder.add_dns_server(dns).unwrap();
        builder.set_mtu(1380);
        builder.set_blocking(false);
        let _handle = builder.establish().unwrap();

        let request = platform.last_request().unwrap();
        assert_eq!(request.dns_servers, vec![dns]);
        assert_eq!(request.mtu, Some(1380));
        assert_eq!(request.blocking, Some(false));
    }

    #[test]
    fn test_failure_switches() {
        let platform = MockPlatform::new();
        let dns = IpAddr::V4(Ipv4Addr::new(10, 64, 0, 1));

        platform.deny_permission(true);
        assert!(!platform.has_tunnel_permission());

        platform.reject_dns(dns);
        let mut builder = platform.new_builder();
        assert!(builder.add_dns_server(dns).is_err());

        platform.fail_establish(true);
        assert!(builder.establish().is_err());
        assert_eq!(platform.establish_count(), 0);
        assert_eq!(platform.live_handles(), 0);
    }
}
