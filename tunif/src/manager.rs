//! Tunnel interface lifecycle management
//!
//! [`TunnelInterfaceManager`] is the sole owner of the live tunnel handle.
//! It decides whether a cached interface can be reused or must be rebuilt,
//! drives the platform builder when rebuilding, and is the single place
//! where handles are released.
//!
//! # Locking
//!
//! Every operation except [`bypass`](TunnelInterfaceManager::bypass) holds
//! one mutex for its whole duration, including the blocking platform calls
//! made while constructing an interface. Concurrent callers serialize.
//! There is no cancellation: a platform call that never returns blocks its
//! caller, and every other locked caller, indefinitely.
//!
//! # Release Discipline
//!
//! The active outcome is only ever replaced through `ManagerState::install`,
//! which drops the previous handle before storing the next outcome. A
//! rebuild installs "closed" before it starts constructing, so at most one
//! handle is live at any instant and a failed attempt never leaves an old
//! handle behind.
//!
//! # Example
//!
//! ```
//! use tunif::mock::MockPlatform;
//! use tunif::{CreateResult, TunnelConfig, TunnelInterfaceManager};
//!
//! let manager = TunnelInterfaceManager::new(MockPlatform::new(), TunnelConfig::default());
//!
//! let config = TunnelConfig::builder()
//!     .address_str("10.64.0.2")?
//!     .dns_server([10, 64, 0, 1])
//!     .default_routes()
//!     .build()?;
//!
//! let fd = match manager.get_or_create(config.clone()) {
//!     CreateResult::Success(fd) => fd,
//!     other => panic!("unexpected outcome: {:?}", other),
//! };
//!
//! // Same config, not stale: the interface is reused
//! assert_eq!(manager.get_or_create(config).handle(), Some(&fd));
//! # Ok::<(), tunif::Error>(())
//! ```

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bypass::{self, Bypass};
use crate::config::TunnelConfig;
use crate::platform::{InterfaceBuilder, RawDescriptor, TunHandle, TunPlatform};
use crate::result::CreateResult;

/// Owner of the tunnel interface for one VPN session
pub struct TunnelInterfaceManager<P: TunPlatform> {
    platform: Arc<P>,
    state: Mutex<ManagerState<P::Handle>>,
}

struct ManagerState<H> {
    current_config: TunnelConfig,
    active: Option<CreateResult<H>>,
    stale: bool,
    disallowed_apps: Option<BTreeSet<String>>,
}

impl<H: TunHandle> ManagerState<H> {
    /// Replace the active outcome, releasing the handle the old one owned
    fn install(&mut self, next: Option<CreateResult<H>>) {
        if let Some(handle) = self.active.take().and_then(CreateResult::into_handle) {
            log::info!("Releasing tunnel interface (fd {})", handle.raw_fd());
            drop(handle);
        }
        self.active = next;
    }

    fn is_open(&self) -> bool {
        self.active.as_ref().is_some_and(CreateResult::is_open)
    }

    fn snapshot(&self) -> Option<CreateResult<RawDescriptor>> {
        self.active.as_ref().map(describe)
    }
}

/// Copy of an outcome carrying only the raw descriptor
fn describe<H: TunHandle>(result: &CreateResult<H>) -> CreateResult<RawDescriptor> {
    result.as_ref().map(|handle| handle.raw_fd())
}

impl<P: TunPlatform> TunnelInterfaceManager<P> {
    /// Create a closed manager
    ///
    /// `default_config` is used by [`ensure_open`](Self::ensure_open) and
    /// [`force_recreate`](Self::force_recreate) until a configuration is
    /// supplied through [`get_or_create`](Self::get_or_create).
    pub fn new(platform: P, default_config: TunnelConfig) -> Self {
        Self::with_shared_platform(Arc::new(platform), default_config)
    }

    /// Create a closed manager over a platform that is shared elsewhere
    pub fn with_shared_platform(platform: Arc<P>, default_config: TunnelConfig) -> Self {
        Self {
            platform,
            state: Mutex::new(ManagerState {
                current_config: default_config,
                active: None,
                stale: false,
                disallowed_apps: None,
            }),
        }
    }

    /// Return the live interface for `config`, building a new one if needed
    ///
    /// The existing interface is reused when it is open, was built from an
    /// equal config and has not been marked stale. In that case no platform
    /// call is made. Otherwise the old handle is released and a new
    /// interface is constructed.
    pub fn get_or_create(&self, config: TunnelConfig) -> CreateResult<RawDescriptor> {
        let mut state = self.state.lock();

        if !state.stale && state.current_config == config {
            if let Some(active) = state.active.as_ref().filter(|active| active.is_open()) {
                log::debug!("Reusing tunnel interface ({})", active.kind());
                return describe(active);
            }
        }

        self.rebuild(&mut state, config)
    }

    /// Release the current interface and rebuild it from the current config
    pub fn force_recreate(&self) -> CreateResult<RawDescriptor> {
        let mut state = self.state.lock();
        let config = state.current_config.clone();
        self.rebuild(&mut state, config)
    }

    /// Make sure an interface is open, building one from the current config if not
    ///
    /// Returns whether a handle is live afterwards.
    pub fn ensure_open(&self) -> bool {
        let mut state = self.state.lock();

        if !state.is_open() {
            let config = state.current_config.clone();
            self.rebuild(&mut state, config);
        }

        state.is_open()
    }

    /// Rebuild with `config`, but only if an interface is currently open
    ///
    /// Returns the new outcome, or `None` if the manager was closed and
    /// nothing happened.
    pub fn recreate_if_open(&self, config: TunnelConfig) -> Option<CreateResult<RawDescriptor>> {
        let mut state = self.state.lock();

        if !state.is_open() {
            log::debug!("Tunnel interface closed, not recreating");
            return None;
        }

        Some(self.rebuild(&mut state, config))
    }

    /// Release the interface, if any
    ///
    /// The current config is kept. Closing a closed manager does nothing.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.install(None);
    }

    /// Force the next [`get_or_create`](Self::get_or_create) to rebuild
    ///
    /// The live interface, if any, is left untouched.
    pub fn mark_stale(&self) {
        let mut state = self.state.lock();
        log::debug!("Marking tunnel interface stale");
        state.stale = true;
    }

    /// Exempt a socket from tunnel routing
    ///
    /// Does not take the manager lock and may run concurrently with any
    /// other operation.
    pub fn bypass(&self, socket: RawDescriptor) -> bool {
        bypass::exempt(&*self.platform, socket)
    }

    /// A cloneable handle that exempts sockets without borrowing the manager
    pub fn bypass_handle(&self) -> Bypass<P> {
        Bypass::new(Arc::clone(&self.platform))
    }

    /// Replace the set of applications excluded from the tunnel
    ///
    /// Takes effect at the next construction. The live interface is not
    /// marked stale; call [`mark_stale`](Self::mark_stale) to apply the
    /// change on the next acquisition.
    pub fn set_disallowed_apps(&self, apps: Option<BTreeSet<String>>) {
        self.state.lock().disallowed_apps = apps;
    }

    /// Applications currently excluded from the tunnel
    pub fn disallowed_apps(&self) -> Option<BTreeSet<String>> {
        self.state.lock().disallowed_apps.clone()
    }

    /// Config of the last construction, or the default config
    pub fn current_config(&self) -> TunnelConfig {
        self.state.lock().current_config.clone()
    }

    /// Whether a handle is live
    pub fn is_open(&self) -> bool {
        self.state.lock().is_open()
    }

    /// Whether the next acquisition is forced to rebuild
    pub fn is_stale(&self) -> bool {
        self.state.lock().stale
    }

    /// Outcome of the last construction, or `None` if closed
    pub fn status(&self) -> Option<CreateResult<RawDescriptor>> {
        self.state.lock().snapshot()
    }

    /// The platform this manager drives
    pub fn platform(&self) -> &P {
        &self.platform
    }

    fn rebuild(
        &self,
        state: &mut ManagerState<P::Handle>,
        config: TunnelConfig,
    ) -> CreateResult<RawDescriptor> {
        state.install(None);

        let result = establish(&*self.platform, &config, state.disallowed_apps.as_ref());
        let outcome = describe(&result);

        state.current_config = config;
        state.stale = false;
        state.install(Some(result));

        outcome
    }
}

impl<P: TunPlatform> Drop for TunnelInterfaceManager<P> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.is_open() {
            log::info!("Tearing down tunnel interface manager");
        }
        state.install(None);
    }
}

impl<P: TunPlatform> std::fmt::Debug for TunnelInterfaceManager<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TunnelInterfaceManager")
            .field("current_config", &state.current_config)
            .field("active", &state.snapshot())
            .field("stale", &state.stale)
            .field("disallowed_apps", &state.disallowed_apps)
            .finish()
    }
}

/// Construct an interface for `config`
fn establish<P: TunPlatform>(
    platform: &P,
    config: &TunnelConfig,
    disallowed_apps: Option<&BTreeSet<String>>,
) -> CreateResult<P::Handle> {
    if !platform.has_tunnel_permission() {
        log::warn!("Tunnel permission not granted");
        return CreateResult::PermissionDenied;
    }

    let mut builder = platform.new_builder();

    for (address, prefix_len) in config.prefixed_addresses() {
        if let Err(e) = builder.add_address(address, prefix_len) {
            log::error!("Failed to add address {}/{}: {}", address, prefix_len, e);
            return CreateResult::DeviceError;
        }
    }

    let mut invalid_dns: Option<IpAddr> = None;
    for server in &config.dns_servers {
        if let Err(e) = builder.add_dns_server(*server) {
            log::warn!("DNS server {} rejected: {}", server, e);
            invalid_dns.get_or_insert(*server);
        }
    }

    for route in &config.routes {
        if let Err(e) = builder.add_route(*route) {
            log::error!("Failed to add route {}: {}", route, e);
            return CreateResult::DeviceError;
        }
    }

    if let Some(apps) = disallowed_apps {
        for app in apps {
            if let Err(e) = builder.add_disallowed_application(app) {
                log::warn!("Cannot exclude {} from the tunnel: {}", app, e);
            }
        }
    }

    builder.set_mtu(config.mtu);
    builder.set_blocking(false);

    let handle = match builder.establish() {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("Failed to establish tunnel interface: {}", e);
            return CreateResult::DeviceError;
        }
    };

    log::info!(
        "Established tunnel interface {} (fd {}, MTU: {})",
        handle.name().unwrap_or("<unnamed>"),
        handle.raw_fd(),
        config.mtu
    );

    platform.wait_until_ready(&handle, config.has_ipv6_routes());

    match invalid_dns {
        Some(address) => CreateResult::InvalidDnsServer { address, handle },
        None => CreateResult::Success(handle),
    }
}
