//! OS collaborators of the interface manager
//!
//! The manager never talks to the OS directly. Everything it needs from the
//! platform goes through [`TunPlatform`]:
//!
//! - a capability check ("may this process open a tunnel?")
//! - an [`InterfaceBuilder`] that accepts addresses, DNS servers, routes,
//!   excluded applications and MTU, and materializes the interface
//! - a blocking readiness wait
//! - the socket exemption primitive used by bypass
//!
//! Implementations:
//! - [`crate::linux::LinuxPlatform`]: `tun-rs` + `libc` on Linux
//! - [`crate::mock::MockPlatform`]: deterministic fake for tests
//!
//! # Handle Release
//!
//! A [`TunHandle`] releases the OS resource when dropped. Implementations
//! must not release it anywhere else, so that dropping is the single point
//! of release the manager relies on.

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::Result;

/// Raw OS descriptor of a tunnel interface or socket
#[cfg(unix)]
pub type RawDescriptor = std::os::fd::RawFd;

/// Raw OS descriptor of a tunnel interface or socket
#[cfg(windows)]
pub type RawDescriptor = std::os::windows::io::RawSocket;

/// An open tunnel interface
///
/// Dropping the handle releases the interface.
pub trait TunHandle: Send + fmt::Debug {
    /// Descriptor the protocol layer reads packets from and writes packets to
    fn raw_fd(&self) -> RawDescriptor;

    /// Interface name, if the platform exposes one
    fn name(&self) -> Option<&str> {
        None
    }
}

/// Assembles one interface request
///
/// A builder is used for exactly one establishment attempt.
pub trait InterfaceBuilder {
    /// Handle produced by [`establish`](Self::establish)
    type Handle: TunHandle;

    /// Add an interface address with the given prefix length
    fn add_address(&mut self, address: IpAddr, prefix_len: u8) -> Result<()>;

    /// Add a DNS server
    ///
    /// An error means the platform does not accept this address; the
    /// interface may still be established without it.
    fn add_dns_server(&mut self, server: IpAddr) -> Result<()>;

    /// Route a destination network into the interface
    fn add_route(&mut self, route: IpNet) -> Result<()>;

    /// Keep an application's traffic outside the interface
    fn add_disallowed_application(&mut self, app: &str) -> Result<()>;

    /// Set the MTU
    fn set_mtu(&mut self, mtu: u16);

    /// Choose blocking or non-blocking I/O on the resulting descriptor
    fn set_blocking(&mut self, blocking: bool);

    /// Materialize the interface
    fn establish(self) -> Result<Self::Handle>;
}

/// Platform services consumed by [`crate::TunnelInterfaceManager`]
///
/// All methods may block. Implementations must be shareable across threads:
/// [`exempt_socket`](Self::exempt_socket) is called without any lock held,
/// concurrently with the other methods.
pub trait TunPlatform: Send + Sync {
    /// Handle of an open interface
    type Handle: TunHandle;

    /// Builder for a single interface request
    type Builder: InterfaceBuilder<Handle = Self::Handle>;

    /// Whether tunnel capability is granted to this process
    fn has_tunnel_permission(&self) -> bool;

    /// Start a new interface request
    fn new_builder(&self) -> Self::Builder;

    /// Block until the interface is usable
    ///
    /// `has_ipv6_routes` tells the platform whether IPv6 readiness must be
    /// awaited as well.
    fn wait_until_ready(&self, handle: &Self::Handle, has_ipv6_routes: bool);

    /// Exempt a socket from tunnel routing
    fn exempt_socket(&self, socket: RawDescriptor) -> bool;
}
