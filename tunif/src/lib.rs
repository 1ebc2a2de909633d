//! Tunnel interface lifecycle management for VPN clients
//!
//! This crate owns the virtual network interface a VPN client routes its
//! traffic through. It creates the interface from a [`TunnelConfig`],
//! reuses it while the config is unchanged, rebuilds it when the config
//! changes or the interface is marked stale, and releases the OS handle
//! exactly once.
//!
//! # Features
//!
//! - **Lifecycle Management**: [`TunnelInterfaceManager`] decides reuse vs.
//!   rebuild under a single lock and is the only place handles are released
//! - **Typed Outcomes**: [`CreateResult`] for construction attempts,
//!   [`ErrorCause`] for session failures, [`TunnelState`] for the layer above
//! - **Bypass**: exempt the tunnel protocol's own sockets from the tunnel
//! - **Pluggable Platforms**: OS calls go through [`TunPlatform`]; a Linux
//!   implementation and a deterministic [`mock`] are included
//!
//! # Platform Requirements
//!
//! ## Linux
//! - Root privileges or `CAP_NET_ADMIN` capability
//! - TUN kernel module loaded (`modprobe tun`)
//! - `ip` from iproute2 for extra addresses and routes
//!
//! # Example
//!
//! ```ignore
//! use tunif::linux::LinuxPlatform;
//! use tunif::{Config, CreateResult, TunnelInterfaceManager};
//!
//! let config = Config::load("tunif.toml")?;
//! let manager = TunnelInterfaceManager::new(
//!     LinuxPlatform::new(config.platform.clone()),
//!     Default::default(),
//! );
//!
//! match manager.get_or_create(config.tunnel) {
//!     CreateResult::Success(fd) => println!("tunnel up on fd {}", fd),
//!     CreateResult::InvalidDnsServer { address, handle } => {
//!         println!("tunnel up on fd {}, but DNS server {} was refused", handle, address)
//!     }
//!     CreateResult::PermissionDenied => println!("grant CAP_NET_ADMIN first"),
//!     CreateResult::DeviceError => println!("could not create the interface"),
//! }
//! ```

pub mod bypass;
pub mod cause;
pub mod config;
pub mod error;
pub mod manager;
pub mod mock;
pub mod platform;
pub mod result;
pub mod state;

#[cfg(target_os = "linux")]
pub mod linux;

pub use bypass::Bypass;
pub use cause::ErrorCause;
pub use config::{host_prefix_len, parse_address, Config, PlatformConfig, TunnelConfig, TunnelConfigBuilder};
pub use error::{Error, Result};
pub use manager::TunnelInterfaceManager;
pub use platform::{InterfaceBuilder, RawDescriptor, TunHandle, TunPlatform};
pub use result::CreateResult;
pub use state::{RetryPolicy, TunnelState};

/// Default MTU for tunnel interfaces
pub const DEFAULT_MTU: u16 = 1380;
