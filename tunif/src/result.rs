//! Outcome of an interface establishment attempt

use std::net::IpAddr;

/// Result of trying to bring up the tunnel interface
///
/// A variant owns a handle if and only if it is [`CreateResult::Success`] or
/// [`CreateResult::InvalidDnsServer`]. The manager stores `CreateResult<H>`
/// with the platform handle and hands callers a copy carrying only the raw
/// descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateResult<H> {
    /// The interface is up
    Success(H),

    /// The interface is up, but the platform refused a DNS server
    ///
    /// The handle is live and usable; only name resolution through
    /// `address` is affected.
    InvalidDnsServer {
        /// The DNS server the platform rejected
        address: IpAddr,
        /// Handle of the live interface
        handle: H,
    },

    /// The OS declined to grant tunnel capability to this process
    PermissionDenied,

    /// Interface construction failed for a reason other than permission
    DeviceError,
}

impl<H> CreateResult<H> {
    /// Borrow the handle, if this outcome owns one
    pub fn handle(&self) -> Option<&H> {
        match self {
            CreateResult::Success(handle) | CreateResult::InvalidDnsServer { handle, .. } => {
                Some(handle)
            }
            CreateResult::PermissionDenied | CreateResult::DeviceError => None,
        }
    }

    /// Take the handle out, if this outcome owns one
    pub fn into_handle(self) -> Option<H> {
        match self {
            CreateResult::Success(handle) | CreateResult::InvalidDnsServer { handle, .. } => {
                Some(handle)
            }
            CreateResult::PermissionDenied | CreateResult::DeviceError => None,
        }
    }

    /// Whether a live interface backs this outcome
    pub fn is_open(&self) -> bool {
        self.handle().is_some()
    }

    /// Whether this is a clean success
    pub fn is_success(&self) -> bool {
        matches!(self, CreateResult::Success(_))
    }

    /// Convert `&CreateResult<H>` into `CreateResult<&H>`
    pub fn as_ref(&self) -> CreateResult<&H> {
        match self {
            CreateResult::Success(handle) => CreateResult::Success(handle),
            CreateResult::InvalidDnsServer { address, handle } => CreateResult::InvalidDnsServer {
                address: *address,
                handle,
            },
            CreateResult::PermissionDenied => CreateResult::PermissionDenied,
            CreateResult::DeviceError => CreateResult::DeviceError,
        }
    }

    /// Map the handle, keeping the variant
    pub fn map<U, F>(self, f: F) -> CreateResult<U>
    where
        F: FnOnce(H) -> U,
    {
        match self {
            CreateResult::Success(handle) => CreateResult::Success(f(handle)),
            CreateResult::InvalidDnsServer { address, handle } => CreateResult::InvalidDnsServer {
                address,
                handle: f(handle),
            },
            CreateResult::PermissionDenied => CreateResult::PermissionDenied,
            CreateResult::DeviceError => CreateResult::DeviceError,
        }
    }

    /// Short label for logging
    pub fn kind(&self) -> &'static str {
        match self {
            CreateResult::Success(_) => "success",
            CreateResult::InvalidDnsServer { .. } => "invalid DNS server",
            CreateResult::PermissionDenied => "permission denied",
            CreateResult::DeviceError => "device error",
        }
    }
}
