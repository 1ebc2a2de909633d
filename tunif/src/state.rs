//! Connection state as seen by the layer above the manager
//!
//! Translates construction outcomes and session failure causes into a small
//! connecting/connected/disconnected/error status, and decides when a failed
//! session may be retried.

use crate::cause::ErrorCause;
use crate::result::CreateResult;

/// Tunnel connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    /// No tunnel
    Disconnected,
    /// Interface requested, session being negotiated
    Connecting,
    /// Tunnel up
    ///
    /// `degraded` carries a soft failure the user may want to hear about,
    /// such as a DNS server the platform refused.
    Connected { degraded: Option<ErrorCause> },
    /// Session failed
    Error(ErrorCause),
}

impl TunnelState {
    /// Translate the outcome of an interface construction
    pub fn from_create_result<H>(result: &CreateResult<H>) -> Self {
        match cause_of(result) {
            None => TunnelState::Connected { degraded: None },
            Some(cause @ ErrorCause::InvalidDnsServer(_)) => TunnelState::Connected {
                degraded: Some(cause),
            },
            Some(cause) => TunnelState::Error(cause),
        }
    }

    /// Check if a tunnel is being set up or is up
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TunnelState::Connecting | TunnelState::Connected { .. }
        )
    }

    /// Check if the tunnel is up
    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelState::Connected { .. })
    }

    /// The failure cause, if any
    pub fn cause(&self) -> Option<&ErrorCause> {
        match self {
            TunnelState::Error(cause) => Some(cause),
            TunnelState::Connected { degraded } => degraded.as_ref(),
            TunnelState::Disconnected | TunnelState::Connecting => None,
        }
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            TunnelState::Disconnected => "Disconnected",
            TunnelState::Connecting => "Connecting...",
            TunnelState::Connected { degraded: None } => "Connected",
            TunnelState::Connected { degraded: Some(_) } => "Connected (degraded)",
            TunnelState::Error(_) => "Error",
        }
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.cause() {
            Some(cause) => write!(f, "{}: {}", self.description(), cause),
            None => write!(f, "{}", self.description()),
        }
    }
}

/// Cause to report for a construction outcome, `None` on clean success
pub fn cause_of<H>(result: &CreateResult<H>) -> Option<ErrorCause> {
    match result {
        CreateResult::Success(_) => None,
        CreateResult::InvalidDnsServer { address, .. } => {
            Some(ErrorCause::InvalidDnsServer(*address))
        }
        CreateResult::PermissionDenied => Some(ErrorCause::PermissionDenied),
        CreateResult::DeviceError => Some(ErrorCause::StartTunnelError),
    }
}

/// When a failed session may be attempted again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Re-invoking the manager may succeed
    Immediate,
    /// Wait until connectivity is restored
    AfterConnectivityChange,
    /// Wait until credentials are updated
    AfterCredentialsChange,
    /// The user has to act first (grant permission)
    AfterUserAction,
    /// The tunnel is usable; nothing to retry
    NotNeeded,
}

impl RetryPolicy {
    /// Check if a retry can be scheduled without waiting for an external change
    pub fn is_immediate(&self) -> bool {
        matches!(self, RetryPolicy::Immediate)
    }
}

/// Retry policy for a session failure cause
pub fn retry_policy(cause: &ErrorCause) -> RetryPolicy {
    match cause {
        ErrorCause::Offline => RetryPolicy::AfterConnectivityChange,
        ErrorCause::AuthFailed(_) => RetryPolicy::AfterCredentialsChange,
        ErrorCause::PermissionDenied => RetryPolicy::AfterUserAction,
        ErrorCause::InvalidDnsServer(_) => RetryPolicy::NotNeeded,
        ErrorCause::StartTunnelError
        | ErrorCause::Ipv6Unavailable
        | ErrorCause::FirewallPolicyError
        | ErrorCause::DnsConfigError
        | ErrorCause::ParameterGenerationError(_) => RetryPolicy::Immediate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    const DNS: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 64, 0, 1));

    #[test]
    fn test_state_from_create_result() {
        assert_eq!(
            TunnelState::from_create_result(&CreateResult::Success(3)),
            TunnelState::Connected { degraded: None }
        );
        assert_eq!(
            TunnelState::from_create_result(&CreateResult::InvalidDnsServer {
                address: DNS,
                handle: 3
            }),
            TunnelState::Connected {
                degraded: Some(ErrorCause::InvalidDnsServer(DNS))
            }
        );
        assert_eq!(
            TunnelState::from_create_result(&CreateResult::<i32>::PermissionDenied),
            TunnelState::Error(ErrorCause::PermissionDenied)
        );
        assert_eq!(
            TunnelState::from_create_result(&CreateResult::<i32>::DeviceError),
            TunnelState::Error(ErrorCause::StartTunnelError)
        );
    }

    #[test]
    fn test_state_predicates() {
        assert!(TunnelState::Connecting.is_active());
        assert!(!TunnelState::Connecting.is_connected());
        assert!(!TunnelState::Error(ErrorCause::Offline).is_active());
        assert_eq!(TunnelState::Disconnected.cause(), None);
        assert_eq!(
            TunnelState::Error(ErrorCause::Offline).to_string(),
            "Error: device is offline"
        );
    }

    #[test]
    fn test_retry_policy() {
        assert_eq!(
            retry_policy(&ErrorCause::Offline),
            RetryPolicy::AfterConnectivityChange
        );
        assert_eq!(
            retry_policy(&ErrorCause::AuthFailed(None)),
            RetryPolicy::AfterCredentialsChange
        );
        assert_eq!(
            retry_policy(&ErrorCause::PermissionDenied),
            RetryPolicy::AfterUserAction
        );
        assert!(retry_policy(&ErrorCause::StartTunnelError).is_immediate());
        assert!(retry_policy(&ErrorCause::ParameterGenerationError("no key".into())).is_immediate());
        assert_eq!(
            retry_policy(&ErrorCause::InvalidDnsServer(DNS)),
            RetryPolicy::NotNeeded
        );
    }
}
