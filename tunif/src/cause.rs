//! Causes for a secured session failing or ending
//!
//! [`ErrorCause`] is plain data handed to the connection-state layer, which
//! picks user messaging and retry policy from it (see [`crate::state`]).

use std::fmt;
use std::net::IpAddr;

/// Why a tunnel session failed or ended
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCause {
    /// The relay or account rejected our credentials
    AuthFailed(Option<String>),
    /// IPv6 was requested but the host cannot route it
    Ipv6Unavailable,
    /// The firewall policy could not be applied
    FirewallPolicyError,
    /// System DNS could not be configured
    DnsConfigError,
    /// The platform refused a configured DNS server
    InvalidDnsServer(IpAddr),
    /// The tunnel interface could not be started
    StartTunnelError,
    /// Tunnel parameters (keys, relay selection) could not be generated
    ParameterGenerationError(String),
    /// The device has no connectivity
    Offline,
    /// The OS declined to grant tunnel capability
    PermissionDenied,
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCause::AuthFailed(Some(reason)) => write!(f, "authentication failed: {}", reason),
            ErrorCause::AuthFailed(None) => write!(f, "authentication failed"),
            ErrorCause::Ipv6Unavailable => write!(f, "IPv6 unavailable"),
            ErrorCause::FirewallPolicyError => write!(f, "failed to apply firewall policy"),
            ErrorCause::DnsConfigError => write!(f, "failed to configure DNS"),
            ErrorCause::InvalidDnsServer(address) => write!(f, "invalid DNS server {}", address),
            ErrorCause::StartTunnelError => write!(f, "failed to start tunnel interface"),
            ErrorCause::ParameterGenerationError(detail) => {
                write!(f, "failed to generate tunnel parameters: {}", detail)
            }
            ErrorCause::Offline => write!(f, "device is offline"),
            ErrorCause::PermissionDenied => write!(f, "tunnel permission denied"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            ErrorCause::AuthFailed(Some("expired".into())).to_string(),
            "authentication failed: expired"
        );
        assert_eq!(ErrorCause::AuthFailed(None).to_string(), "authentication failed");
        assert_eq!(
            ErrorCause::InvalidDnsServer("10.64.0.1".parse().unwrap()).to_string(),
            "invalid DNS server 10.64.0.1"
        );
    }
}
