//! Error types for tunif

use std::io;
use thiserror::Error;

/// Result type alias for tunif operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading configuration or assembling an interface
///
/// Interface construction itself never surfaces these to callers of the
/// manager: a failed attempt is reported as a [`crate::CreateResult`].
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse a configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Failed to serialize a configuration
    #[error("failed to serialize config: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// Address is not an IPv4 or IPv6 address
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid network prefix
    #[error("invalid network prefix: {0}")]
    InvalidPrefix(String),

    /// Interface could not be materialized
    #[error("device creation error: {0}")]
    DeviceCreation(String),

    /// Permission denied
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The platform refused a value handed to the interface builder
    #[error("rejected by platform: {0}")]
    Rejected(String),

    /// Operation not supported on this platform
    #[error("operation not supported: {0}")]
    NotSupported(String),
}

impl Error {
    /// Check if the error is a permission-related error
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::PermissionDenied(_))
            || matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::PermissionDenied)
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::ConfigParse(_)
                | Error::InvalidAddress(_)
                | Error::InvalidPrefix(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_from_io() {
        let err = Error::from(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(err.is_permission_denied());

        let err = Error::from(io::Error::from(io::ErrorKind::NotFound));
        assert!(!err.is_permission_denied());
    }

    #[test]
    fn test_config_errors() {
        assert!(Error::InvalidAddress("tun0".into()).is_config_error());
        assert!(!Error::DeviceCreation("busy".into()).is_config_error());
    }
}
