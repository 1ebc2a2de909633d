//! Socket exemption from tunnel routing
//!
//! Tunnel protocols keep their own control-channel sockets outside the
//! tunnel, otherwise their traffic would loop back into the interface it is
//! carrying. Exemption touches no manager state and takes no lock.

use std::sync::Arc;

use crate::platform::{RawDescriptor, TunPlatform};

/// Cloneable handle for exempting sockets from the tunnel
pub struct Bypass<P> {
    platform: Arc<P>,
}

impl<P: TunPlatform> Bypass<P> {
    /// Create a bypass handle over a shared platform
    pub fn new(platform: Arc<P>) -> Self {
        Self { platform }
    }

    /// Exempt `socket` from tunnel routing
    ///
    /// Returns whether the platform accepted the exemption.
    pub fn exempt(&self, socket: RawDescriptor) -> bool {
        exempt(&*self.platform, socket)
    }
}

pub(crate) fn exempt<P: TunPlatform>(platform: &P, socket: RawDescriptor) -> bool {
    let exempted = platform.exempt_socket(socket);
    if exempted {
        log::debug!("Exempted socket {} from tunnel routing", socket);
    } else {
        log::warn!("Failed to exempt socket {} from tunnel routing", socket);
    }
    exempted
}

impl<P> Clone for Bypass<P> {
    fn clone(&self) -> Self {
        Self {
            platform: Arc::clone(&self.platform),
        }
    }
}

impl<P> std::fmt::Debug for Bypass<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bypass").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockEvent, MockPlatform};

    #[test]
    fn test_exempt_delegates_to_platform() {
        let platform = Arc::new(MockPlatform::new());
        let bypass = Bypass::new(Arc::clone(&platform));

        assert!(bypass.exempt(42));
        assert_eq!(platform.events(), vec![MockEvent::Exempted(42)]);
    }

    #[test]
    fn test_exempt_reports_refusal() {
        let platform = Arc::new(MockPlatform::new());
        platform.refuse_exemptions(true);
        let bypass = Bypass::new(Arc::clone(&platform)).clone();

        assert!(!bypass.exempt(42));
        assert!(platform.events().is_empty());
    }
}
