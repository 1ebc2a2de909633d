//! Tunnel interface configuration
//!
//! [`TunnelConfig`] describes the shape the tunnel interface should have.
//! The manager compares configs structurally to decide whether a live
//! interface can be reused, so every field participates in equality.
//!
//! [`Config`] is the on-disk TOML form used by hosts, wrapping a tunnel
//! section with platform options and the optional application exclusion list.

use std::collections::{BTreeSet, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::DEFAULT_MTU;

/// Prefix length installed for an IPv4 interface address
pub const IPV4_HOST_PREFIX: u8 = 32;

/// Prefix length installed for an IPv6 interface address
pub const IPV6_HOST_PREFIX: u8 = 128;

/// Smallest MTU any IPv4 link must support
pub const MIN_IPV4_MTU: u16 = 68;

/// Smallest MTU any IPv6 link must support
pub const MIN_IPV6_MTU: u16 = 1280;

/// Address used by the default configuration before a relay assigns one
const PLACEHOLDER_ADDRESS: Ipv4Addr = Ipv4Addr::new(169, 254, 254, 254);

/// Prefix length for an interface address, derived from its family
pub fn host_prefix_len(address: &IpAddr) -> u8 {
    match address {
        IpAddr::V4(_) => IPV4_HOST_PREFIX,
        IpAddr::V6(_) => IPV6_HOST_PREFIX,
    }
}

/// Parse an interface address, rejecting anything that is not plain IPv4 or IPv6
///
/// Hostnames, scoped IPv6 literals (`fe80::1%eth0`) and link-layer addresses
/// are refused.
pub fn parse_address(address: &str) -> Result<IpAddr> {
    address
        .trim()
        .parse()
        .map_err(|_| Error::InvalidAddress(address.to_string()))
}

/// Desired shape of the tunnel interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Interface addresses, each installed as a host prefix
    pub addresses: BTreeSet<IpAddr>,
    /// DNS servers, in order of preference
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,
    /// Routes captured by the interface
    #[serde(default)]
    pub routes: BTreeSet<IpNet>,
    /// Maximum transmission unit
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

fn default_mtu() -> u16 {
    DEFAULT_MTU
}

impl Default for TunnelConfig {
    /// Blocking configuration used before a connection supplies a real one
    ///
    /// Captures all traffic on a link-local placeholder address with no DNS,
    /// so nothing leaks while the tunnel is being negotiated.
    fn default() -> Self {
        let mut routes = BTreeSet::new();
        routes.insert(IpNet::V4(Ipv4Net::default()));
        routes.insert(IpNet::V6(Ipv6Net::default()));

        Self {
            addresses: BTreeSet::from([IpAddr::V4(PLACEHOLDER_ADDRESS)]),
            dns_servers: Vec::new(),
            routes,
            mtu: DEFAULT_MTU,
        }
    }
}

impl TunnelConfig {
    /// Create a new configuration builder
    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::new()
    }

    /// Whether any route targets an IPv6 destination
    pub fn has_ipv6_routes(&self) -> bool {
        self.routes.iter().any(|route| matches!(route, IpNet::V6(_)))
    }

    /// Whether the interface carries any IPv6 traffic at all
    pub fn uses_ipv6(&self) -> bool {
        self.has_ipv6_routes() || self.addresses.iter().any(IpAddr::is_ipv6)
    }

    /// Interface addresses paired with the prefix length each is installed with
    pub fn prefixed_addresses(&self) -> impl Iterator<Item = (IpAddr, u8)> + '_ {
        self.addresses
            .iter()
            .map(|address| (*address, host_prefix_len(address)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.addresses.is_empty() {
            return Err(Error::Config(
                "at least one interface address must be configured".into(),
            ));
        }

        if self.mtu < MIN_IPV4_MTU {
            return Err(Error::Config(format!(
                "MTU {} is too small (minimum {})",
                self.mtu, MIN_IPV4_MTU
            )));
        }

        if self.uses_ipv6() && self.mtu < MIN_IPV6_MTU {
            return Err(Error::Config(format!(
                "MTU {} is too small for IPv6 (minimum {})",
                self.mtu, MIN_IPV6_MTU
            )));
        }

        for route in &self.routes {
            if *route != route.trunc() {
                return Err(Error::InvalidPrefix(format!(
                    "route {} has host bits set (did you mean {}?)",
                    route,
                    route.trunc()
                )));
            }
        }

        let mut seen = HashSet::new();
        for server in &self.dns_servers {
            if !seen.insert(server) {
                return Err(Error::Config(format!("duplicate DNS server {}", server)));
            }
        }

        Ok(())
    }
}

/// Builder for TunnelConfig
#[derive(Debug)]
pub struct TunnelConfigBuilder {
    config: TunnelConfig,
}

impl Default for TunnelConfigBuilder {
    fn default() -> Self {
        Self {
            config: TunnelConfig {
                addresses: BTreeSet::new(),
                dns_servers: Vec::new(),
                routes: BTreeSet::new(),
                mtu: DEFAULT_MTU,
            },
        }
    }
}

impl TunnelConfigBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an interface address
    pub fn address(mut self, address: impl Into<IpAddr>) -> Self {
        self.config.addresses.insert(address.into());
        self
    }

    /// Add an interface address from a string (e.g., "10.64.0.2")
    pub fn address_str(self, address: &str) -> Result<Self> {
        let address = parse_address(address)?;
        Ok(self.address(address))
    }

    /// Append a DNS server
    pub fn dns_server(mut self, server: impl Into<IpAddr>) -> Self {
        self.config.dns_servers.push(server.into());
        self
    }

    /// Add a route
    pub fn route(mut self, route: impl Into<IpNet>) -> Self {
        self.config.routes.insert(route.into());
        self
    }

    /// Add a route from CIDR notation (e.g., "0.0.0.0/0")
    pub fn route_str(self, route: &str) -> Result<Self> {
        let route: IpNet = route
            .trim()
            .parse()
            .map_err(|_| Error::InvalidPrefix(route.to_string()))?;
        Ok(self.route(route))
    }

    /// Route all IPv4 and IPv6 traffic into the tunnel
    pub fn default_routes(self) -> Self {
        self.route(Ipv4Net::default()).route(Ipv6Net::default())
    }

    /// Set the MTU
    pub fn mtu(mut self, mtu: u16) -> Self {
        self.config.mtu = mtu;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<TunnelConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Platform options read from the `[platform]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Interface name (auto-assigned if not specified)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Firewall mark applied to sockets exempted from the tunnel
    #[serde(default = "default_fwmark")]
    pub fwmark: u32,
    /// Routing table holding the tunnel routes
    #[serde(default = "default_route_table")]
    pub route_table: u32,
    /// Priority of the first policy rule; the second one uses the next value
    #[serde(default = "default_rule_priority")]
    pub rule_priority: u32,
    /// Upper bound on the readiness wait, in milliseconds
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
}

/// Firewall mark used for bypass sockets unless configured otherwise
pub const DEFAULT_FWMARK: u32 = 0x6d6f_6c65;

/// Routing table for tunnel routes unless configured otherwise
pub const DEFAULT_ROUTE_TABLE: u32 = 0x6d6f_6c65;

/// Priority of the main-table rule, policy rules must sort before it
const MAIN_RULE_PRIORITY: u32 = 32766;

/// Table ids the kernel reserves (unspec, default, main, local)
const RESERVED_TABLES: [u32; 4] = [0, 253, 254, 255];

fn default_fwmark() -> u32 {
    DEFAULT_FWMARK
}

fn default_route_table() -> u32 {
    DEFAULT_ROUTE_TABLE
}

fn default_rule_priority() -> u32 {
    5200
}

fn default_ready_timeout_ms() -> u64 {
    5000
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            name: None,
            fwmark: DEFAULT_FWMARK,
            route_table: DEFAULT_ROUTE_TABLE,
            rule_priority: default_rule_priority(),
            ready_timeout_ms: default_ready_timeout_ms(),
        }
    }
}

impl PlatformConfig {
    /// Readiness wait bound as a duration
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Validate the platform options
    pub fn validate(&self) -> Result<()> {
        if let Some(ref name) = self.name {
            if name.is_empty() || name.len() >= 16 {
                return Err(Error::Config(format!(
                    "interface name '{}' must be 1 to 15 characters",
                    name
                )));
            }
        }

        if self.fwmark == 0 {
            return Err(Error::Config("fwmark must be non-zero".into()));
        }

        if RESERVED_TABLES.contains(&self.route_table) {
            return Err(Error::Config(format!(
                "routing table {} is reserved",
                self.route_table
            )));
        }

        if self.rule_priority == 0 || self.rule_priority >= MAIN_RULE_PRIORITY - 1 {
            return Err(Error::Config(format!(
                "rule priority must be between 1 and {}",
                MAIN_RULE_PRIORITY - 2
            )));
        }

        Ok(())
    }
}

/// Host configuration file
///
/// # Example Configuration
///
/// ```toml
/// excluded_apps = ["org.example.browser"]
///
/// [tunnel]
/// addresses = ["10.64.0.2", "fc00:bbbb:bbbb:bb01::2"]
/// dns_servers = ["10.64.0.1"]
/// routes = ["0.0.0.0/0", "::/0"]
/// mtu = 1380
///
/// [platform]
/// name = "tunif0"
/// fwmark = 1836018789
/// route_table = 1836018789
/// rule_priority = 5200
/// ready_timeout_ms = 5000
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Applications whose traffic stays outside the tunnel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_apps: Option<BTreeSet<String>>,

    /// Interface shape
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Platform options
    #[serde(default)]
    pub platform: PlatformConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to a TOML string
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.tunnel.validate()?;
        self.platform.validate()?;

        if let Some(ref apps) = self.excluded_apps {
            if apps.iter().any(|app| app.trim().is_empty()) {
                return Err(Error::Config("excluded application ids must not be empty".into()));
            }
        }

        Ok(())
    }

    /// Sample configuration with a dual-stack tunnel
    pub fn sample() -> Self {
        Self {
            excluded_apps: None,
            tunnel: TunnelConfig {
                addresses: BTreeSet::from([
                    IpAddr::V4(Ipv4Addr::new(10, 64, 0, 2)),
                    IpAddr::V6(Ipv6Addr::new(0xfc00, 0xbbbb, 0xbbbb, 0xbb01, 0, 0, 0, 2)),
                ]),
                dns_servers: vec![IpAddr::V4(Ipv4Addr::new(10, 64, 0, 1))],
                routes: BTreeSet::from([
                    IpNet::V4(Ipv4Net::default()),
                    IpNet::V6(Ipv6Net::default()),
                ]),
                mtu: DEFAULT_MTU,
            },
            platform: PlatformConfig {
                name: Some("tunif0".into()),
                ..PlatformConfig::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_prefix_len() {
        assert_eq!(host_prefix_len(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))), 32);
        assert_eq!(host_prefix_len(&IpAddr::V4(Ipv4Addr::UNSPECIFIED)), 32);
        assert_eq!(host_prefix_len(&IpAddr::V6(Ipv6Addr::LOCALHOST)), 128);
        assert_eq!(
            host_prefix_len(&"fc00:bbbb:bbbb:bb01::2".parse().unwrap()),
            128
        );
    }

    #[test]
    fn test_parse_address_rejects_other_families() {
        assert!(parse_address("10.64.0.2").unwrap().is_ipv4());
        assert!(parse_address(" fc00::2 ").unwrap().is_ipv6());

        for bad in ["relay.example.com", "fe80::1%eth0", "00:11:22:33:44:55", "", "10.0.0.0/8"] {
            let err = parse_address(bad).unwrap_err();
            assert!(matches!(err, Error::InvalidAddress(_)), "{bad} accepted");
        }
    }

    #[test]
    fn test_default_config_blocks_everything() {
        let config = TunnelConfig::default();
        assert_eq!(config.addresses.len(), 1);
        assert!(config.dns_servers.is_empty());
        assert_eq!(config.routes.len(), 2);
        assert!(config.has_ipv6_routes());
        assert_eq!(config.mtu, DEFAULT_MTU);
        config.validate().unwrap();
    }

    #[test]
    fn test_builder() {
        let config = TunnelConfig::builder()
            .address(Ipv4Addr::new(10, 64, 0, 2))
            .dns_server(Ipv4Addr::new(10, 64, 0, 1))
            .route_str("0.0.0.0/0")
            .unwrap()
            .mtu(1280)
            .build()
            .unwrap();

        assert!(!config.has_ipv6_routes());
        assert_eq!(config.mtu, 1280);
        assert_eq!(
            config.prefixed_addresses().collect::<Vec<_>>(),
            vec![(IpAddr::V4(Ipv4Addr::new(10, 64, 0, 2)), 32)]
        );
    }

    #[test]
    fn test_equality_is_structural() {
        let a = TunnelConfig::builder()
            .address_str("10.64.0.2")
            .unwrap()
            .address_str("fc00::2")
            .unwrap()
            .default_routes()
            .build()
            .unwrap();
        let b = TunnelConfig::builder()
            .address_str("fc00::2")
            .unwrap()
            .address_str("10.64.0.2")
            .unwrap()
            .route_str("::/0")
            .unwrap()
            .route_str("0.0.0.0/0")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(a, b);

        let c = a.clone();
        let c = TunnelConfig { mtu: c.mtu - 1, ..c };
        assert_ne!(a, c);
    }

    #[test]
    fn test_dns_order_matters() {
        let first = TunnelConfig::builder()
            .address(Ipv4Addr::new(10, 64, 0, 2))
            .dns_server(Ipv4Addr::new(1, 1, 1, 1))
            .dns_server(Ipv4Addr::new(9, 9, 9, 9))
            .build()
            .unwrap();
        let second = TunnelConfig::builder()
            .address(Ipv4Addr::new(10, 64, 0, 2))
            .dns_server(Ipv4Addr::new(9, 9, 9, 9))
            .dns_server(Ipv4Addr::new(1, 1, 1, 1))
            .build()
            .unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_validation_no_address() {
        assert!(TunnelConfig::builder().default_routes().build().is_err());
    }

    #[test]
    fn test_validation_mtu() {
        let result = TunnelConfig::builder()
            .address(Ipv4Addr::new(10, 64, 0, 2))
            .mtu(10)
            .build();
        assert!(result.is_err());

        let result = TunnelConfig::builder()
            .address(Ipv4Addr::new(10, 64, 0, 2))
            .route_str("::/0")
            .unwrap()
            .mtu(1200)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_route_host_bits() {
        let result = TunnelConfig::builder()
            .address(Ipv4Addr::new(10, 64, 0, 2))
            .route_str("10.64.0.1/24")
            .unwrap()
            .build();
        assert!(matches!(result, Err(Error::InvalidPrefix(_))));
    }

    #[test]
    fn test_validation_duplicate_dns() {
        let result = TunnelConfig::builder()
            .address(Ipv4Addr::new(10, 64, 0, 2))
            .dns_server(Ipv4Addr::new(10, 64, 0, 1))
            .dns_server(Ipv4Addr::new(10, 64, 0, 1))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_toml() {
        let config = Config::from_toml(
            r#"
            excluded_apps = ["org.example.browser"]

            [tunnel]
            addresses = ["10.64.0.2", "fc00:bbbb:bbbb:bb01::2"]
            dns_servers = ["10.64.0.1"]
            routes = ["0.0.0.0/0", "::/0"]

            [platform]
            name = "tunif0"
            "#,
        )
        .unwrap();

        assert_eq!(config.tunnel.addresses.len(), 2);
        assert_eq!(config.tunnel.mtu, DEFAULT_MTU);
        assert!(config.tunnel.has_ipv6_routes());
        assert_eq!(config.platform.fwmark, DEFAULT_FWMARK);
        assert_eq!(config.platform.route_table, DEFAULT_ROUTE_TABLE);
        assert_eq!(config.platform.ready_timeout(), Duration::from_secs(5));
        assert!(config
            .excluded_apps
            .unwrap()
            .contains("org.example.browser"));
    }

    #[test]
    fn test_from_toml_rejects_hostname_address() {
        let result = Config::from_toml(
            r#"
            [tunnel]
            addresses = ["relay.example.com"]
            "#,
        );
        assert!(matches!(result, Err(Error::ConfigParse(_))));
    }

    #[test]
    fn test_platform_validation() {
        assert!(PlatformConfig::default().validate().is_ok());

        let main_table = PlatformConfig {
            route_table: 254,
            ..PlatformConfig::default()
        };
        assert!(main_table.validate().is_err());

        let after_main = PlatformConfig {
            rule_priority: 32765,
            ..PlatformConfig::default()
        };
        assert!(after_main.validate().is_err());

        let unmarked = PlatformConfig {
            fwmark: 0,
            ..PlatformConfig::default()
        };
        assert!(unmarked.validate().is_err());
    }

    #[test]
    fn test_from_toml_rejects_long_name() {
        let result = Config::from_toml(
            r#"
            [tunnel]
            addresses = ["10.64.0.2"]

            [platform]
            name = "a-very-long-interface-name"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_sample_survives_toml() {
        let sample = Config::sample();
        let text = sample.to_toml().unwrap();
        assert_eq!(Config::from_toml(&text).unwrap(), sample);
    }
}
