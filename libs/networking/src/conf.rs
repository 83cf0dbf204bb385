//! Host network configuration.
//!
//! A `NetConf` describes what the host hands out to containers: the
//! delegated IPv6 block (and, in ipvlan mode, the shared IPv4 block), the
//! DNS settings learned alongside them, and the interface they came from.
//! Required fields are checked once, when the value is built.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::time::Duration;

use crate::{Ipv4Prefix, Ipv6Prefix, NetworkError};

// ============================================================================
// Address blocks
// ============================================================================

/// IPv6 prefix with its gateway and lifetimes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Block {
    pub prefix: Ipv6Prefix,
    pub gateway: Ipv6Addr,
    pub preferred_lifetime: Duration,
    pub valid_lifetime: Duration,
}

impl Ipv6Block {
    /// Create a block with an explicit gateway.
    pub fn new(prefix: Ipv6Prefix, gateway: Ipv6Addr) -> Result<Self, NetworkError> {
        if !prefix.contains(gateway) {
            return Err(NetworkError::GatewayOutsidePrefix {
                gateway: gateway.to_string(),
                prefix: prefix.to_string(),
            });
        }
        Ok(Self {
            prefix,
            gateway,
            preferred_lifetime: Duration::ZERO,
            valid_lifetime: Duration::ZERO,
        })
    }

    /// Create a block whose gateway is the first host of the prefix.
    pub fn with_first_host_gateway(prefix: Ipv6Prefix) -> Result<Self, NetworkError> {
        let gateway = prefix.first_host()?;
        Self::new(prefix, gateway)
    }

    /// Set preferred and valid lifetimes.
    pub fn with_lifetimes(mut self, preferred: Duration, valid: Duration) -> Self {
        self.preferred_lifetime = preferred;
        self.valid_lifetime = valid;
        self
    }
}

/// IPv4 prefix with its gateway and lifetimes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Block {
    pub prefix: Ipv4Prefix,
    pub gateway: Ipv4Addr,
    pub preferred_lifetime: Duration,
    pub valid_lifetime: Duration,
}

impl Ipv4Block {
    /// Create a block with an explicit gateway.
    pub fn new(prefix: Ipv4Prefix, gateway: Ipv4Addr) -> Result<Self, NetworkError> {
        if !prefix.contains(gateway) {
            return Err(NetworkError::GatewayOutsidePrefix {
                gateway: gateway.to_string(),
                prefix: prefix.to_string(),
            });
        }
        Ok(Self {
            prefix,
            gateway,
            preferred_lifetime: Duration::ZERO,
            valid_lifetime: Duration::ZERO,
        })
    }

    /// Set preferred and valid lifetimes.
    pub fn with_lifetimes(mut self, preferred: Duration, valid: Duration) -> Self {
        self.preferred_lifetime = preferred;
        self.valid_lifetime = valid;
        self
    }
}

/// DNS resolvers and search domains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsConfig {
    pub servers: Vec<IpAddr>,
    pub search: Vec<String>,
}

impl DnsConfig {
    /// Merge DNS settings from both families.
    ///
    /// Servers are IPv6 first, then IPv4. The search list comes from IPv4
    /// when it has one, otherwise from IPv6.
    pub fn merge(v6: &DnsConfig, v4: &DnsConfig) -> DnsConfig {
        let servers = v6.servers.iter().chain(v4.servers.iter()).copied().collect();
        let search = if v4.search.is_empty() {
            v6.search.clone()
        } else {
            v4.search.clone()
        };
        DnsConfig { servers, search }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty() && self.search.is_empty()
    }
}

// ============================================================================
// Operating mode
// ============================================================================

/// How containers are connected to the host network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetMode {
    /// Network attachment disabled.
    None,
    /// Routed IPv6 behind a software bridge.
    Bridge,
    /// Containers share the parent interface's L2 domain (IPv4 + IPv6).
    Ipvlan,
}

impl NetMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetMode::None => "none",
            NetMode::Bridge => "bridge",
            NetMode::Ipvlan => "ipvlan",
        }
    }

    /// Container engine network driver for this mode.
    pub fn driver(&self) -> Option<&'static str> {
        match self {
            NetMode::None => None,
            NetMode::Bridge => Some("bridge"),
            NetMode::Ipvlan => Some("ipvlan"),
        }
    }
}

impl FromStr for NetMode {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "none" => Ok(NetMode::None),
            "bridge" => Ok(NetMode::Bridge),
            "ipvlan" => Ok(NetMode::Ipvlan),
            other => Err(NetworkError::InvalidMode(other.to_string())),
        }
    }
}

impl std::fmt::Display for NetMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// NetConf
// ============================================================================

/// Bridge mode: routed IPv6 only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConf {
    interface: String,
    v6: Ipv6Block,
    dns: DnsConfig,
}

/// Ipvlan mode: both families on the parent interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpvlanConf {
    interface: String,
    v4: Ipv4Block,
    v6: Ipv6Block,
    dns: DnsConfig,
}

/// Validated host network configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetConf {
    None,
    Bridge(BridgeConf),
    Ipvlan(IpvlanConf),
}

impl NetConf {
    /// Build a bridge configuration.
    pub fn bridge(
        interface: impl Into<String>,
        v6: Ipv6Block,
        dns: DnsConfig,
    ) -> Result<Self, NetworkError> {
        let interface = require_interface(interface.into(), NetMode::Bridge)?;
        v6.prefix.validate_delegated()?;
        Ok(NetConf::Bridge(BridgeConf { interface, v6, dns }))
    }

    /// Build an ipvlan configuration. Both families are mandatory.
    pub fn ipvlan(
        interface: impl Into<String>,
        v4: Option<Ipv4Block>,
        v6: Option<Ipv6Block>,
        dns: DnsConfig,
    ) -> Result<Self, NetworkError> {
        let interface = require_interface(interface.into(), NetMode::Ipvlan)?;
        let v4 = v4.ok_or(NetworkError::MissingAddressFamily {
            mode: "ipvlan",
            family: "IPv4",
        })?;
        let v6 = v6.ok_or(NetworkError::MissingAddressFamily {
            mode: "ipvlan",
            family: "IPv6",
        })?;
        v6.prefix.validate_delegated()?;
        Ok(NetConf::Ipvlan(IpvlanConf {
            interface,
            v4,
            v6,
            dns,
        }))
    }

    /// Merge per-family results into a configuration for `mode`.
    pub fn merge(
        mode: NetMode,
        interface: impl Into<String>,
        v4: Option<(Ipv4Block, DnsConfig)>,
        v6: Option<(Ipv6Block, DnsConfig)>,
    ) -> Result<Self, NetworkError> {
        let (v4_block, v4_dns) = split(v4);
        let (v6_block, v6_dns) = split(v6);
        let dns = DnsConfig::merge(&v6_dns, &v4_dns);

        match mode {
            NetMode::None => Ok(NetConf::None),
            NetMode::Bridge => {
                let v6 = v6_block.ok_or(NetworkError::MissingAddressFamily {
                    mode: "bridge",
                    family: "IPv6",
                })?;
                NetConf::bridge(interface, v6, dns)
            }
            NetMode::Ipvlan => NetConf::ipvlan(interface, v4_block, v6_block, dns),
        }
    }

    pub fn mode(&self) -> NetMode {
        match self {
            NetConf::None => NetMode::None,
            NetConf::Bridge(_) => NetMode::Bridge,
            NetConf::Ipvlan(_) => NetMode::Ipvlan,
        }
    }

    pub fn interface(&self) -> Option<&str> {
        match self {
            NetConf::None => None,
            NetConf::Bridge(c) => Some(&c.interface),
            NetConf::Ipvlan(c) => Some(&c.interface),
        }
    }

    pub fn v6(&self) -> Option<&Ipv6Block> {
        match self {
            NetConf::None => None,
            NetConf::Bridge(c) => Some(&c.v6),
            NetConf::Ipvlan(c) => Some(&c.v6),
        }
    }

    pub fn v4(&self) -> Option<&Ipv4Block> {
        match self {
            NetConf::Ipvlan(c) => Some(&c.v4),
            _ => None,
        }
    }

    pub fn dns(&self) -> Option<&DnsConfig> {
        match self {
            NetConf::None => None,
            NetConf::Bridge(c) => Some(&c.dns),
            NetConf::Ipvlan(c) => Some(&c.dns),
        }
    }

    pub fn has_v4(&self) -> bool {
        self.v4().is_some()
    }

    pub fn has_v6(&self) -> bool {
        self.v6().is_some()
    }

    /// Replace the IPv6 block after a renewal. The new block is validated
    /// with the same policy as at construction.
    pub fn replace_v6(&mut self, block: Ipv6Block) -> Result<(), NetworkError> {
        block.prefix.validate_delegated()?;
        match self {
            NetConf::None => Err(NetworkError::InvalidMode("none".to_string())),
            NetConf::Bridge(c) => {
                c.v6 = block;
                Ok(())
            }
            NetConf::Ipvlan(c) => {
                c.v6 = block;
                Ok(())
            }
        }
    }
}

fn require_interface(interface: String, mode: NetMode) -> Result<String, NetworkError> {
    if interface.is_empty() {
        return Err(NetworkError::MissingInterface(mode.as_str()));
    }
    Ok(interface)
}

fn split<B>(family: Option<(B, DnsConfig)>) -> (Option<B>, DnsConfig) {
    match family {
        Some((block, dns)) => (Some(block), dns),
        None => (None, DnsConfig::default()),
    }
}
