//! Configuration for the net agent.

use std::net::Ipv6Addr;
use std::path::PathBuf;

use clap::Parser;
use ctnet_events::EventFilter;
use ctnet_networking::{Ipv6Block, Ipv6Prefix, NetMode, NetworkError};
use thiserror::Error;

/// Errors in the command-line or environment configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--net-type={mode} requires --net-interface")]
    MissingInterface { mode: NetMode },

    #[error("IPv6 auto-configuration is not supported in ipvlan mode, use --ipv6-prefix")]
    IpvlanNeedsStaticPrefix,

    #[error("--ipv6-gateway requires --ipv6-prefix")]
    GatewayWithoutPrefix,

    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// Net agent configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "net-agent", version, about = "Routable IPv6 for containers")]
pub struct Config {
    /// Network type: bridge or ipvlan. Networking is disabled when unset.
    #[arg(long, env = "CTNET_NET_TYPE", default_value = "none")]
    pub net_type: NetMode,

    /// Host interface facing the upstream network.
    #[arg(long, env = "CTNET_NET_INTERFACE")]
    pub net_interface: Option<String>,

    /// Static IPv6 prefix instead of DHCPv6 prefix delegation.
    #[arg(long, env = "CTNET_IPV6_PREFIX")]
    pub ipv6_prefix: Option<Ipv6Prefix>,

    /// Gateway for the static prefix (default: first host of the prefix).
    #[arg(long, env = "CTNET_IPV6_GATEWAY")]
    pub ipv6_gateway: Option<Ipv6Addr>,

    /// Request the delegated prefix with a DUID shared across hosts.
    #[arg(long, env = "CTNET_SHARED_PREFIX")]
    pub shared_prefix: bool,

    /// Verbose DHCP logging including packet dumps.
    #[arg(long, env = "CTNET_DEBUG")]
    pub debug: bool,

    /// Directory for persisted state (DHCPv4 leases).
    #[arg(long, env = "CTNET_STATE_DIR", default_value = "/var/lib/ctnet")]
    pub state_dir: PathBuf,

    /// Container engine API socket.
    #[arg(long, env = "CTNET_DOCKER_SOCKET", default_value = "/var/run/docker.sock")]
    pub docker_socket: PathBuf,

    /// Container name prefixes that are never attached.
    #[arg(
        long = "exclude-name-prefix",
        env = "CTNET_EXCLUDE_NAME_PREFIXES",
        value_delimiter = ',',
        default_value = "C."
    )]
    pub exclude_name_prefixes: Vec<String>,

    /// Container names that are never attached.
    #[arg(
        long = "exclude-name",
        env = "CTNET_EXCLUDE_NAMES",
        value_delimiter = ',',
        default_value = "promtail"
    )]
    pub exclude_names: Vec<String>,

    /// DHCPv4 client identifier used to discover the shared IPv4 network.
    #[arg(long, env = "CTNET_V4_CLIENT_ID", default_value = "ctnet-agent")]
    pub v4_client_id: String,

    /// Seconds between DHCPv4 lease renewal sweeps.
    #[arg(long, env = "CTNET_V4_RENEW_INTERVAL_SECS", default_value_t = 60)]
    pub v4_renew_interval_secs: u64,
}

impl Config {
    /// Check cross-flag constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.net_type != NetMode::None && self.interface().is_none() {
            return Err(ConfigError::MissingInterface {
                mode: self.net_type,
            });
        }
        if self.ipv6_gateway.is_some() && self.ipv6_prefix.is_none() {
            return Err(ConfigError::GatewayWithoutPrefix);
        }
        if self.net_type == NetMode::Ipvlan && self.ipv6_prefix.is_none() {
            return Err(ConfigError::IpvlanNeedsStaticPrefix);
        }
        if let Some(prefix) = &self.ipv6_prefix {
            prefix.validate_delegated()?;
        }
        Ok(())
    }

    /// Bound interface, treating an empty value as unset.
    pub fn interface(&self) -> Option<&str> {
        self.net_interface.as_deref().filter(|s| !s.is_empty())
    }

    /// Block for a statically configured prefix, if one is set.
    pub fn static_v6_block(&self) -> Result<Option<Ipv6Block>, ConfigError> {
        let Some(prefix) = self.ipv6_prefix else {
            return Ok(None);
        };
        prefix.validate_delegated()?;
        let block = match self.ipv6_gateway {
            Some(gateway) => Ipv6Block::new(prefix, gateway)?,
            None => Ipv6Block::with_first_host_gateway(prefix)?,
        };
        Ok(Some(block))
    }

    pub fn lease_dir(&self) -> PathBuf {
        self.state_dir.join("lease")
    }

    pub fn event_filter(&self) -> EventFilter {
        EventFilter::new(
            self.exclude_name_prefixes.clone(),
            self.exclude_names.clone(),
        )
    }
}
