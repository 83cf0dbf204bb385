//! DHCPv4 leases for dual-stack (ipvlan) networks.

mod client;
pub mod codec;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use ctnet_networking::{DnsConfig, Ipv4Block, Ipv4Prefix};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use client::{Dhcp4Client, Dhcp4Endpoints, CLIENT_PORT, SERVER_PORT};

use crate::DhcpError;
use codec::{DhcpOption, Message};

/// Lease time assumed when the server omits option 51.
pub const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(3600);

/// Configuration carried by an OFFER or ACK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub address: Ipv4Addr,
    #[serde(default)]
    pub subnet_mask: Option<Ipv4Addr>,
    #[serde(default)]
    pub routers: Vec<Ipv4Addr>,
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
    #[serde(default)]
    pub domain_search: Vec<String>,
    #[serde(default)]
    pub server_id: Option<Ipv4Addr>,
    /// Lease time in seconds.
    #[serde(default)]
    pub lease_time: Option<u32>,
}

impl LeaseInfo {
    pub fn from_message(msg: &Message) -> Self {
        let addresses = |code| {
            msg.option(code)
                .map(|data| codec::decode_addresses(data))
                .unwrap_or_default()
        };

        let mut domain_search = match msg.option(DhcpOption::DomainSearch) {
            Some(data) => codec::decode_search(data).unwrap_or_else(|e| {
                warn!(error = %e, "Ignoring malformed domain search option");
                Vec::new()
            }),
            None => Vec::new(),
        };
        if domain_search.is_empty() {
            if let Some(domain) = msg.option(DhcpOption::DomainName) {
                let domain = String::from_utf8_lossy(domain)
                    .trim_end_matches('\0')
                    .to_string();
                if !domain.is_empty() {
                    domain_search.push(domain);
                }
            }
        }

        Self {
            address: msg.yiaddr,
            subnet_mask: msg
                .option(DhcpOption::SubnetMask)
                .and_then(|data| codec::decode_address(data)),
            routers: addresses(DhcpOption::Router),
            dns_servers: addresses(DhcpOption::DnsServer),
            domain_search,
            server_id: msg
                .option(DhcpOption::ServerIdentifier)
                .and_then(|data| codec::decode_address(data)),
            lease_time: msg
                .option(DhcpOption::LeaseTime)
                .and_then(|data| codec::decode_u32(data)),
        }
    }

    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.routers.first().copied()
    }

    pub fn ttl(&self) -> Duration {
        self.lease_time
            .map(|secs| Duration::from_secs(u64::from(secs)))
            .unwrap_or(DEFAULT_LEASE_TIME)
    }

    /// Network block for the lease: the address masked by the subnet mask,
    /// the first router as gateway, and half the TTL as preferred lifetime.
    pub fn to_block(&self) -> Result<Ipv4Block, DhcpError> {
        let gateway = self.gateway().ok_or(DhcpError::NoRouter)?;
        let mask = self
            .subnet_mask
            .ok_or_else(|| DhcpError::Malformed("lease without subnet mask".to_string()))?;
        let prefix = Ipv4Prefix::from_netmask(self.address, mask)?;
        let ttl = self.ttl();
        Ok(Ipv4Block::new(prefix, gateway)?.with_lifetimes(ttl / 2, ttl))
    }

    pub fn dns(&self) -> DnsConfig {
        DnsConfig {
            servers: self.dns_servers.iter().copied().map(IpAddr::V4).collect(),
            search: self.domain_search.clone(),
        }
    }
}
