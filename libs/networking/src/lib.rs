//! Networking model for container address assignment.
//!
//! This library provides:
//! - IPv4/IPv6 prefixes with masking, host indexing and random host selection
//! - Address blocks (prefix + gateway + lifetimes) as delivered by DHCP
//! - The host network configuration (`NetConf`), one variant per operating mode
//! - Port ranges as declared by container images

mod conf;
mod error;
mod ports;
mod prefix;

pub use conf::{BridgeConf, DnsConfig, IpvlanConf, Ipv4Block, Ipv6Block, NetConf, NetMode};
pub use error::NetworkError;
pub use ports::{PortRange, Protocol};
pub use prefix::{
    Ipv4Prefix, Ipv6Prefix, MAX_DELEGATED_PREFIX_LEN, MIN_DELEGATED_PREFIX_LEN,
};
