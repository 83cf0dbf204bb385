//! Error types for the networking model.

use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Text that is not `address/length`.
    #[error("malformed CIDR {input:?}: {reason}")]
    MalformedCidr { input: String, reason: &'static str },

    /// Prefix length longer than the address family allows.
    #[error("prefix length /{len} exceeds /{max}")]
    PrefixTooLong { len: u8, max: u8 },

    /// Netmask with zero bits between its one bits.
    #[error("netmask {0} is not contiguous")]
    NonContiguousNetmask(std::net::Ipv4Addr),

    /// Delegated prefix length outside the accepted window.
    #[error("prefix length /{len} is outside /{min}../{max}")]
    PrefixLengthOutOfRange { len: u8, min: u8, max: u8 },

    /// Gateway address does not belong to its prefix.
    #[error("gateway {gateway} is not inside prefix {prefix}")]
    GatewayOutsidePrefix { gateway: String, prefix: String },

    /// Host index does not fit in the prefix.
    #[error("host #{host} does not fit in prefix {prefix}")]
    HostOutOfRange { host: u128, prefix: String },

    /// A mode requires an address family that was not configured.
    #[error("{mode} mode requires an {family} address block")]
    MissingAddressFamily {
        mode: &'static str,
        family: &'static str,
    },

    /// A mode requires a bound interface.
    #[error("{0} mode requires a network interface")]
    MissingInterface(&'static str),

    /// Unknown operating mode.
    #[error("invalid network mode: {0}")]
    InvalidMode(String),

    /// Invalid port or port range.
    #[error("invalid port specification: {0}")]
    InvalidPort(String),
}
