//! IPv4 and IPv6 prefixes.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use rand::Rng;

use crate::NetworkError;

/// Shortest delegated IPv6 prefix accepted for container addressing.
pub const MIN_DELEGATED_PREFIX_LEN: u8 = 48;

/// Longest delegated IPv6 prefix accepted for container addressing.
pub const MAX_DELEGATED_PREFIX_LEN: u8 = 96;

// ---- IPv6 ----

/// An IPv6 network, always stored with its host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv6Prefix {
    pub address: Ipv6Addr,
    pub prefix_len: u8,
}

impl Ipv6Prefix {
    /// Build a prefix, zeroing the host bits of `address`.
    pub fn new(address: Ipv6Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        check_len(prefix_len, 128)?;
        Ok(Self {
            address: mask_ipv6(address, prefix_len),
            prefix_len,
        })
    }

    /// Check that the prefix is usable as a delegated container block.
    pub fn validate_delegated(&self) -> Result<(), NetworkError> {
        if !(MIN_DELEGATED_PREFIX_LEN..=MAX_DELEGATED_PREFIX_LEN).contains(&self.prefix_len) {
            return Err(NetworkError::PrefixLengthOutOfRange {
                len: self.prefix_len,
                min: MIN_DELEGATED_PREFIX_LEN,
                max: MAX_DELEGATED_PREFIX_LEN,
            });
        }
        Ok(())
    }

    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        mask_ipv6(addr, self.prefix_len) == self.address
    }

    /// Network mask as an address (e.g. `ffff:ffff:ffff:ffff::` for a /64).
    pub fn netmask(&self) -> Ipv6Addr {
        Ipv6Addr::from(ipv6_mask_bits(self.prefix_len).to_be_bytes())
    }

    /// The n-th address of the prefix, counted from the network address.
    pub fn host(&self, n: u128) -> Result<Ipv6Addr, NetworkError> {
        if n > ipv6_host_bits(self.prefix_len) {
            return Err(NetworkError::HostOutOfRange {
                host: n,
                prefix: self.to_string(),
            });
        }
        let base = u128::from_be_bytes(self.address.octets());
        Ok(Ipv6Addr::from((base | n).to_be_bytes()))
    }

    /// Conventional gateway: the first host of the prefix.
    pub fn first_host(&self) -> Result<Ipv6Addr, NetworkError> {
        self.host(1)
    }

    /// Random address inside the prefix, drawn from a cryptographically secure RNG.
    pub fn random_address(&self) -> Ipv6Addr {
        let mut random = [0u8; 16];
        rand::rng().fill(&mut random);
        self.fill_host_bits(random)
    }

    /// Combine the prefix with host bits taken from `random`.
    ///
    /// Every output byte is `(prefix & mask) | (random & !mask)`, so the
    /// network part is kept bit-for-bit and the host part is copied from
    /// `random` unchanged.
    pub fn fill_host_bits(&self, random: [u8; 16]) -> Ipv6Addr {
        let prefix = self.address.octets();
        let mask = ipv6_mask_bits(self.prefix_len).to_be_bytes();

        let mut out = [0u8; 16];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = (prefix[i] & mask[i]) | (random[i] & !mask[i]);
        }
        Ipv6Addr::from(out)
    }
}

impl FromStr for Ipv6Prefix {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, len) = split_cidr(s)?;
        Self::new(address, len)
    }
}

impl fmt::Display for Ipv6Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Split `addr/len` and parse both halves.
fn split_cidr<A: FromStr>(input: &str) -> Result<(A, u8), NetworkError> {
    let malformed = |reason| NetworkError::MalformedCidr {
        input: input.to_string(),
        reason,
    };
    let (address, len) = input.split_once('/').ok_or_else(|| malformed("no prefix length"))?;
    let address = address.parse().map_err(|_| malformed("bad address"))?;
    let len = len.parse().map_err(|_| malformed("bad prefix length"))?;
    Ok((address, len))
}

fn check_len(len: u8, max: u8) -> Result<(), NetworkError> {
    if len > max {
        return Err(NetworkError::PrefixTooLong { len, max });
    }
    Ok(())
}

fn ipv6_mask_bits(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= 128 {
        u128::MAX
    } else {
        u128::MAX << (128 - prefix_len)
    }
}

fn ipv6_host_bits(prefix_len: u8) -> u128 {
    !ipv6_mask_bits(prefix_len)
}

fn mask_ipv6(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let bits = u128::from_be_bytes(addr.octets());
    Ipv6Addr::from((bits & ipv6_mask_bits(prefix_len)).to_be_bytes())
}

// ---- IPv4 ----

/// An IPv4 network, always stored with its host bits cleared.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Ipv4Prefix {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
}

impl Ipv4Prefix {
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        check_len(prefix_len, 32)?;
        Ok(Self {
            address: mask_ipv4(address, prefix_len),
            prefix_len,
        })
    }

    /// Build a prefix from an address and a dotted netmask, as DHCPv4
    /// option 1 carries it.
    pub fn from_netmask(address: Ipv4Addr, netmask: Ipv4Addr) -> Result<Self, NetworkError> {
        let bits = u32::from(netmask);
        let ones = bits.leading_ones();
        if bits.count_ones() != ones {
            return Err(NetworkError::NonContiguousNetmask(netmask));
        }
        Self::new(address, ones as u8)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        mask_ipv4(addr, self.prefix_len) == self.address
    }

    /// Network mask in dotted form.
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(ipv4_mask_bits(self.prefix_len))
    }

    /// The n-th address of the prefix, counted from the network address.
    pub fn host(&self, n: u32) -> Result<Ipv4Addr, NetworkError> {
        if n & ipv4_mask_bits(self.prefix_len) != 0 {
            return Err(NetworkError::HostOutOfRange {
                host: n as u128,
                prefix: self.to_string(),
            });
        }
        Ok(Ipv4Addr::from(u32::from(self.address) | n))
    }
}

impl FromStr for Ipv4Prefix {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, len) = split_cidr(s)?;
        Self::new(address, len)
    }
}

impl fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

fn ipv4_mask_bits(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix_len)
    }
}

fn mask_ipv4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr) & ipv4_mask_bits(prefix_len))
}
