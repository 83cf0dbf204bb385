//! Port ranges as declared by container images (`80/tcp`, `8000-8010/udp`).

use std::str::FromStr;

use crate::NetworkError;

/// Transport protocol of an exposed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

impl FromStr for Protocol {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "sctp" => Ok(Protocol::Sctp),
            other => Err(NetworkError::InvalidPort(format!("unknown protocol {}", other))),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive range of ports for one protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    pub protocol: Protocol,
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(protocol: Protocol, start: u16, end: u16) -> Result<Self, NetworkError> {
        if start == 0 || start > end {
            return Err(NetworkError::InvalidPort(format!("{}-{}", start, end)));
        }
        Ok(Self {
            protocol,
            start,
            end,
        })
    }

    /// Single TCP port.
    pub fn tcp(port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            start: port,
            end: port,
        }
    }

    /// Whether this range includes `port` for `protocol`.
    pub fn covers(&self, protocol: Protocol, port: u16) -> bool {
        self.protocol == protocol && self.start <= port && port <= self.end
    }

    /// Destination port argument in iptables syntax (`22` or `8000:8010`).
    pub fn dport(&self) -> String {
        if self.start == self.end {
            self.start.to_string()
        } else {
            format!("{}:{}", self.start, self.end)
        }
    }
}

impl FromStr for PortRange {
    type Err = NetworkError;

    /// Parse `port[-end][/proto]`; the protocol defaults to tcp.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ports, protocol) = match s.split_once('/') {
            Some((ports, proto)) => (ports, proto.parse()?),
            None => (s, Protocol::Tcp),
        };

        let parse_port = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| NetworkError::InvalidPort(s.to_string()))
        };

        let (start, end) = match ports.split_once('-') {
            Some((start, end)) => (parse_port(start)?, parse_port(end)?),
            None => {
                let port = parse_port(ports)?;
                (port, port)
            }
        };

        Self::new(protocol, start, end).map_err(|_| NetworkError::InvalidPort(s.to_string()))
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}/{}", self.start, self.protocol)
        } else {
            write!(f, "{}-{}/{}", self.start, self.end, self.protocol)
        }
    }
}
