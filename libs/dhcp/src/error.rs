//! DHCP client errors.

use ctnet_networking::NetworkError;
use thiserror::Error;

/// Errors from DHCP exchanges and lease state.
#[derive(Debug, Error)]
pub enum DhcpError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("interface {interface}: {reason}")]
    Interface { interface: String, reason: String },

    #[error("{exchange}: no response after {attempts} attempts")]
    Timeout {
        exchange: &'static str,
        attempts: u32,
    },

    #[error("malformed DHCP message: {0}")]
    Malformed(String),

    #[error("No option IA PD found")]
    NoIaPd,

    #[error("No prefix available for delegation")]
    NoPrefixAvailable,

    #[error("No prefixes returned in IA PD")]
    NoPrefixes,

    #[error("server status {code}: {message}")]
    Status { code: u16, message: String },

    #[error("delegated prefix rejected: {0}")]
    Policy(#[from] NetworkError),

    #[error("DHCPv4 lease does not contain a router")]
    NoRouter,

    #[error("DHCPv4 server declined the request: {0}")]
    Nak(String),

    #[error("lease state {path}: {reason}")]
    State { path: String, reason: String },
}

impl DhcpError {
    /// Whether a fresh exchange might succeed where this one failed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DhcpError::Io(_) | DhcpError::Timeout { .. } | DhcpError::Nak(_)
        )
    }
}
