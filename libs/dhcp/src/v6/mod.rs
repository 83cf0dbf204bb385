//! DHCPv6 prefix delegation.

mod client;
pub mod codec;
mod duid;

pub use client::{
    process_reply, DelegatedPrefix, Dhcp6Client, Dhcp6Config, CLIENT_PORT,
    ALL_DHCP_RELAY_AGENTS_AND_SERVERS, SERVER_PORT,
};
pub use duid::{Duid, IAID};
