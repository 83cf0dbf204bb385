//! DHCP clients used to obtain container address space from the upstream
//! network.
//!
//! - `v6`: DHCPv6 prefix delegation (rapid-commit SOLICIT, REQUEST fallback)
//! - `v4`: DHCPv4 DISCOVER/REQUEST/RELEASE with client identifiers
//! - `lease`: persisted DHCPv4 leases and their renewal policy
//!
//! Both clients speak UDP directly on the bound interface; nothing here
//! configures addresses on the host.

mod dns;
mod error;
mod iface;
mod transport;

pub mod lease;
pub mod v4;
pub mod v6;

pub use error::DhcpError;
pub use iface::{hardware_address, interface_index, parse_hardware_address};
pub use lease::{
    make_client_id, DhcpLeaseV4, LeaseClient, LeaseProvider, LeaseStore, RenewSummary,
};
pub use transport::Retransmit;
pub use v4::{Dhcp4Client, Dhcp4Endpoints, LeaseInfo};
pub use v6::{DelegatedPrefix, Dhcp6Client, Dhcp6Config, Duid};
