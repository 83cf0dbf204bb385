//! Interface lookups needed to build DHCP messages.

use crate::DhcpError;

/// MAC address of `interface`, read from sysfs.
pub fn hardware_address(interface: &str) -> Result<[u8; 6], DhcpError> {
    let path = format!("/sys/class/net/{}/address", interface);
    let content = std::fs::read_to_string(&path).map_err(|e| DhcpError::Interface {
        interface: interface.to_string(),
        reason: format!("cannot read {}: {}", path, e),
    })?;
    parse_hardware_address(content.trim()).ok_or_else(|| DhcpError::Interface {
        interface: interface.to_string(),
        reason: format!("unexpected hardware address {:?}", content.trim()),
    })
}

/// Parse `aa:bb:cc:dd:ee:ff`.
pub fn parse_hardware_address(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

/// Kernel index of `interface`, used as the scope of link-local multicast.
pub fn interface_index(interface: &str) -> Result<u32, DhcpError> {
    nix::net::if_::if_nametoindex(interface).map_err(|e| DhcpError::Interface {
        interface: interface.to_string(),
        reason: e.to_string(),
    })
}
