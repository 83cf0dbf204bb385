//! Container attachment to the managed network.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use ctnet_dhcp::{make_client_id, DhcpError, LeaseClient};
use ctnet_events::ContainerRef;
use thiserror::Error;
use tracing::{info, warn};

use crate::engine::{ContainerEngine, EndpointRequest, EngineError};
use crate::network::ManagedNetwork;

/// Draws before giving up on avoiding the reserved addresses of a prefix.
const ADDRESS_DRAWS: usize = 8;

/// Errors from attaching or detaching a container.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("DHCPv4 lease error: {0}")]
    Lease(#[from] DhcpError),

    #[error("ipvlan network {0} has no parent interface")]
    NoParent(String),
}

/// A container's membership in the managed network.
///
/// Addresses are filled when the container is attached, or read back from
/// the engine the first time they are needed.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub container: ContainerRef,
    pub network: Arc<ManagedNetwork>,
    pub ipv6: Option<Ipv6Addr>,
    pub ipv4: Option<Ipv4Addr>,
}

impl Attachment {
    pub fn new(container: ContainerRef, network: Arc<ManagedNetwork>) -> Self {
        Self {
            container,
            network,
            ipv6: None,
            ipv4: None,
        }
    }
}

/// Random address inside the network's IPv6 prefix, avoiding the network
/// address and the gateway.
pub fn random_address(network: &ManagedNetwork) -> Ipv6Addr {
    let prefix = network.v6_prefix;
    let mut address = prefix.random_address();
    for _ in 1..ADDRESS_DRAWS {
        if address != prefix.address && address != network.v6_gateway {
            break;
        }
        address = prefix.random_address();
    }
    address
}

/// Connects containers to the managed network with explicit addresses.
pub struct AttachmentManager {
    engine: Arc<dyn ContainerEngine>,
    /// Per-container DHCPv4 leases, ipvlan only.
    leases: Option<LeaseClient>,
}

impl AttachmentManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, leases: Option<LeaseClient>) -> Self {
        Self { engine, leases }
    }

    /// Connect `container` to `network` with a fresh random IPv6 address
    /// and, on ipvlan networks, a leased IPv4 address.
    pub async fn attach(
        &self,
        container: &ContainerRef,
        network: &Arc<ManagedNetwork>,
    ) -> Result<Attachment, AttachError> {
        let mut attachment = Attachment::new(container.clone(), network.clone());
        attachment.ipv6 = Some(random_address(network));

        let lease = match (&self.leases, network.is_bridge()) {
            (Some(leases), false) => Some(self.lease_v4(leases, container, network).await?),
            _ => None,
        };
        attachment.ipv4 = lease.as_ref().map(|l| l.address());

        let endpoint = EndpointRequest {
            ipv4: attachment.ipv4,
            ipv6: attachment.ipv6,
        };
        if let Err(e) = self
            .engine
            .connect(&network.id, &container.id, &endpoint)
            .await
        {
            if let (Some(leases), Some(lease)) = (&self.leases, &lease) {
                if let Err(release_err) = leases.release(lease).await {
                    warn!(
                        container_id = %container.short_id(),
                        error = %release_err,
                        "Failed to release DHCPv4 lease after connect failure"
                    );
                }
            }
            return Err(e.into());
        }

        info!(
            container_id = %container.short_id(),
            container_name = %container.name,
            network = %network.name,
            ipv6 = ?attachment.ipv6,
            ipv4 = ?attachment.ipv4,
            "Attached container"
        );
        Ok(attachment)
    }

    async fn lease_v4(
        &self,
        leases: &LeaseClient,
        container: &ContainerRef,
        network: &ManagedNetwork,
    ) -> Result<ctnet_dhcp::DhcpLeaseV4, AttachError> {
        let parent = network
            .parent
            .as_deref()
            .ok_or_else(|| AttachError::NoParent(network.name.clone()))?;
        let client_id = make_client_id(&container.id);
        let preferred = leases.store().load(&client_id)?.map(|l| l.address());

        let lease = leases
            .lease(parent, &client_id, &container.name, preferred)
            .await?;
        if let Some(prefix) = network.v4_prefix {
            if !prefix.contains(lease.address()) {
                warn!(
                    container_id = %container.short_id(),
                    address = %lease.address(),
                    prefix = %prefix,
                    "Leased IPv4 address is outside the managed network"
                );
            }
        }
        Ok(lease)
    }

    /// Disconnect `container` from `network`. Already-detached containers
    /// are not an error.
    pub async fn detach(
        &self,
        container: &ContainerRef,
        network: &ManagedNetwork,
    ) -> Result<(), AttachError> {
        self.engine.disconnect(&network.id, &container.id).await?;

        if let (Some(leases), false) = (&self.leases, network.is_bridge()) {
            let released = leases
                .release_client(&make_client_id(&container.id))
                .await?;
            if released {
                info!(container_id = %container.short_id(), "Released container DHCPv4 lease");
            }
        }

        info!(
            container_id = %container.short_id(),
            container_name = %container.name,
            network = %network.name,
            "Detached container"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;
    use ctnet_networking::NetMode;

    fn bridge_network(prefix: &str) -> Arc<ManagedNetwork> {
        let prefix: ctnet_networking::Ipv6Prefix = prefix.parse().unwrap();
        Arc::new(ManagedNetwork {
            id: "net-1".to_string(),
            name: "ctnet-ipv6".to_string(),
            mode: NetMode::Bridge,
            v6_prefix: prefix,
            v6_gateway: prefix.first_host().unwrap(),
            v4_prefix: None,
            v4_gateway: None,
            parent: None,
        })
    }

    #[test]
    fn test_random_address_inside_prefix() {
        for prefix in ["2001:db8:1::/48", "2001:db8:1:2::/64", "2001:db8::1:0:0/96"] {
            let network = bridge_network(prefix);
            for _ in 0..200 {
                let address = random_address(&network);
                assert!(network.v6_prefix.contains(address), "{} not in {}", address, prefix);
                assert_ne!(address, network.v6_gateway);
            }
        }
    }

    #[tokio::test]
    async fn test_attach_connects_with_ipv6_override() {
        let engine = Arc::new(MockEngine::new());
        engine.add_container("c1", "web", "nginx", &[]);
        let manager = AttachmentManager::new(engine.clone(), None);
        let network = bridge_network("2001:db8:1:2::/64");

        let attachment = manager
            .attach(&ContainerRef::new("c1", "web", "nginx"), &network)
            .await
            .unwrap();

        let connections = engine.connections();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].network_id, "net-1");
        assert_eq!(connections[0].endpoint.ipv6, attachment.ipv6);
        assert_eq!(connections[0].endpoint.ipv4, None);
        assert!(network.v6_prefix.contains(attachment.ipv6.unwrap()));
    }

    #[tokio::test]
    async fn test_attach_unknown_container_fails() {
        let engine = Arc::new(MockEngine::new());
        let manager = AttachmentManager::new(engine, None);
        let err = manager
            .attach(
                &ContainerRef::new("missing", "x", "img"),
                &bridge_network("2001:db8::/64"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AttachError::Engine(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_detach_is_idempotent() {
        let engine = Arc::new(MockEngine::new());
        let manager = AttachmentManager::new(engine.clone(), None);
        let network = bridge_network("2001:db8::/64");
        let container = ContainerRef::new("gone", "x", "img");

        manager.detach(&container, &network).await.unwrap();
        manager.detach(&container, &network).await.unwrap();
        assert_eq!(engine.disconnections().len(), 2);
    }
}
