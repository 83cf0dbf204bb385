//! Dual-stack attachment on an ipvlan network with per-container DHCPv4
//! leases.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ctnet_dhcp::{make_client_id, DhcpError, LeaseClient, LeaseInfo, LeaseProvider, LeaseStore};
use ctnet_events::{EngineEvent, EventFilter, EventKind};
use ctnet_net_agent::attach::AttachmentManager;
use ctnet_net_agent::engine::MockEngine;
use ctnet_net_agent::firewall::MemoryFirewall;
use ctnet_net_agent::listener::NetAttachListener;
use ctnet_net_agent::network::NetworkSelector;
use ctnet_net_agent::ports::PortRouter;
use ctnet_net_agent::reconciler::{Dispatch, Reconciler, ReconcilerConfig};
use ctnet_networking::{DnsConfig, Ipv4Block, Ipv6Block, NetConf};
use tempfile::TempDir;

const CONTAINER_ID: &str = "c0ffee01";

/// Hands out consecutive addresses from 192.168.7.50 and records calls.
#[derive(Default)]
struct FakeDhcp {
    next: Mutex<u8>,
    calls: Mutex<Vec<String>>,
}

impl FakeDhcp {
    fn info(&self, address: Ipv4Addr) -> LeaseInfo {
        LeaseInfo {
            address,
            subnet_mask: Some(Ipv4Addr::new(255, 255, 255, 0)),
            routers: vec![Ipv4Addr::new(192, 168, 7, 1)],
            dns_servers: vec![Ipv4Addr::new(192, 168, 7, 1)],
            domain_search: vec![],
            server_id: Some(Ipv4Addr::new(192, 168, 7, 1)),
            lease_time: Some(3600),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LeaseProvider for FakeDhcp {
    async fn discover(&self, _: &str, _: &[u8]) -> Result<LeaseInfo, DhcpError> {
        Ok(self.info(Ipv4Addr::new(192, 168, 7, 2)))
    }

    async fn request(
        &self,
        interface: &str,
        client_id: &[u8],
        hostname: &str,
        _preferred: Option<Ipv4Addr>,
    ) -> Result<LeaseInfo, DhcpError> {
        self.calls.lock().unwrap().push(format!(
            "request {} {} {}",
            interface,
            hex::encode(client_id),
            hostname
        ));
        let mut next = self.next.lock().unwrap();
        let address = Ipv4Addr::new(192, 168, 7, 50 + *next);
        *next += 1;
        Ok(self.info(address))
    }

    async fn release(&self, _: &str, client_id: &[u8], _: &LeaseInfo) -> Result<(), DhcpError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("release {}", hex::encode(client_id)));
        Ok(())
    }
}

fn ipvlan_conf() -> NetConf {
    let v6 = Ipv6Block::with_first_host_gateway("2001:db8:7::/64".parse().unwrap()).unwrap();
    let v4 = Ipv4Block::new(
        "192.168.7.0/24".parse().unwrap(),
        Ipv4Addr::new(192, 168, 7, 1),
    )
    .unwrap();
    NetConf::ipvlan("eth0", Some(v4), Some(v6), DnsConfig::default()).unwrap()
}

fn event(action: &str) -> EngineEvent {
    EngineEvent::new(EventKind::Container, action, CONTAINER_ID)
        .with_attribute("name", "db")
        .with_attribute("image", "postgres:16")
}

#[tokio::test]
async fn test_ipvlan_lifecycle_with_lease() {
    let dir = TempDir::new().unwrap();
    let dhcp = Arc::new(FakeDhcp::default());
    let leases = LeaseClient::new(dhcp.clone(), LeaseStore::new(dir.path()));

    let engine = Arc::new(MockEngine::new());
    engine.add_container(CONTAINER_ID, "db", "postgres:16", &["5432/tcp"]);
    let firewall = Arc::new(MemoryFirewall::new());

    let network = Arc::new(
        NetworkSelector::new(engine.clone())
            .select_or_create(&ipvlan_conf())
            .await
            .unwrap(),
    );
    assert_eq!(network.parent.as_deref(), Some("eth0"));

    let listener = NetAttachListener::new(
        network.clone(),
        AttachmentManager::new(engine.clone(), Some(leases.clone())),
        PortRouter::new(engine.clone(), firewall.clone()),
        engine.clone(),
    );
    let reconciler = Reconciler::new(engine.clone(), EventFilter::default(), ReconcilerConfig::default())
        .with_listener(Arc::new(listener));

    assert_eq!(
        reconciler.dispatch(&event("create")).await,
        Dispatch::Delivered { failures: 0 }
    );

    let connection = engine.connections().pop().unwrap();
    assert_eq!(connection.endpoint.ipv4, Some(Ipv4Addr::new(192, 168, 7, 50)));
    assert!(network.v6_prefix.contains(connection.endpoint.ipv6.unwrap()));

    let client_id = make_client_id(CONTAINER_ID);
    assert_eq!(client_id, vec![0xc0, 0xff, 0xee, 0x01]);
    let stored = leases.store().load(&client_id).unwrap().unwrap();
    assert_eq!(stored.hostname, "db");
    assert_eq!(stored.interface, "eth0");

    // no forwarding chain on ipvlan
    reconciler.dispatch(&event("start")).await;
    assert!(firewall.rules().is_empty());

    reconciler.dispatch(&event("destroy")).await;
    assert!(leases.store().load(&client_id).unwrap().is_none());
    assert_eq!(
        dhcp.calls(),
        vec!["request eth0 c0ffee01 db", "release c0ffee01"]
    );
    assert_eq!(engine.disconnections().len(), 1);
}

#[tokio::test]
async fn test_failed_connect_releases_lease() {
    let dir = TempDir::new().unwrap();
    let dhcp = Arc::new(FakeDhcp::default());
    let leases = LeaseClient::new(dhcp.clone(), LeaseStore::new(dir.path()));

    let engine = Arc::new(MockEngine::failing_connect());
    engine.add_container(CONTAINER_ID, "db", "postgres:16", &[]);
    let network = Arc::new(
        NetworkSelector::new(engine.clone())
            .select_or_create(&ipvlan_conf())
            .await
            .unwrap(),
    );

    let manager = AttachmentManager::new(engine.clone(), Some(leases.clone()));
    let container = ctnet_events::ContainerRef::new(CONTAINER_ID, "db", "postgres:16");
    assert!(manager.attach(&container, &network).await.is_err());

    assert!(leases
        .store()
        .load(&make_client_id(CONTAINER_ID))
        .unwrap()
        .is_none());
    assert_eq!(
        dhcp.calls(),
        vec!["request eth0 c0ffee01 db", "release c0ffee01"]
    );
}
