//! Integration tests for attachment and port routing driven by events.
//!
//! The engine and firewall are the in-memory implementations; events are
//! dispatched straight into the reconciler.

use std::net::Ipv6Addr;
use std::sync::Arc;

use ctnet_events::{EngineEvent, EventFilter, EventKind};
use ctnet_net_agent::attach::AttachmentManager;
use ctnet_net_agent::engine::{ContainerEngine, EndpointRequest, MockEngine};
use ctnet_net_agent::firewall::{FirewallRule, MemoryFirewall};
use ctnet_net_agent::listener::NetAttachListener;
use ctnet_net_agent::network::{ManagedNetwork, NetworkSelector};
use ctnet_net_agent::ports::PortRouter;
use ctnet_net_agent::reconciler::{Dispatch, Reconciler, ReconcilerConfig};
use ctnet_networking::{DnsConfig, Ipv6Block, NetConf, NetMode, PortRange};

const PREFIX: &str = "2001:db8:0:42::/64";

struct Harness {
    engine: Arc<MockEngine>,
    firewall: Arc<MemoryFirewall>,
    network: Arc<ManagedNetwork>,
    reconciler: Reconciler,
}

fn bridge_conf() -> NetConf {
    let block = Ipv6Block::with_first_host_gateway(PREFIX.parse().unwrap()).unwrap();
    NetConf::bridge("eth0", block, DnsConfig::default()).unwrap()
}

async fn harness_with(firewall: MemoryFirewall) -> Harness {
    let engine = Arc::new(MockEngine::new());
    let firewall = Arc::new(firewall);
    let network = Arc::new(
        NetworkSelector::new(engine.clone())
            .select_or_create(&bridge_conf())
            .await
            .unwrap(),
    );

    let listener = NetAttachListener::new(
        network.clone(),
        AttachmentManager::new(engine.clone(), None),
        PortRouter::new(engine.clone(), firewall.clone()),
        engine.clone(),
    );
    let reconciler = Reconciler::new(
        engine.clone(),
        EventFilter::new(vec!["C.".to_string()], vec!["promtail".to_string()]),
        ReconcilerConfig::default(),
    )
    .with_listener(Arc::new(listener));

    Harness {
        engine,
        firewall,
        network,
        reconciler,
    }
}

async fn harness() -> Harness {
    harness_with(MemoryFirewall::new()).await
}

fn event(action: &str, id: &str, name: &str) -> EngineEvent {
    EngineEvent::new(EventKind::Container, action, id)
        .with_attribute("name", name)
        .with_attribute("image", "jupyter/base-notebook:latest")
}

fn assigned_address(h: &Harness, id: &str) -> Ipv6Addr {
    h.engine
        .connections()
        .iter()
        .find(|c| c.container_id == id)
        .and_then(|c| c.endpoint.ipv6)
        .unwrap()
}

#[tokio::test]
async fn test_jupyter_gets_address_and_implicit_port() {
    let h = harness().await;
    h.engine.add_container("c1", "w1/jupyter", "jupyter/base-notebook", &[]);

    let created = h.reconciler.dispatch(&event("create", "c1", "w1/jupyter")).await;
    assert_eq!(created, Dispatch::Delivered { failures: 0 });

    let address = assigned_address(&h, "c1");
    assert!(h.network.v6_prefix.contains(address));

    h.reconciler.dispatch(&event("start", "c1", "w1/jupyter")).await;
    assert_eq!(
        h.firewall.rules(),
        vec![FirewallRule::new(address, PortRange::tcp(8080))]
    );
}

#[tokio::test]
async fn test_explicit_8080_not_duplicated() {
    let h = harness().await;
    h.engine
        .add_container("c1", "w1/jupyter", "jupyter/base-notebook", &["8080/tcp"]);

    h.reconciler.dispatch(&event("create", "c1", "w1/jupyter")).await;
    h.reconciler.dispatch(&event("start", "c1", "w1/jupyter")).await;

    let rules = h.firewall.rules();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].range, PortRange::tcp(8080));
}

#[tokio::test]
async fn test_ssh_suffix_merges_with_explicit_22() {
    let h = harness().await;
    h.engine
        .add_container("c2", "box/ssh", "ubuntu", &["22/tcp", "80/tcp"]);

    h.reconciler.dispatch(&event("create", "c2", "box/ssh")).await;
    h.reconciler.dispatch(&event("start", "c2", "box/ssh")).await;

    let mut ports: Vec<u16> = h.firewall.rules().iter().map(|r| r.range.start).collect();
    ports.sort();
    assert_eq!(ports, vec![22, 80]);
}

#[tokio::test]
async fn test_route_twice_then_unroute() {
    let h = harness().await;
    h.engine.add_container("c3", "app", "nginx", &["443/tcp"]);

    h.reconciler.dispatch(&event("create", "c3", "app")).await;
    h.reconciler.dispatch(&event("start", "c3", "app")).await;
    h.reconciler.dispatch(&event("start", "c3", "app")).await;
    assert_eq!(h.firewall.rules().len(), 1);

    h.reconciler.dispatch(&event("die", "c3", "app")).await;
    assert!(h.firewall.rules().is_empty());

    let again = h.reconciler.dispatch(&event("die", "c3", "app")).await;
    assert_eq!(again, Dispatch::Delivered { failures: 0 });
}

#[tokio::test]
async fn test_unroute_never_routed() {
    let h = harness().await;
    h.engine.add_container("c4", "app", "nginx", &["443/tcp"]);

    // attached but never started
    h.reconciler.dispatch(&event("create", "c4", "app")).await;
    let stopped = h.reconciler.dispatch(&event("die", "c4", "app")).await;
    assert_eq!(stopped, Dispatch::Delivered { failures: 0 });

    // never attached at all
    h.engine.add_container("c5", "other", "nginx", &["443/tcp"]);
    let stopped = h.reconciler.dispatch(&event("die", "c5", "other")).await;
    assert_eq!(stopped, Dispatch::Delivered { failures: 0 });
    assert!(h.firewall.rules().is_empty());
}

#[tokio::test]
async fn test_failing_rule_does_not_block_others() {
    let h = harness_with(MemoryFirewall::failing_on(22)).await;
    h.engine
        .add_container("c6", "box/ssh", "ubuntu", &["80/tcp", "443/tcp"]);

    h.reconciler.dispatch(&event("create", "c6", "box/ssh")).await;
    let started = h.reconciler.dispatch(&event("start", "c6", "box/ssh")).await;
    assert_eq!(started, Dispatch::Delivered { failures: 0 });

    let mut ports: Vec<u16> = h.firewall.rules().iter().map(|r| r.range.start).collect();
    ports.sort();
    assert_eq!(ports, vec![80, 443]);
}

#[tokio::test]
async fn test_destroy_detaches() {
    let h = harness().await;
    h.engine.add_container("c7", "app", "nginx", &[]);

    h.reconciler.dispatch(&event("create", "c7", "app")).await;
    h.reconciler.dispatch(&event("destroy", "c7", "app")).await;

    assert_eq!(
        h.engine.disconnections(),
        vec![(h.network.id.clone(), "c7".to_string())]
    );
    let details = h.engine.inspect_container("c7").await.unwrap();
    assert!(details.endpoint(&h.network.id).is_none());
}

#[tokio::test]
async fn test_excluded_containers_untouched() {
    let h = harness().await;
    h.engine.add_container("c8", "C.build", "nginx", &[]);
    h.engine.add_container("c9", "promtail", "grafana/promtail", &[]);

    h.reconciler.dispatch(&event("create", "c8", "C.build")).await;
    h.reconciler.dispatch(&event("create", "c9", "promtail")).await;
    assert!(h.engine.connections().is_empty());
}

#[tokio::test]
async fn test_discovery_attaches_and_routes_existing() {
    let h = harness().await;
    h.engine.add_container("a1", "w1/jupyter", "jupyter/base", &[]);
    h.engine.set_running("a1", true);
    h.engine.add_container("a2", "stopped", "nginx", &["80/tcp"]);
    h.engine.add_container("a3", "attached", "nginx", &[]);
    h.engine
        .connect(
            &h.network.id,
            "a3",
            &EndpointRequest {
                ipv4: None,
                ipv6: Some("2001:db8:0:42::33".parse().unwrap()),
            },
        )
        .await
        .unwrap();
    h.engine.add_container("a4", "C.hidden", "nginx", &[]);

    let eligible = h.reconciler.discover().await.unwrap();
    assert_eq!(eligible, 3);

    let connected: Vec<String> = h
        .engine
        .connections()
        .into_iter()
        .map(|c| c.container_id)
        .collect();
    assert_eq!(connected, vec!["a3", "a1", "a2"]);

    let rules = h.firewall.rules();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].destination, assigned_address(&h, "a1"));
    assert_eq!(rules[0].range, PortRange::tcp(8080));
}

#[tokio::test]
async fn test_network_reused_across_restarts() {
    let h = harness().await;

    // a restarted agent builds a fresh selector against the same engine
    let again = NetworkSelector::new(h.engine.clone())
        .select_or_create(&bridge_conf())
        .await
        .unwrap();
    assert_eq!(again.id, h.network.id);
    assert_eq!(again.mode, NetMode::Bridge);
    assert_eq!(h.engine.networks_created(), 1);
}
