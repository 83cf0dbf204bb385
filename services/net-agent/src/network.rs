//! Managed network selection.
//!
//! The agent keeps containers on one engine network per host
//! configuration. On startup an existing network with the same addressing
//! is reused; otherwise a new one is created under the first free name.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use ctnet_networking::{Ipv4Prefix, Ipv6Prefix, NetConf, NetMode};
use thiserror::Error;
use tracing::{debug, info};

use crate::engine::{ContainerEngine, EngineError, IpamSubnet, NetworkInfo, NetworkSpec};

/// Base name of the bridge network.
pub const BRIDGE_NETWORK_NAME: &str = "ctnet-ipv6";

/// Base name of the ipvlan network.
pub const IPVLAN_NETWORK_NAME: &str = "ctnet-ipvlan";

/// Upper bound on `-N` suffixes tried when picking a network name.
const MAX_NAME_PROBES: u32 = 100;

/// Errors from network selection.
#[derive(Debug, Error)]
pub enum NetworkSelectError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("networking is disabled")]
    ModeNone,

    #[error("no free network name for {base} after {probes} attempts")]
    NamesExhausted { base: String, probes: u32 },
}

/// The engine network containers are attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedNetwork {
    pub id: String,
    pub name: String,
    pub mode: NetMode,
    pub v6_prefix: Ipv6Prefix,
    pub v6_gateway: Ipv6Addr,
    pub v4_prefix: Option<Ipv4Prefix>,
    pub v4_gateway: Option<Ipv4Addr>,
    /// Parent interface (ipvlan only).
    pub parent: Option<String>,
}

impl ManagedNetwork {
    pub fn is_bridge(&self) -> bool {
        self.mode == NetMode::Bridge
    }

    pub fn driver(&self) -> &'static str {
        self.mode.driver().unwrap_or_default()
    }
}

/// Finds or creates the managed network for a host configuration.
pub struct NetworkSelector {
    engine: Arc<dyn ContainerEngine>,
}

impl NetworkSelector {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Reuse a network with identical addressing, or create one.
    pub async fn select_or_create(
        &self,
        conf: &NetConf,
    ) -> Result<ManagedNetwork, NetworkSelectError> {
        let (Some(driver), Some(v6)) = (conf.mode().driver(), conf.v6()) else {
            return Err(NetworkSelectError::ModeNone);
        };

        let networks = self.engine.list_networks().await?;
        let candidates = networks
            .iter()
            .filter(|n| n.attachable && n.enable_ipv6 && n.driver == driver);

        for network in candidates {
            if let Some(managed) = matches(network, conf) {
                info!(
                    network = %managed.name,
                    network_id = %managed.id,
                    prefix = %managed.v6_prefix,
                    "Reusing managed network"
                );
                return Ok(managed);
            }
        }

        let base = match conf.mode() {
            NetMode::Ipvlan => IPVLAN_NETWORK_NAME,
            _ => BRIDGE_NETWORK_NAME,
        };
        let name = self.free_name(base).await?;

        let mut subnets = vec![IpamSubnet {
            subnet: v6.prefix.to_string(),
            gateway: v6.gateway.to_string(),
        }];
        let mut options = HashMap::new();
        if let NetConf::Ipvlan(_) = conf {
            if let Some(v4) = conf.v4() {
                subnets.push(IpamSubnet {
                    subnet: v4.prefix.to_string(),
                    gateway: v4.gateway.to_string(),
                });
            }
            if let Some(parent) = conf.interface() {
                options.insert("parent".to_string(), parent.to_string());
            }
            options.insert("ipvlan_mode".to_string(), "l2".to_string());
        }

        let spec = NetworkSpec {
            name: name.clone(),
            driver: driver.to_string(),
            subnets,
            options,
        };
        let id = self.engine.create_network(&spec).await?;

        info!(
            network = %name,
            network_id = %id,
            driver,
            prefix = %v6.prefix,
            gateway = %v6.gateway,
            "Created managed network"
        );

        Ok(ManagedNetwork {
            id,
            name,
            mode: conf.mode(),
            v6_prefix: v6.prefix,
            v6_gateway: v6.gateway,
            v4_prefix: conf.v4().map(|b| b.prefix),
            v4_gateway: conf.v4().map(|b| b.gateway),
            parent: match conf {
                NetConf::Ipvlan(_) => conf.interface().map(str::to_string),
                _ => None,
            },
        })
    }

    /// `base`, then `base-1`, `base-2`, ... until the engine has no such network.
    async fn free_name(&self, base: &str) -> Result<String, NetworkSelectError> {
        for n in 0..MAX_NAME_PROBES {
            let name = if n == 0 {
                base.to_string()
            } else {
                format!("{}-{}", base, n)
            };
            if !self.engine.network_exists(&name).await? {
                return Ok(name);
            }
            debug!(network = %name, "Network name taken");
        }
        Err(NetworkSelectError::NamesExhausted {
            base: base.to_string(),
            probes: MAX_NAME_PROBES,
        })
    }
}

/// Engine subnets split by address family. Unparseable entries are ignored.
struct Subnets {
    v6: Vec<(Ipv6Prefix, Option<Ipv6Addr>)>,
    v4: Vec<(Ipv4Prefix, Option<Ipv4Addr>)>,
}

fn subnets(network: &NetworkInfo) -> Subnets {
    let mut out = Subnets {
        v6: Vec::new(),
        v4: Vec::new(),
    };
    for s in &network.subnets {
        if let Ok(prefix) = s.subnet.parse::<Ipv6Prefix>() {
            out.v6.push((prefix, s.gateway.parse().ok()));
        } else if let Ok(prefix) = s.subnet.parse::<Ipv4Prefix>() {
            out.v4.push((prefix, s.gateway.parse().ok()));
        }
    }
    out
}

fn matches(network: &NetworkInfo, conf: &NetConf) -> Option<ManagedNetwork> {
    let v6 = conf.v6()?;
    let found = subnets(network);

    match conf {
        NetConf::None => None,
        NetConf::Bridge(_) => {
            let gateway = found.v6.iter().find_map(|(prefix, gateway)| {
                gateway.filter(|g| *prefix == v6.prefix && v6.prefix.contains(*g))
            })?;
            Some(ManagedNetwork {
                id: network.id.clone(),
                name: network.name.clone(),
                mode: NetMode::Bridge,
                v6_prefix: v6.prefix,
                v6_gateway: gateway,
                v4_prefix: None,
                v4_gateway: None,
                parent: None,
            })
        }
        NetConf::Ipvlan(_) => {
            let v4 = conf.v4()?;
            let parent = conf.interface()?;
            let v6_match = found
                .v6
                .iter()
                .any(|(p, g)| *p == v6.prefix && *g == Some(v6.gateway));
            let v4_match = found
                .v4
                .iter()
                .any(|(p, g)| *p == v4.prefix && *g == Some(v4.gateway));
            let parent_match = network.options.get("parent").map(String::as_str) == Some(parent);
            if !(v6_match && v4_match && parent_match) {
                return None;
            }
            Some(ManagedNetwork {
                id: network.id.clone(),
                name: network.name.clone(),
                mode: NetMode::Ipvlan,
                v6_prefix: v6.prefix,
                v6_gateway: v6.gateway,
                v4_prefix: Some(v4.prefix),
                v4_gateway: Some(v4.gateway),
                parent: Some(parent.to_string()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;
    use ctnet_networking::{DnsConfig, Ipv4Block, Ipv6Block};

    fn bridge_conf(prefix: &str) -> NetConf {
        let block = Ipv6Block::with_first_host_gateway(prefix.parse().unwrap()).unwrap();
        NetConf::bridge("eth0", block, DnsConfig::default()).unwrap()
    }

    fn ipvlan_conf(parent: &str) -> NetConf {
        let v6 = Ipv6Block::with_first_host_gateway("2001:db8:7::/64".parse().unwrap()).unwrap();
        let v4 = Ipv4Block::new(
            "192.168.7.0/24".parse().unwrap(),
            Ipv4Addr::new(192, 168, 7, 1),
        )
        .unwrap();
        NetConf::ipvlan(parent, Some(v4), Some(v6), DnsConfig::default()).unwrap()
    }

    fn network(id: &str, name: &str, driver: &str, subnets: &[(&str, &str)]) -> NetworkInfo {
        NetworkInfo {
            id: id.to_string(),
            name: name.to_string(),
            driver: driver.to_string(),
            attachable: true,
            enable_ipv6: true,
            subnets: subnets
                .iter()
                .map(|(s, g)| IpamSubnet {
                    subnet: s.to_string(),
                    gateway: g.to_string(),
                })
                .collect(),
            options: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_creates_then_reuses() {
        let engine = Arc::new(MockEngine::new());
        let selector = NetworkSelector::new(engine.clone());
        let conf = bridge_conf("2001:db8:1::/64");

        let first = selector.select_or_create(&conf).await.unwrap();
        let second = selector.select_or_create(&conf).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.name, BRIDGE_NETWORK_NAME);
        assert_eq!(engine.networks_created(), 1);
    }

    #[tokio::test]
    async fn test_bridge_match_accepts_any_gateway_inside_prefix() {
        let engine = Arc::new(MockEngine::new());
        engine.add_network(network(
            "existing",
            "ctnet-ipv6",
            "bridge",
            &[("2001:db8:1::/64", "2001:db8:1::fe")],
        ));
        let selector = NetworkSelector::new(engine.clone());

        let managed = selector
            .select_or_create(&bridge_conf("2001:db8:1::/64"))
            .await
            .unwrap();
        assert_eq!(managed.id, "existing");
        assert_eq!(managed.v6_gateway, "2001:db8:1::fe".parse::<Ipv6Addr>().unwrap());
        assert_eq!(engine.networks_created(), 0);
    }

    #[tokio::test]
    async fn test_name_collision_gets_suffix() {
        let engine = Arc::new(MockEngine::new());
        engine.add_network(network(
            "other",
            "ctnet-ipv6",
            "bridge",
            &[("2001:db8:9::/64", "2001:db8:9::1")],
        ));
        engine.add_network(network("plain", "ctnet-ipv6-1", "bridge", &[]));
        let selector = NetworkSelector::new(engine.clone());

        let managed = selector
            .select_or_create(&bridge_conf("2001:db8:1::/64"))
            .await
            .unwrap();
        assert_eq!(managed.name, "ctnet-ipv6-2");
        assert_eq!(managed.v6_gateway, "2001:db8:1::1".parse::<Ipv6Addr>().unwrap());
    }

    #[tokio::test]
    async fn test_ignores_non_attachable_and_other_drivers() {
        let engine = Arc::new(MockEngine::new());
        let mut hidden = network(
            "hidden",
            "a",
            "bridge",
            &[("2001:db8:1::/64", "2001:db8:1::1")],
        );
        hidden.attachable = false;
        engine.add_network(hidden);
        engine.add_network(network(
            "overlay",
            "b",
            "overlay",
            &[("2001:db8:1::/64", "2001:db8:1::1")],
        ));
        let selector = NetworkSelector::new(engine.clone());

        let managed = selector
            .select_or_create(&bridge_conf("2001:db8:1::/64"))
            .await
            .unwrap();
        assert_eq!(managed.id, "net-1");
    }

    #[tokio::test]
    async fn test_ipvlan_creation_and_parent_match() {
        let engine = Arc::new(MockEngine::new());
        let selector = NetworkSelector::new(engine.clone());

        let managed = selector.select_or_create(&ipvlan_conf("eth0")).await.unwrap();
        assert_eq!(managed.name, IPVLAN_NETWORK_NAME);
        assert_eq!(managed.parent.as_deref(), Some("eth0"));

        let created = &engine.networks()[0];
        assert_eq!(created.driver, "ipvlan");
        assert_eq!(created.subnets.len(), 2);
        assert_eq!(created.options.get("ipvlan_mode").map(String::as_str), Some("l2"));

        let again = selector.select_or_create(&ipvlan_conf("eth0")).await.unwrap();
        assert_eq!(again.id, managed.id);

        let other = selector.select_or_create(&ipvlan_conf("eth1")).await.unwrap();
        assert_ne!(other.id, managed.id);
        assert_eq!(other.name, "ctnet-ipvlan-1");
    }

    #[tokio::test]
    async fn test_mode_none_rejected() {
        let selector = NetworkSelector::new(Arc::new(MockEngine::new()));
        let err = selector.select_or_create(&NetConf::None).await.unwrap_err();
        assert!(matches!(err, NetworkSelectError::ModeNone));
    }
}
