//! In-memory container engine for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use ctnet_events::EngineEvent;
use tokio::sync::mpsc;

use super::{
    ContainerDetails, ContainerEngine, ContainerSummary, EndpointInfo, EndpointRequest,
    EngineError, EventSubscription, NetworkInfo, NetworkSpec,
};

/// A recorded `connect` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub network_id: String,
    pub container_id: String,
    pub endpoint: EndpointRequest,
}

#[derive(Default)]
struct State {
    containers: HashMap<String, ContainerDetails>,
    networks: Vec<NetworkInfo>,
    connections: Vec<Connection>,
    disconnections: Vec<(String, String)>,
    subscribers: Vec<mpsc::Sender<Result<EngineEvent, EngineError>>>,
    fail_connect: bool,
}

/// Mock engine that keeps containers and networks in memory.
#[derive(Default)]
pub struct MockEngine {
    state: Mutex<State>,
    networks_created: AtomicU64,
    subscriptions: AtomicU64,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock whose `connect` always fails.
    pub fn failing_connect() -> Self {
        let engine = Self::default();
        engine.lock().fail_connect = true;
        engine
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_container(&self, id: &str, name: &str, image: &str, exposed_ports: &[&str]) {
        self.lock().containers.insert(
            id.to_string(),
            ContainerDetails {
                id: id.to_string(),
                name: name.to_string(),
                image: image.to_string(),
                running: false,
                exposed_ports: exposed_ports.iter().map(|p| p.to_string()).collect(),
                endpoints: Vec::new(),
            },
        );
    }

    pub fn set_running(&self, id: &str, running: bool) {
        if let Some(container) = self.lock().containers.get_mut(id) {
            container.running = running;
        }
    }

    pub fn add_network(&self, network: NetworkInfo) {
        self.lock().networks.push(network);
    }

    pub fn networks(&self) -> Vec<NetworkInfo> {
        self.lock().networks.clone()
    }

    pub fn networks_created(&self) -> u64 {
        self.networks_created.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.lock().connections.clone()
    }

    pub fn disconnections(&self) -> Vec<(String, String)> {
        self.lock().disconnections.clone()
    }

    pub fn subscribe_count(&self) -> u64 {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Deliver an event to every live subscription.
    pub async fn emit(&self, event: EngineEvent) {
        let subscribers = self.lock().subscribers.clone();
        for tx in subscribers {
            let _ = tx.send(Ok(event.clone())).await;
        }
    }

    /// Fail every live subscription and forget it.
    pub async fn fail_stream(&self) {
        let subscribers = std::mem::take(&mut self.lock().subscribers);
        for tx in subscribers {
            let _ = tx
                .send(Err(EngineError::Api {
                    status: 500,
                    message: "stream reset".to_string(),
                }))
                .await;
        }
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, EngineError> {
        let mut containers: Vec<ContainerSummary> = self
            .lock()
            .containers
            .values()
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                image: c.image.clone(),
                running: c.running,
            })
            .collect();
        containers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(containers)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, EngineError> {
        self.lock()
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {}", id)))
    }

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>, EngineError> {
        Ok(self.networks())
    }

    async fn network_exists(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.lock().networks.iter().any(|n| n.name == name))
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, EngineError> {
        let mut state = self.lock();
        if state.networks.iter().any(|n| n.name == spec.name) {
            return Err(EngineError::Api {
                status: 409,
                message: format!("network with name {} already exists", spec.name),
            });
        }
        let n = self.networks_created.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("net-{}", n);
        state.networks.push(NetworkInfo {
            id: id.clone(),
            name: spec.name.clone(),
            driver: spec.driver.clone(),
            attachable: true,
            enable_ipv6: true,
            subnets: spec.subnets.clone(),
            options: spec.options.clone(),
        });
        Ok(id)
    }

    async fn connect(
        &self,
        network_id: &str,
        container_id: &str,
        endpoint: &EndpointRequest,
    ) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.fail_connect {
            return Err(EngineError::Api {
                status: 500,
                message: "connect failed".to_string(),
            });
        }
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {}", container_id)))?;
        container.endpoints.retain(|e| e.network_id != network_id);
        container.endpoints.push(EndpointInfo {
            network_id: network_id.to_string(),
            ipv4: endpoint.ipv4,
            ipv6: endpoint.ipv6,
        });
        state.connections.push(Connection {
            network_id: network_id.to_string(),
            container_id: container_id.to_string(),
            endpoint: endpoint.clone(),
        });
        Ok(())
    }

    async fn disconnect(&self, network_id: &str, container_id: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        if let Some(container) = state.containers.get_mut(container_id) {
            container.endpoints.retain(|e| e.network_id != network_id);
        }
        state
            .disconnections
            .push((network_id.to_string(), container_id.to_string()));
        Ok(())
    }

    async fn subscribe(&self) -> Result<EventSubscription, EngineError> {
        let id = self.subscriptions.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(64);
        self.lock().subscribers.push(tx);
        Ok(EventSubscription::new(id, rx, None))
    }
}
