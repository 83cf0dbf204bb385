//! Container engine interface.
//!
//! The agent only needs a narrow slice of the engine API: container
//! listing and inspection, network listing/creation/connection, and the
//! lifecycle event stream. `DockerClient` speaks the Docker Engine REST API
//! over its Unix socket; `MockEngine` keeps everything in memory for tests.

mod docker;
mod mock;

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use ctnet_events::{EngineEvent, EventError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub use docker::DockerClient;
pub use mock::{Connection, MockEngine};

/// Errors from the container engine API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine socket: {0}")]
    Http(#[from] hyper::Error),

    #[error("request error: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("engine response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("event error: {0}")]
    Event(#[from] EventError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("engine returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("event stream closed")]
    StreamClosed,
}

// =============================================================================
// Engine objects
// =============================================================================

/// One entry of the container listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
}

/// A container's endpoint on one network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub network_id: String,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

/// The parts of a container inspection the agent uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    /// Exposed port specs as the engine reports them (`"8080/tcp"`).
    pub exposed_ports: Vec<String>,
    pub endpoints: Vec<EndpointInfo>,
}

impl ContainerDetails {
    pub fn endpoint(&self, network_id: &str) -> Option<&EndpointInfo> {
        self.endpoints.iter().find(|e| e.network_id == network_id)
    }
}

/// Subnet/gateway pair of a network's IPAM configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpamSubnet {
    pub subnet: String,
    pub gateway: String,
}

/// An engine network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub attachable: bool,
    pub enable_ipv6: bool,
    pub subnets: Vec<IpamSubnet>,
    pub options: HashMap<String, String>,
}

/// Parameters for creating an attachable, IPv6-enabled network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    pub driver: String,
    pub subnets: Vec<IpamSubnet>,
    pub options: HashMap<String, String>,
}

/// Static addresses requested for a new endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointRequest {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

// =============================================================================
// Event subscription
// =============================================================================

/// A live event stream.
///
/// Dropping the subscription stops the task feeding it, so each reconnect
/// attempt releases the previous stream whether it ended cleanly or not.
pub struct EventSubscription {
    id: u64,
    events: mpsc::Receiver<Result<EngineEvent, EngineError>>,
    feeder: Option<JoinHandle<()>>,
}

impl EventSubscription {
    pub fn new(
        id: u64,
        events: mpsc::Receiver<Result<EngineEvent, EngineError>>,
        feeder: Option<JoinHandle<()>>,
    ) -> Self {
        Self { id, events, feeder }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event; `Err(StreamClosed)` once the stream has ended.
    pub async fn next(&mut self) -> Result<EngineEvent, EngineError> {
        match self.events.recv().await {
            Some(result) => result,
            None => Err(EngineError::StreamClosed),
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        debug!(subscription = self.id, "Event subscription released");
    }
}

// =============================================================================
// Engine interface
// =============================================================================

/// Container engine operations used by the agent.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// All containers, running or not.
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, EngineError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, EngineError>;

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>, EngineError>;

    async fn network_exists(&self, name: &str) -> Result<bool, EngineError>;

    /// Create a network and return its id.
    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, EngineError>;

    async fn connect(
        &self,
        network_id: &str,
        container_id: &str,
        endpoint: &EndpointRequest,
    ) -> Result<(), EngineError>;

    /// Disconnect a container. Succeeds if it is already disconnected or
    /// gone.
    async fn disconnect(&self, network_id: &str, container_id: &str) -> Result<(), EngineError>;

    /// Subscribe to container and image events.
    async fn subscribe(&self) -> Result<EventSubscription, EngineError>;
}
