//! Docker Engine API client over the daemon's Unix socket.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use ctnet_events::EngineEvent;
use hyper::body::{Bytes, HttpBody};
use hyper::{Body, Client, Method, Request, Response, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::{
    ContainerDetails, ContainerEngine, ContainerSummary, EndpointInfo, EndpointRequest,
    EngineError, EventSubscription, IpamSubnet, NetworkInfo, NetworkSpec,
};

/// `{"type":["container","image"]}`, URL-encoded.
const EVENT_FILTERS: &str = "%7B%22type%22%3A%5B%22container%22%2C%22image%22%5D%7D";

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Docker Engine API client.
pub struct DockerClient {
    socket_path: String,
    client: Client<UnixConnector>,
    subscriptions: AtomicU64,
}

impl DockerClient {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_string_lossy().to_string(),
            client: Client::unix(),
            subscriptions: AtomicU64::new(0),
        }
    }

    pub fn socket_exists(&self) -> bool {
        Path::new(&self.socket_path).exists()
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<hyper::Response<Body>, EngineError> {
        let uri = Uri::new(&self.socket_path, path);
        debug!(method = %method, path, "Engine API request");

        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");
        let request = match body {
            Some(bytes) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(bytes))?,
            None => builder.body(Body::empty())?,
        };

        Ok(self.client.request(request).await?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, EngineError> {
        let response = self.request(Method::GET, path, None).await?;
        let body = read_body(response).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn post<B: Serialize>(&self, path: &str, payload: &B) -> Result<Vec<u8>, EngineError> {
        let bytes = serde_json::to_vec(payload)?;
        let response = self.request(Method::POST, path, Some(bytes)).await?;
        Ok(read_body(response).await?.to_vec())
    }
}

/// Collect the whole body; a non-2xx status becomes an engine error built
/// from it.
async fn read_body(response: Response<Body>) -> Result<Bytes, EngineError> {
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body()).await?;
    if status.is_success() {
        Ok(body)
    } else {
        Err(api_error(status, &body))
    }
}

fn api_error(status: StatusCode, body: &[u8]) -> EngineError {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: String,
    }

    let message = serde_json::from_slice::<ErrorBody>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string());

    if status == StatusCode::NOT_FOUND {
        EngineError::NotFound(message)
    } else {
        EngineError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerClient {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, EngineError> {
        let entries: Vec<ContainerListEntry> = self.get("/containers/json?all=1").await?;
        Ok(entries.into_iter().map(ContainerSummary::from).collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, EngineError> {
        let inspect: ContainerInspect = self.get(&format!("/containers/{}/json", id)).await?;
        Ok(inspect.into())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>, EngineError> {
        let networks: Vec<NetworkResource> = self.get("/networks").await?;
        Ok(networks.into_iter().map(NetworkInfo::from).collect())
    }

    async fn network_exists(&self, name: &str) -> Result<bool, EngineError> {
        match self
            .get::<serde_json::Value>(&format!("/networks/{}", name))
            .await
        {
            Ok(_) => Ok(true),
            Err(EngineError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, EngineError> {
        let request = NetworkCreateRequest {
            name: &spec.name,
            driver: &spec.driver,
            check_duplicate: true,
            attachable: true,
            enable_ipv6: true,
            ipam: IpamRequest {
                driver: "default",
                config: spec
                    .subnets
                    .iter()
                    .map(|s| IpamConfig {
                        subnet: s.subnet.clone(),
                        gateway: s.gateway.clone(),
                    })
                    .collect(),
            },
            options: &spec.options,
        };

        let body = self.post("/networks/create", &request).await?;
        let created: NetworkCreateResponse = serde_json::from_slice(&body)?;
        if !created.warning.is_empty() {
            warn!(network = %spec.name, warning = %created.warning, "Engine warning on network create");
        }
        Ok(created.id)
    }

    async fn connect(
        &self,
        network_id: &str,
        container_id: &str,
        endpoint: &EndpointRequest,
    ) -> Result<(), EngineError> {
        let request = ConnectRequest {
            container: container_id,
            endpoint_config: EndpointConfigRequest {
                ipam_config: EndpointIpamRequest {
                    ipv4_address: endpoint.ipv4.map(|a| a.to_string()),
                    ipv6_address: endpoint.ipv6.map(|a| a.to_string()),
                },
            },
        };
        self.post(&format!("/networks/{}/connect", network_id), &request)
            .await?;
        Ok(())
    }

    async fn disconnect(&self, network_id: &str, container_id: &str) -> Result<(), EngineError> {
        let request = DisconnectRequest {
            container: container_id,
            force: false,
        };
        match self
            .post(&format!("/networks/{}/disconnect", network_id), &request)
            .await
        {
            Ok(_) => Ok(()),
            Err(EngineError::NotFound(message)) => {
                debug!(network_id, container_id, %message, "Nothing to disconnect");
                Ok(())
            }
            Err(EngineError::Api { message, .. }) if message.contains("is not connected") => {
                debug!(network_id, container_id, %message, "Container already disconnected");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn subscribe(&self) -> Result<EventSubscription, EngineError> {
        let path = format!("/events?filters={}", EVENT_FILTERS);
        let response = self.request(Method::GET, &path, None).await?;
        let status = response.status();
        if !status.is_success() {
            let body = hyper::body::to_bytes(response.into_body()).await?;
            return Err(api_error(status, &body));
        }

        let id = self.subscriptions.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let feeder = tokio::spawn(feed_events(response.into_body(), tx));
        debug!(subscription = id, "Subscribed to engine events");
        Ok(EventSubscription::new(id, rx, Some(feeder)))
    }
}

/// Split the chunked response body into newline-delimited events.
async fn feed_events(mut body: Body, tx: mpsc::Sender<Result<EngineEvent, EngineError>>) {
    let mut pending: Vec<u8> = Vec::new();

    while let Some(chunk) = body.data().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        };
        pending.extend_from_slice(&chunk);

        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            match EngineEvent::from_json(line) {
                Ok(event) => {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    error!(error = %e, line = %String::from_utf8_lossy(line), "Undecodable engine event");
                }
            }
        }
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerListEntry {
    id: String,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    image: String,
    #[serde(default)]
    state: String,
}

impl From<ContainerListEntry> for ContainerSummary {
    fn from(entry: ContainerListEntry) -> Self {
        let name = entry
            .names
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();
        Self {
            id: entry.id,
            name,
            image: entry.image,
            running: entry.state == "running",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    config: Option<InspectConfig>,
    #[serde(default)]
    state: Option<InspectState>,
    #[serde(default)]
    network_settings: Option<NetworkSettings>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: String,
    #[serde(default)]
    exposed_ports: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    running: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkSettings {
    #[serde(default)]
    networks: Option<HashMap<String, EndpointSettings>>,
}

#[derive(Debug, Deserialize)]
struct EndpointSettings {
    #[serde(rename = "NetworkID", default)]
    network_id: String,
    #[serde(rename = "IPAMConfig", default)]
    ipam_config: Option<EndpointIpamConfig>,
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
    #[serde(rename = "GlobalIPv6Address", default)]
    global_ipv6_address: String,
}

#[derive(Debug, Default, Deserialize)]
struct EndpointIpamConfig {
    #[serde(rename = "IPv4Address", default)]
    ipv4_address: String,
    #[serde(rename = "IPv6Address", default)]
    ipv6_address: String,
}

impl From<ContainerInspect> for ContainerDetails {
    fn from(inspect: ContainerInspect) -> Self {
        let config = inspect.config.unwrap_or_default();
        let mut exposed_ports: Vec<String> = config
            .exposed_ports
            .map(|ports| ports.into_keys().collect())
            .unwrap_or_default();
        exposed_ports.sort();

        let endpoints = inspect
            .network_settings
            .and_then(|s| s.networks)
            .unwrap_or_default()
            .into_values()
            .map(|ep| {
                let ipam = ep.ipam_config.unwrap_or_default();
                EndpointInfo {
                    network_id: ep.network_id,
                    ipv4: parse_first::<Ipv4Addr>(&[&ipam.ipv4_address, &ep.ip_address]),
                    ipv6: parse_first::<Ipv6Addr>(&[
                        &ipam.ipv6_address,
                        &ep.global_ipv6_address,
                    ]),
                }
            })
            .collect();

        Self {
            id: inspect.id,
            name: inspect.name.trim_start_matches('/').to_string(),
            image: config.image,
            running: inspect.state.map(|s| s.running).unwrap_or(false),
            exposed_ports,
            endpoints,
        }
    }
}

fn parse_first<T: std::str::FromStr>(candidates: &[&str]) -> Option<T> {
    candidates
        .iter()
        .filter(|s| !s.is_empty())
        .find_map(|s| s.parse().ok())
}

#[derive(Debug, Deserialize)]
struct NetworkResource {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Driver", default)]
    driver: String,
    #[serde(rename = "Attachable", default)]
    attachable: bool,
    #[serde(rename = "EnableIPv6", default)]
    enable_ipv6: bool,
    #[serde(rename = "IPAM", default)]
    ipam: Option<IpamResource>,
    #[serde(rename = "Options", default)]
    options: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
struct IpamResource {
    #[serde(rename = "Config", default)]
    config: Option<Vec<IpamConfig>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IpamConfig {
    #[serde(rename = "Subnet", default)]
    subnet: String,
    #[serde(rename = "Gateway", default)]
    gateway: String,
}

impl From<NetworkResource> for NetworkInfo {
    fn from(net: NetworkResource) -> Self {
        let subnets = net
            .ipam
            .and_then(|ipam| ipam.config)
            .unwrap_or_default()
            .into_iter()
            .map(|c| IpamSubnet {
                subnet: c.subnet,
                gateway: c.gateway,
            })
            .collect();
        Self {
            id: net.id,
            name: net.name,
            driver: net.driver,
            attachable: net.attachable,
            enable_ipv6: net.enable_ipv6,
            subnets,
            options: net.options.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct NetworkCreateRequest<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Driver")]
    driver: &'a str,
    #[serde(rename = "CheckDuplicate")]
    check_duplicate: bool,
    #[serde(rename = "Attachable")]
    attachable: bool,
    #[serde(rename = "EnableIPv6")]
    enable_ipv6: bool,
    #[serde(rename = "IPAM")]
    ipam: IpamRequest,
    #[serde(rename = "Options")]
    options: &'a HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct IpamRequest {
    #[serde(rename = "Driver")]
    driver: &'static str,
    #[serde(rename = "Config")]
    config: Vec<IpamConfig>,
}

#[derive(Debug, Deserialize)]
struct NetworkCreateResponse {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Warning", default)]
    warning: String,
}

#[derive(Debug, Serialize)]
struct ConnectRequest<'a> {
    #[serde(rename = "Container")]
    container: &'a str,
    #[serde(rename = "EndpointConfig")]
    endpoint_config: EndpointConfigRequest,
}

#[derive(Debug, Serialize)]
struct EndpointConfigRequest {
    #[serde(rename = "IPAMConfig")]
    ipam_config: EndpointIpamRequest,
}

#[derive(Debug, Serialize)]
struct EndpointIpamRequest {
    #[serde(rename = "IPv4Address", skip_serializing_if = "Option::is_none")]
    ipv4_address: Option<String>,
    #[serde(rename = "IPv6Address", skip_serializing_if = "Option::is_none")]
    ipv6_address: Option<String>,
}

#[derive(Debug, Serialize)]
struct DisconnectRequest<'a> {
    #[serde(rename = "Container")]
    container: &'a str,
    #[serde(rename = "Force")]
    force: bool,
}
