//! Forwarding rules for container ports.

use std::sync::Arc;

use ctnet_networking::{PortRange, Protocol};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::attach::Attachment;
use crate::engine::{ContainerEngine, EngineError};
use crate::firewall::{Firewall, FirewallRule};

/// Ports opened for containers by naming convention: a name ending in the
/// suffix gets the port even when the image does not expose it.
const IMPLICIT_PORTS: &[(&str, u16)] = &[("/ssh", 22), ("/jupyter", 8080)];

/// Errors from port routing.
#[derive(Debug, Error)]
pub enum PortRouteError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("container {0} has no IPv6 address on the managed network")]
    NoAddress(String),
}

/// Outcome of one route or unroute pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteSummary {
    pub changed: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Add implicit ranges for `name` unless an existing range covers them.
pub fn merge_implicit(name: &str, mut ranges: Vec<PortRange>) -> Vec<PortRange> {
    for (suffix, port) in IMPLICIT_PORTS {
        if name.ends_with(suffix) && !ranges.iter().any(|r| r.covers(Protocol::Tcp, *port)) {
            ranges.push(PortRange::tcp(*port));
        }
    }
    ranges
}

/// Installs and removes forwarding rules for attached containers.
pub struct PortRouter {
    engine: Arc<dyn ContainerEngine>,
    firewall: Arc<dyn Firewall>,
}

impl PortRouter {
    pub fn new(engine: Arc<dyn ContainerEngine>, firewall: Arc<dyn Firewall>) -> Self {
        Self { engine, firewall }
    }

    /// Exposed port ranges of the container plus implicit ones. Resolves the
    /// attachment's IPv6 address from the engine if it is not known yet.
    pub async fn ports_to_expose(
        &self,
        attachment: &mut Attachment,
    ) -> Result<Vec<PortRange>, PortRouteError> {
        let details = self
            .engine
            .inspect_container(&attachment.container.id)
            .await?;

        if attachment.ipv6.is_none() {
            attachment.ipv6 = details
                .endpoint(&attachment.network.id)
                .and_then(|e| e.ipv6);
        }
        if attachment.ipv4.is_none() {
            attachment.ipv4 = details
                .endpoint(&attachment.network.id)
                .and_then(|e| e.ipv4);
        }

        let mut ranges = Vec::new();
        for spec in &details.exposed_ports {
            match spec.parse::<PortRange>() {
                Ok(range) if !ranges.contains(&range) => ranges.push(range),
                Ok(_) => {}
                Err(e) => warn!(
                    container_id = %attachment.container.short_id(),
                    port = %spec,
                    error = %e,
                    "Ignoring unparseable exposed port"
                ),
            }
        }

        Ok(merge_implicit(&attachment.container.name, ranges))
    }

    /// Install (or with `unroute`, remove) one ACCEPT rule per exposed
    /// range. A failing rule is logged and the rest are still applied.
    pub async fn route(
        &self,
        attachment: &mut Attachment,
        unroute: bool,
    ) -> Result<RouteSummary, PortRouteError> {
        let ranges = self.ports_to_expose(attachment).await?;
        let address = match attachment.ipv6 {
            Some(address) => address,
            // nothing can have been routed without an address
            None if unroute => {
                debug!(
                    container_id = %attachment.container.short_id(),
                    "No address on the managed network, nothing to unroute"
                );
                return Ok(RouteSummary::default());
            }
            None => return Err(PortRouteError::NoAddress(attachment.container.name.clone())),
        };

        let ports: Vec<String> = ranges.iter().map(|r| r.to_string()).collect();
        info!(
            container_id = %attachment.container.short_id(),
            container_name = %attachment.container.name,
            address = %address,
            ports = ?ports,
            "{}",
            route_message(unroute)
        );

        let mut summary = RouteSummary::default();
        for range in ranges {
            let rule = FirewallRule::new(address, range);
            let result = if unroute {
                self.firewall.delete_if_exists(&rule).await
            } else {
                self.firewall.append_unique(&rule).await
            };
            match result {
                Ok(true) => {
                    summary.changed += 1;
                    debug!(rule = %rule, unroute, "Firewall rule updated");
                }
                Ok(false) => summary.unchanged += 1,
                Err(e) => {
                    summary.failed += 1;
                    warn!(
                        container_id = %attachment.container.short_id(),
                        rule = %rule,
                        unroute,
                        error = %e,
                        "Firewall rule update failed"
                    );
                }
            }
        }
        Ok(summary)
    }
}

fn route_message(unroute: bool) -> &'static str {
    if unroute {
        "Unexposing ports"
    } else {
        "Exposing ports"
    }
}
