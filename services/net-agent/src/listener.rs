//! Lifecycle listeners.
//!
//! The reconciler knows nothing about what happens on each container
//! transition; it hands every transition to a list of listeners. The only
//! listener the agent installs today is [`NetAttachListener`], which keeps
//! containers attached to the managed network and their ports routed.

use std::sync::Arc;

use async_trait::async_trait;
use ctnet_events::ContainerRef;
use ctnet_networking::NetConf;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::attach::{AttachError, Attachment, AttachmentManager};
use crate::engine::{ContainerEngine, EngineError};
use crate::network::ManagedNetwork;
use crate::ports::{PortRouteError, PortRouter};

/// Errors returned by listeners. The reconciler logs them and moves on.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error(transparent)]
    Attach(#[from] AttachError),

    #[error(transparent)]
    Route(#[from] PortRouteError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Receives container and image transitions.
///
/// Every method has a no-op default so a listener only implements what it
/// cares about.
#[async_trait]
pub trait LifecycleListener: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// A container that already existed when the agent started.
    async fn container_discovered(
        &self,
        _container: &ContainerRef,
        _running: bool,
    ) -> Result<(), ListenerError> {
        Ok(())
    }

    async fn container_created(&self, _container: &ContainerRef) -> Result<(), ListenerError> {
        Ok(())
    }

    async fn container_started(&self, _container: &ContainerRef) -> Result<(), ListenerError> {
        Ok(())
    }

    async fn container_stopped(&self, _container: &ContainerRef) -> Result<(), ListenerError> {
        Ok(())
    }

    async fn container_destroyed(&self, _container: &ContainerRef) -> Result<(), ListenerError> {
        Ok(())
    }

    async fn image_pulled(&self, _image: &str) -> Result<(), ListenerError> {
        Ok(())
    }

    async fn image_removed(&self, _image: &str) -> Result<(), ListenerError> {
        Ok(())
    }
}

/// Attaches containers to the managed network and routes their ports.
pub struct NetAttachListener {
    network: Arc<ManagedNetwork>,
    attachments: AttachmentManager,
    router: PortRouter,
    engine: Arc<dyn ContainerEngine>,
    conf_updates: Option<watch::Receiver<NetConf>>,
}

impl NetAttachListener {
    pub fn new(
        network: Arc<ManagedNetwork>,
        attachments: AttachmentManager,
        router: PortRouter,
        engine: Arc<dyn ContainerEngine>,
    ) -> Self {
        Self {
            network,
            attachments,
            router,
            engine,
            conf_updates: None,
        }
    }

    /// Follow the renewed host conf and warn when its prefix drifts from
    /// the network.
    pub fn with_conf_updates(mut self, rx: watch::Receiver<NetConf>) -> Self {
        self.conf_updates = Some(rx);
        self
    }

    pub fn network(&self) -> &Arc<ManagedNetwork> {
        &self.network
    }

    /// True when the current conf's prefix no longer matches the network.
    fn check_prefix(&self) -> bool {
        let Some(rx) = &self.conf_updates else {
            return false;
        };
        let conf = rx.borrow();
        match conf.v6() {
            Some(block) if block.prefix != self.network.v6_prefix => {
                warn!(
                    network = %self.network.name,
                    prefix = %self.network.v6_prefix,
                    renewed_prefix = %block.prefix,
                    "Renewed prefix differs from the managed network"
                );
                true
            }
            _ => false,
        }
    }

    async fn route(&self, container: &ContainerRef, unroute: bool) -> Result<(), ListenerError> {
        // ipvlan has no forwarding chain to manage
        if !self.network.is_bridge() {
            return Ok(());
        }
        let mut attachment = Attachment::new(container.clone(), self.network.clone());
        let summary = self.router.route(&mut attachment, unroute).await?;
        debug!(
            container_id = %container.short_id(),
            changed = summary.changed,
            unchanged = summary.unchanged,
            failed = summary.failed,
            "Port routing done"
        );
        Ok(())
    }
}

#[async_trait]
impl LifecycleListener for NetAttachListener {
    fn name(&self) -> &'static str {
        "netattach"
    }

    async fn container_discovered(
        &self,
        container: &ContainerRef,
        running: bool,
    ) -> Result<(), ListenerError> {
        let details = self.engine.inspect_container(&container.id).await?;
        if details.endpoint(&self.network.id).is_none() {
            self.attachments.attach(container, &self.network).await?;
        } else {
            debug!(
                container_id = %container.short_id(),
                network = %self.network.name,
                "Container already attached"
            );
        }
        if running {
            self.route(container, false).await?;
        }
        Ok(())
    }

    async fn container_created(&self, container: &ContainerRef) -> Result<(), ListenerError> {
        self.check_prefix();
        self.attachments.attach(container, &self.network).await?;
        Ok(())
    }

    async fn container_started(&self, container: &ContainerRef) -> Result<(), ListenerError> {
        self.route(container, false).await
    }

    async fn container_stopped(&self, container: &ContainerRef) -> Result<(), ListenerError> {
        self.route(container, true).await
    }

    async fn container_destroyed(&self, container: &ContainerRef) -> Result<(), ListenerError> {
        self.attachments.detach(container, &self.network).await?;
        Ok(())
    }
}

/// Logs image transitions.
pub struct ImageLogListener;

#[async_trait]
impl LifecycleListener for ImageLogListener {
    fn name(&self) -> &'static str {
        "imagelog"
    }

    async fn image_pulled(&self, image: &str) -> Result<(), ListenerError> {
        info!(image, "Image pulled");
        Ok(())
    }

    async fn image_removed(&self, image: &str) -> Result<(), ListenerError> {
        info!(image, "Image removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;
    use crate::firewall::MemoryFirewall;
    use crate::network::NetworkSelector;
    use ctnet_networking::{DnsConfig, Ipv6Block};

    fn bridge(prefix: &str) -> NetConf {
        let block = Ipv6Block::with_first_host_gateway(prefix.parse().unwrap()).unwrap();
        NetConf::bridge("eth0", block, DnsConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_prefix_drift_follows_renewed_conf() {
        let engine = Arc::new(MockEngine::new());
        let conf = bridge("2001:db8:9::/64");
        let network = Arc::new(
            NetworkSelector::new(engine.clone())
                .select_or_create(&conf)
                .await
                .unwrap(),
        );
        let (tx, rx) = watch::channel(conf);
        let listener = NetAttachListener::new(
            network,
            AttachmentManager::new(engine.clone(), None),
            PortRouter::new(engine.clone(), Arc::new(MemoryFirewall::new())),
            engine.clone(),
        )
        .with_conf_updates(rx);

        assert!(!listener.check_prefix());

        let mut renewed = tx.borrow().clone();
        renewed
            .replace_v6(Ipv6Block::with_first_host_gateway("2001:db8:a::/64".parse().unwrap()).unwrap())
            .unwrap();
        tx.send_replace(renewed);
        assert!(listener.check_prefix());
    }
}
