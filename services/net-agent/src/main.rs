//! ctnet Net Agent
//!
//! Gives containers on this host routable IPv6 addresses.
//!
//! ## Startup
//!
//! 1. Resolve the IPv6 block: static `--ipv6-prefix`, or DHCPv6 prefix
//!    delegation on `--net-interface`
//! 2. In ipvlan mode, discover the shared IPv4 network over DHCPv4
//! 3. Select or create the managed engine network
//! 4. Attach containers that already exist, then follow engine events
//!
//! Any failure before step 4 is fatal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ctnet_dhcp::{
    make_client_id, Dhcp4Client, Dhcp6Client, Dhcp6Config, LeaseClient, LeaseStore,
};
use ctnet_net_agent::attach::AttachmentManager;
use ctnet_net_agent::config::Config;
use ctnet_net_agent::engine::{ContainerEngine, DockerClient};
use ctnet_net_agent::firewall::Ip6Tables;
use ctnet_net_agent::listener::{ImageLogListener, NetAttachListener};
use ctnet_net_agent::network::NetworkSelector;
use ctnet_net_agent::ports::PortRouter;
use ctnet_net_agent::reconciler::{Reconciler, ReconcilerConfig};
use ctnet_net_agent::renew::{
    acquire_with_retries, run_lease_renewal, run_prefix_renewal, RenewalConfig,
};
use ctnet_networking::{DnsConfig, NetConf, NetMode};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    let default_filter = if config.debug {
        "info,ctnet_dhcp=debug,ctnet_net_agent=debug"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        net_type = %config.net_type,
        interface = ?config.interface(),
        state_dir = %config.state_dir.display(),
        docker_socket = %config.docker_socket.display(),
        "Starting ctnet net agent"
    );

    config.validate().context("invalid configuration")?;

    if config.net_type == NetMode::None {
        info!("No network type configured, networking disabled");
        return Ok(());
    }
    let interface = config
        .interface()
        .context("a network interface is required")?
        .to_string();

    let docker = DockerClient::new(&config.docker_socket);
    if !docker.socket_exists() {
        warn!(socket = %config.docker_socket.display(), "Engine socket does not exist yet");
    }
    let engine: Arc<dyn ContainerEngine> = Arc::new(docker);
    let renewal = RenewalConfig::default();

    // IPv6 block
    let static_block = config
        .static_v6_block()
        .context("invalid static IPv6 prefix")?;
    let (v6, dhcp6) = match static_block {
        Some(block) => {
            info!(prefix = %block.prefix, gateway = %block.gateway, "Using static IPv6 prefix");
            ((block, DnsConfig::default()), None)
        }
        None => {
            if config.shared_prefix {
                warn!("Requesting prefix with the shared DUID; pool sharing depends on the upstream server");
            }
            let client = Dhcp6Client::new(Dhcp6Config {
                shared_duid: config.shared_prefix,
                debug: config.debug,
                ..Dhcp6Config::new(&interface)
            })
            .context("failed to set up DHCPv6 client")?;
            let delegated = acquire_with_retries(&client, &renewal)
                .await
                .context("failed to acquire a delegated IPv6 prefix")?;
            (
                (delegated.block.clone(), delegated.dns.clone()),
                Some((client, delegated)),
            )
        }
    };

    // IPv4 block, ipvlan only
    let leases = match config.net_type {
        NetMode::Ipvlan => Some(LeaseClient::new(
            Arc::new(Dhcp4Client::new(config.debug)),
            LeaseStore::new(config.lease_dir()),
        )),
        _ => None,
    };
    let v4 = match &leases {
        Some(leases) => Some(
            leases
                .discover(&interface, &make_client_id(&config.v4_client_id))
                .await
                .context("failed to discover the IPv4 network")?,
        ),
        None => None,
    };

    let conf = NetConf::merge(config.net_type, interface.as_str(), v4, Some(v6))
        .context("invalid network configuration")?;
    let network = Arc::new(
        NetworkSelector::new(engine.clone())
            .select_or_create(&conf)
            .await
            .context("failed to select the managed network")?,
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (conf_tx, conf_rx) = watch::channel(conf);

    let router = PortRouter::new(engine.clone(), Arc::new(Ip6Tables::new()));
    let attachments = AttachmentManager::new(engine.clone(), leases.clone());
    let mut netattach =
        NetAttachListener::new(network.clone(), attachments, router, engine.clone());
    if dhcp6.is_some() {
        netattach = netattach.with_conf_updates(conf_rx);
    }

    let reconciler = Arc::new(
        Reconciler::new(
            engine.clone(),
            config.event_filter(),
            ReconcilerConfig::default(),
        )
        .with_listener(Arc::new(netattach))
        .with_listener(Arc::new(ImageLogListener)),
    );

    if let Err(e) = reconciler.discover().await {
        warn!(error = %e, "Failed to list existing containers");
    }

    let prefix_handle = dhcp6.map(|(client, delegated)| {
        tokio::spawn(async move {
            run_prefix_renewal(&client, delegated, conf_tx, renewal).await;
        })
    });

    let lease_handle = leases.map(|leases| {
        tokio::spawn(run_lease_renewal(
            leases,
            Duration::from_secs(config.v4_renew_interval_secs),
            shutdown_rx.clone(),
        ))
    });

    let reconciler_handle = tokio::spawn({
        let reconciler = Arc::clone(&reconciler);
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconciler.run(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = reconciler_handle => {
            match result {
                Ok(()) => info!("Reconciler exited"),
                Err(e) => error!(error = %e, "Reconciler task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);
    if let Some(handle) = prefix_handle {
        handle.abort();
    }

    info!("Waiting for workers to shut down...");
    if let Some(handle) = lease_handle {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    info!(network = %network.name, "Net agent shutdown complete");
    Ok(())
}
