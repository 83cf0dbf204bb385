//! Address block acquisition and renewal loops.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ctnet_dhcp::{DelegatedPrefix, Dhcp6Client, DhcpError, LeaseClient};
use ctnet_networking::NetConf;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Something that can obtain a delegated IPv6 prefix.
#[async_trait]
pub trait PrefixSource: Send + Sync {
    async fn acquire(&self) -> Result<DelegatedPrefix, DhcpError>;
}

#[async_trait]
impl PrefixSource for Dhcp6Client {
    async fn acquire(&self) -> Result<DelegatedPrefix, DhcpError> {
        Dhcp6Client::acquire(self).await
    }
}

/// Timing of startup acquisition and background renewal.
#[derive(Debug, Clone)]
pub struct RenewalConfig {
    /// Startup acquisition attempts before giving up.
    pub startup_attempts: u32,
    pub startup_retry_delay: Duration,
    /// Delay before retrying a failed renewal.
    pub failure_retry: Duration,
    /// Floor for the sleep between renewals.
    pub min_interval: Duration,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            startup_attempts: 3,
            startup_retry_delay: Duration::from_secs(5),
            failure_retry: Duration::from_secs(15 * 60),
            min_interval: Duration::from_secs(60),
        }
    }
}

/// Startup acquisition. Returns the last error once all attempts fail;
/// a prefix rejected by policy is never retried.
pub async fn acquire_with_retries(
    source: &dyn PrefixSource,
    config: &RenewalConfig,
) -> Result<DelegatedPrefix, DhcpError> {
    let attempts = config.startup_attempts.max(1);
    let mut attempt = 1;
    loop {
        match source.acquire().await {
            Ok(prefix) => {
                info!(
                    prefix = %prefix.block.prefix,
                    gateway = %prefix.block.gateway,
                    preferred_secs = prefix.block.preferred_lifetime.as_secs(),
                    valid_secs = prefix.block.valid_lifetime.as_secs(),
                    "Acquired delegated prefix"
                );
                return Ok(prefix);
            }
            Err(e) if attempt < attempts && !matches!(e, DhcpError::Policy(_)) => {
                warn!(attempt, error = %e, "Prefix acquisition failed, retrying");
                tokio::time::sleep(config.startup_retry_delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn renewal_delay(prefix: &DelegatedPrefix, config: &RenewalConfig) -> Duration {
    prefix.block.preferred_lifetime.max(config.min_interval)
}

/// Re-acquire the prefix each time its preferred lifetime runs out.
///
/// The loop owns the current [`NetConf`]: each renewed block is applied
/// with [`NetConf::replace_v6`] and the updated conf is published on
/// `conf`. Failures are retried after `failure_retry`. Never returns.
pub async fn run_prefix_renewal(
    source: &dyn PrefixSource,
    initial: DelegatedPrefix,
    conf: watch::Sender<NetConf>,
    config: RenewalConfig,
) {
    let mut delay = renewal_delay(&initial, &config);
    let mut current = initial;

    loop {
        debug!(delay_secs = delay.as_secs(), "Next prefix renewal scheduled");
        tokio::time::sleep(delay).await;

        let renewed = match source.acquire().await {
            Ok(renewed) => renewed,
            Err(e) => {
                error!(
                    prefix = %current.block.prefix,
                    error = %e,
                    retry_in_secs = config.failure_retry.as_secs(),
                    "Prefix renewal failed"
                );
                delay = config.failure_retry;
                continue;
            }
        };

        let mut next = conf.borrow().clone();
        if let Err(e) = next.replace_v6(renewed.block.clone()) {
            error!(
                renewed_prefix = %renewed.block.prefix,
                error = %e,
                retry_in_secs = config.failure_retry.as_secs(),
                "Renewed prefix rejected"
            );
            delay = config.failure_retry;
            continue;
        }

        if renewed.block.prefix != current.block.prefix {
            warn!(
                prefix = %current.block.prefix,
                renewed_prefix = %renewed.block.prefix,
                "Delegated prefix changed on renewal"
            );
        } else {
            info!(
                prefix = %renewed.block.prefix,
                preferred_secs = renewed.block.preferred_lifetime.as_secs(),
                "Renewed delegated prefix"
            );
        }
        delay = renewal_delay(&renewed, &config);
        conf.send_replace(next);
        current = renewed;
    }
}

/// Sweep persisted DHCPv4 leases every `interval` until shutdown.
pub async fn run_lease_renewal(
    leases: LeaseClient,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match leases.renew_all(Utc::now()).await {
                    Ok(summary) if summary.renewed > 0 || summary.failed > 0 => {
                        info!(
                            checked = summary.checked,
                            renewed = summary.renewed,
                            failed = summary.failed,
                            anomalies = summary.anomalies,
                            "DHCPv4 renewal sweep"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "DHCPv4 renewal sweep failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Lease renewal stopping");
                    break;
                }
            }
        }
    }
}
