//! Persisted DHCPv4 leases.
//!
//! Each lease lives in `<dir>/<hex client id>.json`. Leases are written as
//! soon as they are acquired, rewritten on renewal and deleted on release,
//! so a restarted agent can renew or release what an earlier run obtained.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::net::Ipv4Addr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ctnet_networking::{DnsConfig, Ipv4Block};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::v4::LeaseInfo;
use crate::DhcpError;

// ============================================================================
// Provider seam
// ============================================================================

/// The DHCPv4 exchanges a lease client needs.
#[async_trait]
pub trait LeaseProvider: Send + Sync {
    /// DISCOVER/OFFER only; nothing is committed on the server.
    async fn discover(&self, interface: &str, client_id: &[u8]) -> Result<LeaseInfo, DhcpError>;

    /// Obtain an acknowledged lease, trying `preferred` in place first.
    async fn request(
        &self,
        interface: &str,
        client_id: &[u8],
        hostname: &str,
        preferred: Option<Ipv4Addr>,
    ) -> Result<LeaseInfo, DhcpError>;

    async fn release(
        &self,
        interface: &str,
        client_id: &[u8],
        lease: &LeaseInfo,
    ) -> Result<(), DhcpError>;
}

// ============================================================================
// Lease record
// ============================================================================

/// A DHCPv4 lease held on behalf of one client identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpLeaseV4 {
    pub interface: String,
    #[serde(with = "hex_bytes")]
    pub client_id: Vec<u8>,
    pub hostname: String,
    pub lease: LeaseInfo,
    pub ttl_secs: u64,
    pub renewed: DateTime<Utc>,
}

impl DhcpLeaseV4 {
    pub fn new(
        interface: impl Into<String>,
        client_id: Vec<u8>,
        hostname: impl Into<String>,
        lease: LeaseInfo,
        renewed: DateTime<Utc>,
    ) -> Self {
        let ttl_secs = lease.ttl().as_secs();
        Self {
            interface: interface.into(),
            client_id,
            hostname: hostname.into(),
            lease,
            ttl_secs,
            renewed,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn address(&self) -> Ipv4Addr {
        self.lease.address
    }

    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.lease.gateway()
    }

    /// Due once more than half the TTL has passed since the last renewal.
    pub fn needs_renewal(&self, now: DateTime<Utc>) -> bool {
        let elapsed = now.signed_duration_since(self.renewed);
        elapsed.num_seconds() > (self.ttl_secs / 2) as i64
    }

    pub fn to_block(&self) -> Result<Ipv4Block, DhcpError> {
        self.lease.to_block()
    }

    pub fn dns(&self) -> DnsConfig {
        self.lease.dns()
    }

    pub fn file_name(&self) -> String {
        lease_file_name(&self.client_id)
    }
}

/// Client identifier bytes: hex-decoded when the string is valid hex,
/// otherwise the raw string bytes.
pub fn make_client_id(id: &str) -> Vec<u8> {
    hex::decode(id).unwrap_or_else(|_| id.as_bytes().to_vec())
}

fn lease_file_name(client_id: &[u8]) -> String {
    format!("{}.json", hex::encode(client_id))
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Lease store
// ============================================================================

/// Directory of lease files.
#[derive(Debug, Clone)]
pub struct LeaseStore {
    dir: PathBuf,
}

impl LeaseStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, client_id: &[u8]) -> PathBuf {
        self.dir.join(lease_file_name(client_id))
    }

    /// Write the lease, readable by the owner only.
    pub fn save(&self, lease: &DhcpLeaseV4) -> Result<(), DhcpError> {
        let path = self.path_for(&lease.client_id);
        fs::create_dir_all(&self.dir).map_err(|e| state_error(&self.dir, e))?;

        let data = serde_json::to_vec_pretty(lease).map_err(|e| state_error(&path, e))?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| state_error(&path, e))?;
        file.write_all(&data).map_err(|e| state_error(&path, e))?;

        debug!(path = %path.display(), "Saved DHCPv4 lease");
        Ok(())
    }

    pub fn load(&self, client_id: &[u8]) -> Result<Option<DhcpLeaseV4>, DhcpError> {
        let path = self.path_for(client_id);
        match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| state_error(&path, e)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(state_error(&path, e)),
        }
    }

    /// Every readable lease. Unreadable files are logged and skipped.
    pub fn load_all(&self) -> Result<Vec<DhcpLeaseV4>, DhcpError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(state_error(&self.dir, e)),
        };

        let mut leases = Vec::new();
        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    error!(dir = %self.dir.display(), error = %e, "Failed to read lease directory entry");
                    continue;
                }
            };
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|data| serde_json::from_slice(&data).map_err(|e| e.to_string()))
            {
                Ok(lease) => leases.push(lease),
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Failed to load DHCPv4 lease");
                }
            }
        }
        Ok(leases)
    }

    /// Remove the lease file; a missing file is not an error.
    pub fn remove(&self, client_id: &[u8]) -> Result<(), DhcpError> {
        let path = self.path_for(client_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(state_error(&path, e)),
        }
    }
}

fn state_error(path: &Path, err: impl std::fmt::Display) -> DhcpError {
    DhcpError::State {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

// ============================================================================
// Lease client
// ============================================================================

/// Outcome of a renewal sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenewSummary {
    pub checked: usize,
    pub renewed: usize,
    pub failed: usize,
    /// Renewals that came back with a different address or gateway.
    pub anomalies: usize,
}

/// Acquires, renews and releases persisted DHCPv4 leases.
#[derive(Clone)]
pub struct LeaseClient {
    provider: Arc<dyn LeaseProvider>,
    store: LeaseStore,
}

impl LeaseClient {
    pub fn new(provider: Arc<dyn LeaseProvider>, store: LeaseStore) -> Self {
        Self { provider, store }
    }

    pub fn store(&self) -> &LeaseStore {
        &self.store
    }

    /// Network block and DNS offered on `interface`, without committing a
    /// lease.
    pub async fn discover(
        &self,
        interface: &str,
        client_id: &[u8],
    ) -> Result<(Ipv4Block, DnsConfig), DhcpError> {
        let offer = self.provider.discover(interface, client_id).await?;
        let block = offer.to_block()?;
        info!(
            interface,
            prefix = %block.prefix,
            gateway = %block.gateway,
            "Discovered DHCPv4 network"
        );
        Ok((block, offer.dns()))
    }

    /// Acquire a lease and persist it.
    pub async fn lease(
        &self,
        interface: &str,
        client_id: &[u8],
        hostname: &str,
        preferred: Option<Ipv4Addr>,
    ) -> Result<DhcpLeaseV4, DhcpError> {
        let info = self
            .provider
            .request(interface, client_id, hostname, preferred)
            .await?;
        if info.gateway().is_none() {
            return Err(DhcpError::NoRouter);
        }

        let lease = DhcpLeaseV4::new(interface, client_id.to_vec(), hostname, info, Utc::now());
        self.store.save(&lease)?;
        info!(
            interface,
            hostname,
            address = %lease.address(),
            ttl_secs = lease.ttl_secs,
            "Acquired DHCPv4 lease"
        );
        Ok(lease)
    }

    /// Re-request the lease in place once half its TTL has elapsed.
    pub async fn renew_if_needed(
        &self,
        lease: DhcpLeaseV4,
        now: DateTime<Utc>,
    ) -> Result<DhcpLeaseV4, DhcpError> {
        if !lease.needs_renewal(now) {
            return Ok(lease);
        }
        debug!(
            hostname = %lease.hostname,
            address = %lease.address(),
            "Renewing DHCPv4 lease"
        );
        self.lease(
            &lease.interface,
            &lease.client_id,
            &lease.hostname,
            Some(lease.address()),
        )
        .await
    }

    /// Release the lease on the server and forget it.
    pub async fn release(&self, lease: &DhcpLeaseV4) -> Result<(), DhcpError> {
        self.provider
            .release(&lease.interface, &lease.client_id, &lease.lease)
            .await?;
        self.store.remove(&lease.client_id)?;
        info!(
            hostname = %lease.hostname,
            address = %lease.address(),
            "Released DHCPv4 lease"
        );
        Ok(())
    }

    /// Release whatever lease is stored for `client_id`. Returns whether one
    /// existed.
    pub async fn release_client(&self, client_id: &[u8]) -> Result<bool, DhcpError> {
        match self.store.load(client_id)? {
            Some(lease) => {
                self.release(&lease).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Renew every persisted lease that is due.
    ///
    /// A renewal that returns a different address or gateway is logged as
    /// an anomaly and otherwise accepted.
    pub async fn renew_all(&self, now: DateTime<Utc>) -> Result<RenewSummary, DhcpError> {
        let mut summary = RenewSummary::default();

        for lease in self.store.load_all()? {
            summary.checked += 1;
            if !lease.needs_renewal(now) {
                continue;
            }

            let previous_address = lease.address();
            let previous_gateway = lease.gateway();
            let hostname = lease.hostname.clone();

            match self.renew_if_needed(lease, now).await {
                Ok(renewed) => {
                    summary.renewed += 1;
                    if renewed.address() != previous_address
                        || renewed.gateway() != previous_gateway
                    {
                        summary.anomalies += 1;
                        warn!(
                            hostname = %hostname,
                            previous_address = %previous_address,
                            address = %renewed.address(),
                            previous_gateway = ?previous_gateway,
                            gateway = ?renewed.gateway(),
                            "DHCPv4 renewal changed address or gateway"
                        );
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(hostname = %hostname, error = %e, "Failed to renew DHCPv4 lease");
                }
            }
        }

        Ok(summary)
    }
}
