//! IPv6 forwarding-chain rules.
//!
//! Each exposed port of a running container gets one ACCEPT rule in the
//! `filter` table's `FORWARD` chain, matched on destination address,
//! protocol and destination port. Rules are added with append-unique and
//! removed with delete-if-exists semantics so both directions can be
//! replayed safely.

use std::net::Ipv6Addr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use ctnet_networking::PortRange;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

const TABLE: &str = "filter";
const CHAIN: &str = "FORWARD";

/// Errors from firewall operations.
#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("command execution failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("ip6tables {op} timed out")]
    Timeout { op: &'static str },

    #[error("ip6tables {op} exited with {status}: {stderr}")]
    Command {
        op: &'static str,
        status: i32,
        stderr: String,
    },
}

/// ACCEPT rule for forwarded traffic to one container port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FirewallRule {
    pub destination: Ipv6Addr,
    pub range: PortRange,
}

impl FirewallRule {
    pub fn new(destination: Ipv6Addr, range: PortRange) -> Self {
        Self { destination, range }
    }

    /// Rule specification as ip6tables arguments.
    pub fn args(&self) -> Vec<String> {
        vec![
            "-d".to_string(),
            self.destination.to_string(),
            "-p".to_string(),
            self.range.protocol.to_string(),
            "--dport".to_string(),
            self.range.dport(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ]
    }
}

impl std::fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.args().join(" "))
    }
}

/// Forwarding-chain rule management.
#[async_trait]
pub trait Firewall: Send + Sync {
    async fn exists(&self, rule: &FirewallRule) -> Result<bool, FirewallError>;

    /// Append the rule unless present. Returns whether it was added.
    async fn append_unique(&self, rule: &FirewallRule) -> Result<bool, FirewallError>;

    /// Delete the rule if present. Returns whether it was removed.
    async fn delete_if_exists(&self, rule: &FirewallRule) -> Result<bool, FirewallError>;
}

// =============================================================================
// ip6tables
// =============================================================================

/// Firewall backed by the `ip6tables` command.
#[derive(Debug, Clone)]
pub struct Ip6Tables {
    program: String,
    lock_wait_secs: u64,
    timeout: Duration,
}

impl Default for Ip6Tables {
    fn default() -> Self {
        Self {
            program: "ip6tables".to_string(),
            lock_wait_secs: 1,
            timeout: Duration::from_secs(2),
        }
    }
}

impl Ip6Tables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one ip6tables operation; returns the exit code.
    async fn run(&self, op: &'static str, rule: &FirewallRule) -> Result<i32, FirewallError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-w")
            .arg(self.lock_wait_secs.to_string())
            .arg("-t")
            .arg(TABLE)
            .arg(op)
            .arg(CHAIN)
            .args(rule.args())
            .kill_on_drop(true);

        debug!(op, rule = %rule, "Running ip6tables");
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| FirewallError::Timeout { op })??;

        let code = output.status.code().unwrap_or(-1);
        // -C exits 1 when the rule is absent
        if code == 0 || (op == "-C" && code == 1) {
            return Ok(code);
        }
        Err(FirewallError::Command {
            op,
            status: code,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl Firewall for Ip6Tables {
    async fn exists(&self, rule: &FirewallRule) -> Result<bool, FirewallError> {
        Ok(self.run("-C", rule).await? == 0)
    }

    async fn append_unique(&self, rule: &FirewallRule) -> Result<bool, FirewallError> {
        if self.exists(rule).await? {
            return Ok(false);
        }
        self.run("-A", rule).await?;
        Ok(true)
    }

    async fn delete_if_exists(&self, rule: &FirewallRule) -> Result<bool, FirewallError> {
        if !self.exists(rule).await? {
            return Ok(false);
        }
        self.run("-D", rule).await?;
        Ok(true)
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Firewall that keeps rules in memory, for tests.
#[derive(Debug, Default)]
pub struct MemoryFirewall {
    rules: Mutex<Vec<FirewallRule>>,
    fail_on_port: Option<u16>,
}

impl MemoryFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Firewall that rejects any rule starting at `port`.
    pub fn failing_on(port: u16) -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            fail_on_port: Some(port),
        }
    }

    pub fn rules(&self) -> Vec<FirewallRule> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<FirewallRule>> {
        self.rules.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self, op: &'static str, rule: &FirewallRule) -> Result<(), FirewallError> {
        if self.fail_on_port == Some(rule.range.start) {
            return Err(FirewallError::Command {
                op,
                status: 4,
                stderr: "resource temporarily unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Firewall for MemoryFirewall {
    async fn exists(&self, rule: &FirewallRule) -> Result<bool, FirewallError> {
        self.check("-C", rule)?;
        Ok(self.lock().contains(rule))
    }

    async fn append_unique(&self, rule: &FirewallRule) -> Result<bool, FirewallError> {
        self.check("-A", rule)?;
        let mut rules = self.lock();
        if rules.contains(rule) {
            return Ok(false);
        }
        rules.push(*rule);
        Ok(true)
    }

    async fn delete_if_exists(&self, rule: &FirewallRule) -> Result<bool, FirewallError> {
        self.check("-D", rule)?;
        let mut rules = self.lock();
        let before = rules.len();
        rules.retain(|r| r != rule);
        Ok(rules.len() != before)
    }
}
