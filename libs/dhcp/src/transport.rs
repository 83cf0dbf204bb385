//! UDP request/response exchange with retransmission.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::DhcpError;

/// Retransmission policy for one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retransmit {
    /// Number of transmissions before giving up.
    pub attempts: u32,
    /// Wait after the first transmission; doubled after each retry.
    pub initial_timeout: Duration,
    /// Upper bound for the doubled wait.
    pub max_timeout: Duration,
}

impl Default for Retransmit {
    fn default() -> Self {
        Self {
            attempts: 4,
            initial_timeout: Duration::from_secs(1),
            max_timeout: Duration::from_secs(8),
        }
    }
}

/// Send `packet` to `dest` until a datagram satisfying `accept` arrives.
///
/// Datagrams that do not satisfy `accept` (other transactions, other
/// clients' broadcasts) are dropped without resetting the timer.
pub(crate) async fn exchange<F>(
    socket: &UdpSocket,
    packet: &[u8],
    dest: SocketAddr,
    policy: Retransmit,
    debug_packets: bool,
    label: &'static str,
    mut accept: F,
) -> Result<Vec<u8>, DhcpError>
where
    F: FnMut(&[u8]) -> bool,
{
    let mut timeout = policy.initial_timeout;
    let mut buf = vec![0u8; 1500];

    for attempt in 1..=policy.attempts {
        debug!(exchange = label, attempt, dest = %dest, "Sending DHCP message");
        trace_packet(debug_packets, "send", dest, packet);
        socket.send_to(packet, dest).await?;

        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, peer))) => {
                    trace_packet(debug_packets, "recv", peer, &buf[..len]);
                    if accept(&buf[..len]) {
                        return Ok(buf[..len].to_vec());
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    debug!(
                        exchange = label,
                        timeout_ms = timeout.as_millis() as u64,
                        "DHCP exchange timed out"
                    );
                    break;
                }
            }
        }

        timeout = (timeout * 2).min(policy.max_timeout);
    }

    Err(DhcpError::Timeout {
        exchange: label,
        attempts: policy.attempts,
    })
}

/// Fire-and-forget transmission (RELEASE has no reply).
pub(crate) async fn send(
    socket: &UdpSocket,
    packet: &[u8],
    dest: SocketAddr,
    debug_packets: bool,
) -> Result<(), DhcpError> {
    trace_packet(debug_packets, "send", dest, packet);
    socket.send_to(packet, dest).await?;
    Ok(())
}

fn trace_packet(enabled: bool, direction: &'static str, peer: SocketAddr, packet: &[u8]) {
    if enabled {
        info!(
            direction,
            peer = %peer,
            len = packet.len(),
            packet = %hex::encode(packet),
            "DHCP packet"
        );
    }
}
