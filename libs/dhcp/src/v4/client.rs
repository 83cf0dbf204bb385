use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use async_trait::async_trait;
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::codec::{DhcpOption, Message, MessageType, PARAMETER_REQUEST_LIST};
use super::LeaseInfo;
use crate::lease::LeaseProvider;
use crate::transport::{self, Retransmit};
use crate::{hardware_address, DhcpError};

pub const CLIENT_PORT: u16 = 68;
pub const SERVER_PORT: u16 = 67;

/// Where the client listens and where requests go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dhcp4Endpoints {
    pub bind: SocketAddr,
    pub server: SocketAddr,
    /// Bind the socket to the interface with SO_BINDTODEVICE.
    pub bind_to_device: bool,
}

impl Default for Dhcp4Endpoints {
    fn default() -> Self {
        Self {
            bind: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, CLIENT_PORT)),
            server: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, SERVER_PORT)),
            bind_to_device: true,
        }
    }
}

/// DHCPv4 client. One instance serves every interface; exchanges are
/// serialized because they share the client port.
pub struct Dhcp4Client {
    debug: bool,
    retransmit: Retransmit,
    endpoints: Dhcp4Endpoints,
    hardware_address: Option<[u8; 6]>,
    exchange_lock: Mutex<()>,
}

struct Session {
    socket: UdpSocket,
    mac: [u8; 6],
}

impl Dhcp4Client {
    pub fn new(debug: bool) -> Self {
        Self {
            debug,
            retransmit: Retransmit::default(),
            endpoints: Dhcp4Endpoints::default(),
            hardware_address: None,
            exchange_lock: Mutex::new(()),
        }
    }

    pub fn with_retransmit(mut self, retransmit: Retransmit) -> Self {
        self.retransmit = retransmit;
        self
    }

    pub fn with_endpoints(mut self, endpoints: Dhcp4Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Use a fixed chaddr instead of the interface's MAC.
    pub fn with_hardware_address(mut self, mac: [u8; 6]) -> Self {
        self.hardware_address = Some(mac);
        self
    }

    fn open(&self, interface: &str) -> Result<Session, DhcpError> {
        let mac = match self.hardware_address {
            Some(mac) => mac,
            None => hardware_address(interface)?,
        };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        if self.endpoints.bind_to_device {
            socket.bind_device(Some(interface.as_bytes()))?;
        }
        socket.bind(&self.endpoints.bind.into())?;
        socket.set_nonblocking(true)?;

        Ok(Session {
            socket: UdpSocket::from_std(socket.into())?,
            mac,
        })
    }

    fn base_message(
        &self,
        msg_type: MessageType,
        xid: u32,
        session: &Session,
        client_id: &[u8],
        hostname: &str,
    ) -> Message {
        let mut msg = Message::request(msg_type, xid, session.mac);
        msg.push(DhcpOption::ClientIdentifier, client_id.to_vec());
        if !hostname.is_empty() {
            msg.push(DhcpOption::Hostname, hostname.as_bytes().to_vec());
        }
        msg.push(DhcpOption::ParameterRequest, PARAMETER_REQUEST_LIST.to_vec());
        msg
    }

    async fn discover_on(
        &self,
        session: &Session,
        client_id: &[u8],
        hostname: &str,
    ) -> Result<LeaseInfo, DhcpError> {
        let xid: u32 = rand::rng().random();
        let discover = self.base_message(MessageType::Discover, xid, session, client_id, hostname);

        let packet = transport::exchange(
            &session.socket,
            &discover.encode(),
            self.endpoints.server,
            self.retransmit,
            self.debug,
            "DHCPv4 DISCOVER",
            |p| accepts(p, xid, &[MessageType::Offer]),
        )
        .await?;

        let offer = LeaseInfo::from_message(&Message::decode(&packet)?);
        debug!(address = %offer.address, server = ?offer.server_id, "Received DHCPv4 offer");
        Ok(offer)
    }

    async fn request_on(
        &self,
        session: &Session,
        client_id: &[u8],
        hostname: &str,
        address: Ipv4Addr,
        server_id: Option<Ipv4Addr>,
    ) -> Result<LeaseInfo, DhcpError> {
        let xid: u32 = rand::rng().random();
        let mut request = self.base_message(MessageType::Request, xid, session, client_id, hostname);
        request.push(DhcpOption::RequestedIp, address.octets().to_vec());
        if let Some(server) = server_id {
            request.push(DhcpOption::ServerIdentifier, server.octets().to_vec());
        }

        let packet = transport::exchange(
            &session.socket,
            &request.encode(),
            self.endpoints.server,
            self.retransmit,
            self.debug,
            "DHCPv4 REQUEST",
            |p| accepts(p, xid, &[MessageType::Ack, MessageType::Nak]),
        )
        .await?;

        let reply = Message::decode(&packet)?;
        if reply.message_type() == Some(MessageType::Nak) {
            let reason = reply
                .option(DhcpOption::Message)
                .map(|m| String::from_utf8_lossy(m).into_owned())
                .unwrap_or_else(|| format!("address {} refused", address));
            return Err(DhcpError::Nak(reason));
        }
        Ok(LeaseInfo::from_message(&reply))
    }

    fn release_destination(&self, lease: &LeaseInfo) -> SocketAddr {
        match (self.endpoints.server, lease.server_id) {
            (SocketAddr::V4(dest), Some(server)) if dest.ip().is_broadcast() => {
                SocketAddr::V4(SocketAddrV4::new(server, SERVER_PORT))
            }
            (dest, _) => dest,
        }
    }
}

#[async_trait]
impl LeaseProvider for Dhcp4Client {
    async fn discover(&self, interface: &str, client_id: &[u8]) -> Result<LeaseInfo, DhcpError> {
        let _guard = self.exchange_lock.lock().await;
        let session = self.open(interface)?;
        self.discover_on(&session, client_id, "").await
    }

    async fn request(
        &self,
        interface: &str,
        client_id: &[u8],
        hostname: &str,
        preferred: Option<Ipv4Addr>,
    ) -> Result<LeaseInfo, DhcpError> {
        let _guard = self.exchange_lock.lock().await;
        let session = self.open(interface)?;

        if let Some(address) = preferred {
            match self
                .request_on(&session, client_id, hostname, address, None)
                .await
            {
                Ok(lease) => return Ok(lease),
                Err(e @ (DhcpError::Nak(_) | DhcpError::Timeout { .. })) => {
                    info!(
                        interface,
                        address = %address,
                        error = %e,
                        "Renewal in place failed, restarting from DISCOVER"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let offer = self.discover_on(&session, client_id, hostname).await?;
        self.request_on(&session, client_id, hostname, offer.address, offer.server_id)
            .await
    }

    async fn release(
        &self,
        interface: &str,
        client_id: &[u8],
        lease: &LeaseInfo,
    ) -> Result<(), DhcpError> {
        let _guard = self.exchange_lock.lock().await;
        let session = self.open(interface)?;

        let xid: u32 = rand::rng().random();
        let mut release = Message::request(MessageType::Release, xid, session.mac);
        release.flags = 0;
        release.ciaddr = lease.address;
        release.push(DhcpOption::ClientIdentifier, client_id.to_vec());
        if let Some(server) = lease.server_id {
            release.push(DhcpOption::ServerIdentifier, server.octets().to_vec());
        }

        transport::send(
            &session.socket,
            &release.encode(),
            self.release_destination(lease),
            self.debug,
        )
        .await
    }
}

fn accepts(packet: &[u8], xid: u32, types: &[MessageType]) -> bool {
    match Message::decode(packet) {
        Ok(msg) => {
            msg.is_reply()
                && msg.xid == xid
                && msg.message_type().is_some_and(|t| types.contains(&t))
        }
        Err(e) => {
            debug!(error = %e, "Dropping undecodable DHCPv4 packet");
            false
        }
    }
}
