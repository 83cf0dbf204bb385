use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::time::{Duration, Instant};

use bytes::Bytes;
use ctnet_networking::{DnsConfig, Ipv6Block, Ipv6Prefix};
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::codec::{self, option, status, IaPd, Message, MessageType, StatusCode};
use super::duid::{Duid, IAID};
use crate::transport::{self, Retransmit};
use crate::{hardware_address, interface_index, DhcpError};

pub const CLIENT_PORT: u16 = 546;
pub const SERVER_PORT: u16 = 547;
pub const ALL_DHCP_RELAY_AGENTS_AND_SERVERS: Ipv6Addr =
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0x0001, 0x0002);

/// DHCPv6 client settings.
#[derive(Debug, Clone)]
pub struct Dhcp6Config {
    pub interface: String,
    /// Present the fixed shared DUID instead of one derived from the MAC.
    pub shared_duid: bool,
    /// Log every packet in hex.
    pub debug: bool,
    pub retransmit: Retransmit,
}

impl Dhcp6Config {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            shared_duid: false,
            debug: false,
            retransmit: Retransmit::default(),
        }
    }
}

/// A delegated prefix ready to back a container network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegatedPrefix {
    /// Prefix, gateway (first host) and lifetimes.
    pub block: Ipv6Block,
    pub dns: DnsConfig,
    /// Renewal timers from the IA_PD, zero when the server left them to us.
    pub t1: Duration,
    pub t2: Duration,
}

/// DHCPv6 prefix delegation client bound to one interface.
pub struct Dhcp6Client {
    config: Dhcp6Config,
    duid: Duid,
}

impl Dhcp6Client {
    pub fn new(config: Dhcp6Config) -> Result<Self, DhcpError> {
        let duid = if config.shared_duid {
            Duid::shared()
        } else {
            Duid::link_layer(hardware_address(&config.interface)?)
        };
        Ok(Self::with_duid(config, duid))
    }

    pub fn with_duid(config: Dhcp6Config, duid: Duid) -> Self {
        Self { config, duid }
    }

    pub fn interface(&self) -> &str {
        &self.config.interface
    }

    /// Obtain a delegated prefix.
    ///
    /// Sends a rapid-commit SOLICIT. A server that answers with REPLY
    /// commits immediately; one that answers with ADVERTISE gets a REQUEST
    /// echoing its server id and IA_PD.
    pub async fn acquire(&self) -> Result<DelegatedPrefix, DhcpError> {
        let socket = bind_socket(&self.config.interface)?;
        let scope = interface_index(&self.config.interface)?;
        let dest = SocketAddr::V6(SocketAddrV6::new(
            ALL_DHCP_RELAY_AGENTS_AND_SERVERS,
            SERVER_PORT,
            0,
            scope,
        ));

        let started = Instant::now();
        let xid: [u8; 3] = rand::rng().random();
        let solicit = self.solicit(xid, started);

        let packet = transport::exchange(
            &socket,
            &solicit.encode(),
            dest,
            self.config.retransmit,
            self.config.debug,
            "DHCPv6 SOLICIT",
            |p| accepts(p, xid, &[MessageType::Advertise, MessageType::Reply]),
        )
        .await?;
        let response = Message::decode(&packet)?;

        let reply = match response.msg_type {
            MessageType::Reply => response,
            _ => {
                info!(
                    interface = %self.config.interface,
                    "Server did not commit rapidly, sending REQUEST"
                );
                let request = self.request(&response, started)?;
                let packet = transport::exchange(
                    &socket,
                    &request.encode(),
                    dest,
                    self.config.retransmit,
                    self.config.debug,
                    "DHCPv6 REQUEST",
                    |p| accepts(p, request.transaction_id, &[MessageType::Reply]),
                )
                .await?;
                Message::decode(&packet)?
            }
        };

        let delegated = process_reply(&reply)?;
        info!(
            interface = %self.config.interface,
            prefix = %delegated.block.prefix,
            gateway = %delegated.block.gateway,
            preferred_secs = delegated.block.preferred_lifetime.as_secs(),
            valid_secs = delegated.block.valid_lifetime.as_secs(),
            "Acquired delegated prefix"
        );
        Ok(delegated)
    }

    fn solicit(&self, xid: [u8; 3], started: Instant) -> Message {
        let mut msg = Message::new(MessageType::Solicit, xid);
        msg.push(option::CLIENT_ID, self.duid.encode())
            .push(option::ELAPSED_TIME, elapsed_time(started))
            .push(option::RAPID_COMMIT, Bytes::new())
            .push(option::IA_PD, IaPd::request(IAID).encode())
            .push(
                option::ORO,
                codec::encode_oro(&[option::DNS_SERVERS, option::DOMAIN_LIST]),
            );
        msg
    }

    fn request(&self, advertise: &Message, started: Instant) -> Result<Message, DhcpError> {
        let server_id = advertise
            .option(option::SERVER_ID)
            .ok_or_else(|| DhcpError::Malformed("ADVERTISE without server id".to_string()))?;
        check_status(advertise)?;
        let ia_pd = advertise.option(option::IA_PD).ok_or(DhcpError::NoIaPd)?;

        let xid: [u8; 3] = rand::rng().random();
        let mut msg = Message::new(MessageType::Request, xid);
        msg.push(option::CLIENT_ID, self.duid.encode())
            .push(option::SERVER_ID, server_id.clone())
            .push(option::ELAPSED_TIME, elapsed_time(started))
            .push(option::IA_PD, ia_pd.clone())
            .push(
                option::ORO,
                codec::encode_oro(&[option::DNS_SERVERS, option::DOMAIN_LIST]),
            );
        Ok(msg)
    }
}

/// Turn a REPLY into a delegated prefix.
///
/// The first prefix with a non-zero valid lifetime wins. Its length must be
/// within the delegated range; the gateway is the first host.
pub fn process_reply(reply: &Message) -> Result<DelegatedPrefix, DhcpError> {
    check_status(reply)?;

    let ia_pd = IaPd::decode(reply.option(option::IA_PD).ok_or(DhcpError::NoIaPd)?)?;
    if let Some(ia_status) = &ia_pd.status {
        if ia_status.code == status::NO_PREFIX_AVAIL {
            return Err(DhcpError::NoPrefixAvailable);
        }
        if !ia_status.is_success() {
            return Err(DhcpError::Status {
                code: ia_status.code,
                message: ia_status.message.clone(),
            });
        }
    }

    let Some(offered) = ia_pd
        .prefixes
        .iter()
        .find(|p| p.valid_lifetime > 0 && !p.prefix.is_unspecified())
    else {
        return Err(DhcpError::NoPrefixes);
    };

    if ia_pd.prefixes.len() > 1 {
        debug!(
            count = ia_pd.prefixes.len(),
            "Server offered several prefixes, using the first valid one"
        );
    }

    let prefix = Ipv6Prefix::new(offered.prefix, offered.prefix_len)?;
    prefix.validate_delegated()?;

    let block = Ipv6Block::with_first_host_gateway(prefix)?.with_lifetimes(
        Duration::from_secs(u64::from(offered.preferred_lifetime)),
        Duration::from_secs(u64::from(offered.valid_lifetime)),
    );

    let servers = reply
        .option(option::DNS_SERVERS)
        .map(|data| codec::decode_dns_servers(data))
        .unwrap_or_default()
        .into_iter()
        .map(IpAddr::V6)
        .collect();
    let search = match reply.option(option::DOMAIN_LIST) {
        Some(data) => codec::decode_domain_list(data).unwrap_or_else(|e| {
            warn!(error = %e, "Ignoring malformed domain search list");
            Vec::new()
        }),
        None => Vec::new(),
    };

    Ok(DelegatedPrefix {
        block,
        dns: DnsConfig { servers, search },
        t1: Duration::from_secs(u64::from(ia_pd.t1)),
        t2: Duration::from_secs(u64::from(ia_pd.t2)),
    })
}

fn check_status(msg: &Message) -> Result<(), DhcpError> {
    if let Some(data) = msg.option(option::STATUS_CODE) {
        let top = StatusCode::decode(data)?;
        if top.code == status::NO_PREFIX_AVAIL {
            return Err(DhcpError::NoPrefixAvailable);
        }
        if !top.is_success() {
            return Err(DhcpError::Status {
                code: top.code,
                message: top.message,
            });
        }
    }
    Ok(())
}

fn accepts(packet: &[u8], xid: [u8; 3], types: &[MessageType]) -> bool {
    match Message::decode(packet) {
        Ok(msg) => msg.transaction_id == xid && types.contains(&msg.msg_type),
        Err(e) => {
            debug!(error = %e, "Dropping undecodable DHCPv6 packet");
            false
        }
    }
}

/// Elapsed time in hundredths of a second, saturating at 0xffff.
fn elapsed_time(started: Instant) -> Bytes {
    let centis = (started.elapsed().as_millis() / 10).min(0xffff) as u16;
    Bytes::copy_from_slice(&centis.to_be_bytes())
}

fn bind_socket(interface: &str) -> Result<UdpSocket, DhcpError> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(true)?;
    socket.set_reuse_address(true)?;
    socket.bind_device(Some(interface.as_bytes()))?;
    let bind = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, CLIENT_PORT, 0, 0));
    socket.bind(&bind.into())?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v6::codec::IaPrefix;

    fn reply_with(ia: IaPd) -> Message {
        let mut msg = Message::new(MessageType::Reply, [1, 2, 3]);
        msg.push(option::SERVER_ID, Bytes::from_static(&[0, 3, 0, 1, 1, 2, 3, 4, 5, 6]))
            .push(option::IA_PD, ia.encode());
        msg
    }

    fn prefix(addr: &str, len: u8, valid: u32) -> IaPrefix {
        IaPrefix {
            preferred_lifetime: valid / 2,
            valid_lifetime: valid,
            prefix_len: len,
            prefix: addr.parse().unwrap(),
        }
    }

    #[test]
    fn test_reply_yields_first_host_gateway() {
        let mut ia = IaPd::request(IAID);
        ia.prefixes.push(prefix("2001:db8:0:100::", 56, 7200));
        let mut reply = reply_with(ia);
        reply.push(
            option::DNS_SERVERS,
            codec::encode_dns_servers(&["2001:db8::53".parse().unwrap()]),
        );
        reply.push(
            option::DOMAIN_LIST,
            codec::encode_domain_list(&["example.net".to_string()]),
        );

        let delegated = process_reply(&reply).unwrap();
        assert_eq!(delegated.block.prefix.to_string(), "2001:db8:0:100::/56");
        assert_eq!(
            delegated.block.gateway,
            "2001:db8:0:100::1".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(delegated.block.preferred_lifetime, Duration::from_secs(3600));
        assert_eq!(delegated.block.valid_lifetime, Duration::from_secs(7200));
        assert_eq!(
            delegated.dns.servers,
            vec![IpAddr::V6("2001:db8::53".parse().unwrap())]
        );
        assert_eq!(delegated.dns.search, vec!["example.net".to_string()]);
    }

    #[test]
    fn test_skips_expired_prefix() {
        let mut ia = IaPd::request(IAID);
        ia.prefixes.push(prefix("2001:db8:1::", 64, 0));
        ia.prefixes.push(prefix("2001:db8:2::", 64, 600));
        let delegated = process_reply(&reply_with(ia)).unwrap();
        assert_eq!(delegated.block.prefix.to_string(), "2001:db8:2::/64");
    }

    #[test]
    fn test_missing_ia_pd() {
        let msg = Message::new(MessageType::Reply, [1, 2, 3]);
        let err = process_reply(&msg).unwrap_err();
        assert!(matches!(err, DhcpError::NoIaPd));
        assert_eq!(err.to_string(), "No option IA PD found");
    }

    #[test]
    fn test_no_prefix_available() {
        let mut ia = IaPd::request(IAID);
        ia.status = Some(StatusCode {
            code: status::NO_PREFIX_AVAIL,
            message: "pool exhausted".to_string(),
        });
        let err = process_reply(&reply_with(ia)).unwrap_err();
        assert_eq!(err.to_string(), "No prefix available for delegation");
    }

    #[test]
    fn test_other_status_carries_message() {
        let mut reply = reply_with(IaPd::request(IAID));
        reply.push(
            option::STATUS_CODE,
            StatusCode {
                code: 1,
                message: "unspecified failure".to_string(),
            }
            .encode(),
        );
        match process_reply(&reply).unwrap_err() {
            DhcpError::Status { code, message } => {
                assert_eq!(code, 1);
                assert_eq!(message, "unspecified failure");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_ia_pd() {
        let err = process_reply(&reply_with(IaPd::request(IAID))).unwrap_err();
        assert!(matches!(err, DhcpError::NoPrefixes));
    }

    #[test]
    fn test_prefix_length_policy() {
        let mut ia = IaPd::request(IAID);
        ia.prefixes.push(prefix("2001:db8::", 40, 7200));
        assert!(matches!(
            process_reply(&reply_with(ia)).unwrap_err(),
            DhcpError::Policy(_)
        ));

        let mut ia = IaPd::request(IAID);
        ia.prefixes.push(prefix("2001:db8::", 112, 7200));
        assert!(matches!(
            process_reply(&reply_with(ia)).unwrap_err(),
            DhcpError::Policy(_)
        ));
    }

    #[test]
    fn test_solicit_contents() {
        let client = Dhcp6Client::with_duid(Dhcp6Config::new("eth0"), Duid::shared());
        let msg = client.solicit([9, 9, 9], Instant::now());
        assert_eq!(msg.msg_type, MessageType::Solicit);
        assert!(msg.option(option::RAPID_COMMIT).is_some());
        assert_eq!(
            msg.option(option::CLIENT_ID).unwrap(),
            &Duid::shared().encode()
        );
        let ia = IaPd::decode(msg.option(option::IA_PD).unwrap()).unwrap();
        assert_eq!(ia.iaid, IAID);
        assert!(ia.prefixes.is_empty());
    }

    #[test]
    fn test_request_echoes_advertise() {
        let client = Dhcp6Client::with_duid(Dhcp6Config::new("eth0"), Duid::shared());
        let mut ia = IaPd::request(IAID);
        ia.prefixes.push(prefix("2001:db8:5::", 64, 600));
        let mut advertise = reply_with(ia.clone());
        advertise.msg_type = MessageType::Advertise;

        let request = client.request(&advertise, Instant::now()).unwrap();
        assert_eq!(request.msg_type, MessageType::Request);
        assert_eq!(
            request.option(option::SERVER_ID),
            advertise.option(option::SERVER_ID)
        );
        assert_eq!(
            IaPd::decode(request.option(option::IA_PD).unwrap()).unwrap(),
            ia
        );
    }

    #[test]
    fn test_accepts_matches_transaction() {
        let reply = reply_with(IaPd::request(IAID)).encode();
        assert!(accepts(&reply, [1, 2, 3], &[MessageType::Reply]));
        assert!(!accepts(&reply, [3, 2, 1], &[MessageType::Reply]));
        assert!(!accepts(&reply, [1, 2, 3], &[MessageType::Advertise]));
        assert!(!accepts(&[0xff], [1, 2, 3], &[MessageType::Reply]));
    }
}
