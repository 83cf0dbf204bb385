//! DHCPv4 client exchanges against an in-process server on loopback.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use ctnet_dhcp::v4::codec::{self, DhcpOption, Message, MessageType};
use ctnet_dhcp::{Dhcp4Client, Dhcp4Endpoints, DhcpError, LeaseProvider, Retransmit};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

const OFFERED: Ipv4Addr = Ipv4Addr::new(10, 9, 0, 50);
const SERVER_ID: Ipv4Addr = Ipv4Addr::new(10, 9, 0, 2);
const MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];

/// Minimal server: offers `OFFERED`, acks requests for it, NAKs anything else
/// and reports every message it sees.
async fn spawn_server() -> (SocketAddr, mpsc::UnboundedReceiver<Message>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(msg) = Message::decode(&buf[..len]) else {
                continue;
            };
            let _ = tx.send(msg.clone());

            let reply = match msg.message_type() {
                Some(MessageType::Discover) => Some(lease_reply(MessageType::Offer, &msg)),
                Some(MessageType::Request) => {
                    let requested = msg
                        .option(DhcpOption::RequestedIp)
                        .and_then(|d| codec::decode_address(d));
                    if requested == Some(OFFERED) {
                        Some(lease_reply(MessageType::Ack, &msg))
                    } else {
                        let mut nak = Message::reply(
                            MessageType::Nak,
                            msg.xid,
                            msg.chaddr,
                            Ipv4Addr::UNSPECIFIED,
                        );
                        nak.push(DhcpOption::Message, b"wrong address".to_vec());
                        Some(nak)
                    }
                }
                _ => None,
            };

            if let Some(reply) = reply {
                socket.send_to(&reply.encode(), peer).await.unwrap();
            }
        }
    });

    (addr, rx)
}

fn lease_reply(msg_type: MessageType, request: &Message) -> Message {
    let mut reply = Message::reply(msg_type, request.xid, request.chaddr, OFFERED);
    reply
        .push(
            DhcpOption::SubnetMask,
            codec::encode_addresses(&[Ipv4Addr::new(255, 255, 0, 0)]),
        )
        .push(
            DhcpOption::Router,
            codec::encode_addresses(&[Ipv4Addr::new(10, 9, 0, 1)]),
        )
        .push(
            DhcpOption::ServerIdentifier,
            codec::encode_addresses(&[SERVER_ID]),
        )
        .push(DhcpOption::LeaseTime, 900u32.to_be_bytes().to_vec());
    reply
}

fn client(server: SocketAddr) -> Dhcp4Client {
    Dhcp4Client::new(false)
        .with_endpoints(Dhcp4Endpoints {
            bind: "127.0.0.1:0".parse().unwrap(),
            server,
            bind_to_device: false,
        })
        .with_hardware_address(MAC)
        .with_retransmit(Retransmit {
            attempts: 3,
            initial_timeout: Duration::from_millis(200),
            max_timeout: Duration::from_millis(400),
        })
}

fn types(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<MessageType> {
    let mut seen = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        if let Some(t) = msg.message_type() {
            seen.push(t);
        }
    }
    seen
}

#[tokio::test]
async fn test_discover_request_ack() {
    let (server, mut rx) = spawn_server().await;
    let client = client(server);

    let lease = client
        .request("lo", b"container-1", "web", None)
        .await
        .unwrap();

    assert_eq!(lease.address, OFFERED);
    assert_eq!(lease.gateway(), Some(Ipv4Addr::new(10, 9, 0, 1)));
    assert_eq!(lease.server_id, Some(SERVER_ID));
    assert_eq!(lease.ttl(), Duration::from_secs(900));
    assert_eq!(
        lease.to_block().unwrap().prefix.to_string(),
        "10.9.0.0/16"
    );

    assert_eq!(
        types(&mut rx),
        vec![MessageType::Discover, MessageType::Request]
    );
}

#[tokio::test]
async fn test_request_carries_client_id_and_hostname() {
    let (server, mut rx) = spawn_server().await;
    let client = client(server);

    client
        .request("lo", b"container-2", "db", None)
        .await
        .unwrap();

    let discover = rx.recv().await.unwrap();
    assert_eq!(
        discover.option(DhcpOption::ClientIdentifier).unwrap().as_ref(),
        b"container-2"
    );
    assert_eq!(
        discover.option(DhcpOption::Hostname).unwrap().as_ref(),
        b"db"
    );
    assert_eq!(discover.chaddr, MAC);
}

#[tokio::test]
async fn test_nak_on_preferred_address_falls_back_to_discover() {
    let (server, mut rx) = spawn_server().await;
    let client = client(server);

    let lease = client
        .request("lo", b"container-3", "web", Some(Ipv4Addr::new(10, 9, 0, 77)))
        .await
        .unwrap();
    assert_eq!(lease.address, OFFERED);

    assert_eq!(
        types(&mut rx),
        vec![
            MessageType::Request,
            MessageType::Discover,
            MessageType::Request
        ]
    );
}

#[tokio::test]
async fn test_renew_in_place() {
    let (server, mut rx) = spawn_server().await;
    let client = client(server);

    let lease = client
        .request("lo", b"container-4", "web", Some(OFFERED))
        .await
        .unwrap();
    assert_eq!(lease.address, OFFERED);
    assert_eq!(types(&mut rx), vec![MessageType::Request]);
}

#[tokio::test]
async fn test_release_sends_ciaddr() {
    let (server, mut rx) = spawn_server().await;
    let client = client(server);

    let lease = client.request("lo", b"c5", "web", None).await.unwrap();
    client.release("lo", b"c5", &lease).await.unwrap();

    let release = loop {
        let msg = rx.recv().await.unwrap();
        if msg.message_type() == Some(MessageType::Release) {
            break msg;
        }
    };
    assert_eq!(release.ciaddr, OFFERED);
    assert_eq!(
        release
            .option(DhcpOption::ServerIdentifier)
            .and_then(|d| codec::decode_address(d)),
        Some(SERVER_ID)
    );
}

#[tokio::test]
async fn test_silent_server_times_out() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client = client(silent.local_addr().unwrap());

    let err = client.discover("lo", b"c6").await.unwrap_err();
    assert!(matches!(err, DhcpError::Timeout { attempts: 3, .. }));
}
