//! BOOTP/DHCPv4 message encoding (RFC 2131, RFC 2132).

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::dns;
use crate::DhcpError;

/// DHCP magic cookie.
pub const MAGIC_COOKIE: u32 = 0x6382_5363;

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;
const HTYPE_ETHERNET: u8 = 1;
const BROADCAST_FLAG: u16 = 0x8000;

/// Fixed BOOTP header length up to and including the magic cookie.
const HEADER_LEN: usize = 240;
/// Some relays drop BOOTP messages shorter than this.
const MIN_MESSAGE_LEN: usize = 300;

/// DHCP message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = DhcpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(DhcpError::Malformed(format!(
                "unknown DHCPv4 message type {}",
                other
            ))),
        }
    }
}

/// DHCP option codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DhcpOption {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    Hostname = 12,
    DomainName = 15,
    RequestedIp = 50,
    LeaseTime = 51,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequest = 55,
    Message = 56,
    ClientIdentifier = 61,
    DomainSearch = 119,
    End = 255,
}

/// Parameters requested from the server.
pub const PARAMETER_REQUEST_LIST: [u8; 6] = [
    DhcpOption::SubnetMask as u8,
    DhcpOption::Router as u8,
    DhcpOption::DnsServer as u8,
    DhcpOption::DomainName as u8,
    DhcpOption::LeaseTime as u8,
    DhcpOption::DomainSearch as u8,
];

/// A decoded or to-be-encoded DHCPv4 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub op: u8,
    pub xid: u32,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 6],
    pub options: Vec<(u8, Bytes)>,
}

impl Message {
    /// Client request with the broadcast flag set and the message type option.
    pub fn request(msg_type: MessageType, xid: u32, chaddr: [u8; 6]) -> Self {
        let mut msg = Self {
            op: BOOTREQUEST,
            xid,
            flags: BROADCAST_FLAG,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            options: Vec::new(),
        };
        msg.push(DhcpOption::MessageType, [msg_type as u8].to_vec());
        msg
    }

    /// Server reply skeleton.
    pub fn reply(msg_type: MessageType, xid: u32, chaddr: [u8; 6], yiaddr: Ipv4Addr) -> Self {
        let mut msg = Self::request(msg_type, xid, chaddr);
        msg.op = BOOTREPLY;
        msg.yiaddr = yiaddr;
        msg
    }

    pub fn push(&mut self, code: DhcpOption, data: impl Into<Bytes>) -> &mut Self {
        self.options.push((code as u8, data.into()));
        self
    }

    pub fn option(&self, code: DhcpOption) -> Option<&Bytes> {
        self.options
            .iter()
            .find(|(c, _)| *c == code as u8)
            .map(|(_, data)| data)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.option(DhcpOption::MessageType)
            .and_then(|data| data.first().copied())
            .and_then(|t| MessageType::try_from(t).ok())
    }

    pub fn is_reply(&self) -> bool {
        self.op == BOOTREPLY
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MIN_MESSAGE_LEN + 64);

        buf.put_u8(self.op);
        buf.put_u8(HTYPE_ETHERNET);
        buf.put_u8(6); // hlen
        buf.put_u8(0); // hops
        buf.put_u32(self.xid);
        buf.put_u16(0); // secs
        buf.put_u16(self.flags);
        buf.put_slice(&self.ciaddr.octets());
        buf.put_slice(&self.yiaddr.octets());
        buf.put_slice(&self.siaddr.octets());
        buf.put_slice(&self.giaddr.octets());
        buf.put_slice(&self.chaddr);
        buf.put_bytes(0, 10); // chaddr padding
        buf.put_bytes(0, 192); // sname + file
        buf.put_u32(MAGIC_COOKIE);

        for (code, data) in &self.options {
            // Options longer than 255 bytes would need RFC 3396 splitting;
            // nothing we send comes close.
            let len = data.len().min(255);
            buf.put_u8(*code);
            buf.put_u8(len as u8);
            buf.put_slice(&data[..len]);
        }
        buf.put_u8(DhcpOption::End as u8);

        if buf.len() < MIN_MESSAGE_LEN {
            let pad = MIN_MESSAGE_LEN - buf.len();
            buf.put_bytes(0, pad);
        }
        buf.freeze()
    }

    pub fn decode(packet: &[u8]) -> Result<Self, DhcpError> {
        if packet.len() < HEADER_LEN {
            return Err(DhcpError::Malformed(format!(
                "DHCPv4 message too short ({} bytes)",
                packet.len()
            )));
        }

        let mut buf = packet;
        let op = buf.get_u8();
        let htype = buf.get_u8();
        let hlen = buf.get_u8();
        buf.advance(1); // hops
        let xid = buf.get_u32();
        buf.advance(2); // secs
        let flags = buf.get_u16();
        let ciaddr = Ipv4Addr::from(buf.get_u32());
        let yiaddr = Ipv4Addr::from(buf.get_u32());
        let siaddr = Ipv4Addr::from(buf.get_u32());
        let giaddr = Ipv4Addr::from(buf.get_u32());

        if htype != HTYPE_ETHERNET || hlen != 6 {
            return Err(DhcpError::Malformed(format!(
                "unsupported hardware type {}/{}",
                htype, hlen
            )));
        }
        let mut chaddr = [0u8; 6];
        buf.copy_to_slice(&mut chaddr);
        buf.advance(10 + 192);

        if buf.get_u32() != MAGIC_COOKIE {
            return Err(DhcpError::Malformed("missing magic cookie".to_string()));
        }

        Ok(Self {
            op,
            xid,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            options: decode_options(buf)?,
        })
    }
}

fn decode_options(data: &[u8]) -> Result<Vec<(u8, Bytes)>, DhcpError> {
    let mut options = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let code = data[i];
        if code == DhcpOption::Pad as u8 {
            i += 1;
            continue;
        }
        if code == DhcpOption::End as u8 {
            break;
        }
        let len = *data
            .get(i + 1)
            .ok_or_else(|| DhcpError::Malformed(format!("option {} has no length", code)))?
            as usize;
        let value = data
            .get(i + 2..i + 2 + len)
            .ok_or_else(|| DhcpError::Malformed(format!("option {} truncated", code)))?;
        options.push((code, Bytes::copy_from_slice(value)));
        i += 2 + len;
    }
    Ok(options)
}

pub fn encode_addresses(addrs: &[Ipv4Addr]) -> Bytes {
    let mut buf = BytesMut::with_capacity(addrs.len() * 4);
    for addr in addrs {
        buf.put_slice(&addr.octets());
    }
    buf.freeze()
}

pub fn decode_addresses(data: &[u8]) -> Vec<Ipv4Addr> {
    data.chunks_exact(4)
        .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]))
        .collect()
}

pub fn decode_address(data: &[u8]) -> Option<Ipv4Addr> {
    decode_addresses(data).into_iter().next()
}

pub fn decode_u32(data: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

pub fn decode_search(data: &[u8]) -> Result<Vec<String>, DhcpError> {
    dns::decode_domain_list(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0x02, 0x42, 0xac, 0x11, 0x00, 0x02];

    #[test]
    fn test_request_layout() {
        let mut msg = Message::request(MessageType::Discover, 0xdead_beef, MAC);
        msg.push(DhcpOption::ClientIdentifier, b"ctnet-agent".to_vec());
        let encoded = msg.encode();

        assert_eq!(encoded.len(), MIN_MESSAGE_LEN);
        assert_eq!(encoded[0], BOOTREQUEST);
        assert_eq!(&encoded[4..8], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&encoded[10..12], &[0x80, 0x00]);
        assert_eq!(&encoded[28..34], &MAC);
        assert_eq!(&encoded[236..240], &[0x63, 0x82, 0x53, 0x63]);
        assert_eq!(&encoded[240..243], &[53, 1, 1]);
    }

    #[test]
    fn test_decode_reply_options() {
        let mut reply = Message::reply(MessageType::Ack, 7, MAC, Ipv4Addr::new(10, 0, 0, 20));
        reply
            .push(DhcpOption::SubnetMask, encode_addresses(&[Ipv4Addr::new(255, 255, 255, 0)]))
            .push(DhcpOption::Router, encode_addresses(&[Ipv4Addr::new(10, 0, 0, 1)]))
            .push(DhcpOption::LeaseTime, 600u32.to_be_bytes().to_vec());

        let decoded = Message::decode(&reply.encode()).unwrap();
        assert!(decoded.is_reply());
        assert_eq!(decoded.message_type(), Some(MessageType::Ack));
        assert_eq!(decoded.yiaddr, Ipv4Addr::new(10, 0, 0, 20));
        assert_eq!(
            decoded
                .option(DhcpOption::Router)
                .and_then(|d| decode_address(d)),
            Some(Ipv4Addr::new(10, 0, 0, 1))
        );
        assert_eq!(
            decoded.option(DhcpOption::LeaseTime).and_then(|d| decode_u32(d)),
            Some(600)
        );
    }

    #[test]
    fn test_pad_options_skipped() {
        let mut packet = Message::request(MessageType::Offer, 1, MAC).encode().to_vec();
        // Replace the End after the message type with Pad, Pad, End.
        packet[243] = 0;
        packet[244] = 0;
        packet[245] = 255;
        let decoded = Message::decode(&packet).unwrap();
        assert_eq!(decoded.options.len(), 1);
    }

    #[test]
    fn test_missing_cookie() {
        let mut packet = Message::request(MessageType::Discover, 1, MAC).encode().to_vec();
        packet[236] = 0;
        assert!(matches!(
            Message::decode(&packet),
            Err(DhcpError::Malformed(_))
        ));
    }

    #[test]
    fn test_truncated_option() {
        let mut packet = Message::request(MessageType::Discover, 1, MAC).encode().to_vec();
        packet.truncate(243);
        packet.push(DhcpOption::Router as u8);
        packet.push(8);
        packet.extend_from_slice(&[10, 0]);
        assert!(Message::decode(&packet).is_err());
    }
}
