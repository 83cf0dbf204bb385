//! DHCPv6 message and option encoding (RFC 8415).

use std::net::Ipv6Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::dns;
use crate::DhcpError;

/// DHCPv6 message types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Solicit = 1,
    Advertise = 2,
    Request = 3,
    Confirm = 4,
    Renew = 5,
    Rebind = 6,
    Reply = 7,
    Release = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = DhcpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Solicit),
            2 => Ok(MessageType::Advertise),
            3 => Ok(MessageType::Request),
            4 => Ok(MessageType::Confirm),
            5 => Ok(MessageType::Renew),
            6 => Ok(MessageType::Rebind),
            7 => Ok(MessageType::Reply),
            8 => Ok(MessageType::Release),
            other => Err(DhcpError::Malformed(format!(
                "unknown DHCPv6 message type {}",
                other
            ))),
        }
    }
}

/// Option codes used by the client.
pub mod option {
    pub const CLIENT_ID: u16 = 1;
    pub const SERVER_ID: u16 = 2;
    pub const ORO: u16 = 6;
    pub const ELAPSED_TIME: u16 = 8;
    pub const STATUS_CODE: u16 = 13;
    pub const RAPID_COMMIT: u16 = 14;
    pub const DNS_SERVERS: u16 = 23;
    pub const DOMAIN_LIST: u16 = 24;
    pub const IA_PD: u16 = 25;
    pub const IA_PREFIX: u16 = 26;
}

/// Status codes with dedicated handling.
pub mod status {
    pub const SUCCESS: u16 = 0;
    pub const NO_PREFIX_AVAIL: u16 = 6;
}

/// A DHCPv6 client/server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub transaction_id: [u8; 3],
    pub options: Vec<(u16, Bytes)>,
}

impl Message {
    pub fn new(msg_type: MessageType, transaction_id: [u8; 3]) -> Self {
        Self {
            msg_type,
            transaction_id,
            options: Vec::new(),
        }
    }

    pub fn push(&mut self, code: u16, data: impl Into<Bytes>) -> &mut Self {
        self.options.push((code, data.into()));
        self
    }

    /// First occurrence of `code`.
    pub fn option(&self, code: u16) -> Option<&Bytes> {
        self.options
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, data)| data)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u8(self.msg_type as u8);
        buf.put_slice(&self.transaction_id);
        for (code, data) in &self.options {
            put_option(&mut buf, *code, data);
        }
        buf.freeze()
    }

    pub fn decode(packet: &[u8]) -> Result<Self, DhcpError> {
        if packet.len() < 4 {
            return Err(DhcpError::Malformed(format!(
                "DHCPv6 message too short ({} bytes)",
                packet.len()
            )));
        }
        let msg_type = MessageType::try_from(packet[0])?;
        let transaction_id = [packet[1], packet[2], packet[3]];
        let options = decode_options(&packet[4..])?;
        Ok(Self {
            msg_type,
            transaction_id,
            options,
        })
    }
}

fn put_option(buf: &mut BytesMut, code: u16, data: &[u8]) {
    buf.put_u16(code);
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
}

/// Parse a sequence of TLV options.
pub fn decode_options(mut data: &[u8]) -> Result<Vec<(u16, Bytes)>, DhcpError> {
    let mut options = Vec::new();
    while data.has_remaining() {
        if data.remaining() < 4 {
            return Err(DhcpError::Malformed("truncated option header".to_string()));
        }
        let code = data.get_u16();
        let len = data.get_u16() as usize;
        if data.remaining() < len {
            return Err(DhcpError::Malformed(format!(
                "option {} claims {} bytes, {} left",
                code,
                len,
                data.remaining()
            )));
        }
        options.push((code, Bytes::copy_from_slice(&data[..len])));
        data.advance(len);
    }
    Ok(options)
}

/// Status Code option payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCode {
    pub code: u16,
    pub message: String,
}

impl StatusCode {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.message.len());
        buf.put_u16(self.code);
        buf.put_slice(self.message.as_bytes());
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, DhcpError> {
        if data.len() < 2 {
            return Err(DhcpError::Malformed("truncated status code".to_string()));
        }
        Ok(Self {
            code: u16::from_be_bytes([data[0], data[1]]),
            message: String::from_utf8_lossy(&data[2..]).into_owned(),
        })
    }

    pub fn is_success(&self) -> bool {
        self.code == status::SUCCESS
    }
}

/// IA Prefix option payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IaPrefix {
    pub preferred_lifetime: u32,
    pub valid_lifetime: u32,
    pub prefix_len: u8,
    pub prefix: Ipv6Addr,
}

impl IaPrefix {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(25);
        buf.put_u32(self.preferred_lifetime);
        buf.put_u32(self.valid_lifetime);
        buf.put_u8(self.prefix_len);
        buf.put_slice(&self.prefix.octets());
        buf.freeze()
    }
}

/// IA_PD option payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IaPd {
    pub iaid: [u8; 4],
    pub t1: u32,
    pub t2: u32,
    pub prefixes: Vec<IaPrefix>,
    pub status: Option<StatusCode>,
}

impl IaPd {
    /// Empty IA_PD asking the server to pick timers and prefix.
    pub fn request(iaid: [u8; 4]) -> Self {
        Self {
            iaid,
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12 + self.prefixes.len() * 29);
        buf.put_slice(&self.iaid);
        buf.put_u32(self.t1);
        buf.put_u32(self.t2);
        for prefix in &self.prefixes {
            put_option(&mut buf, option::IA_PREFIX, &prefix.encode());
        }
        if let Some(status) = &self.status {
            put_option(&mut buf, option::STATUS_CODE, &status.encode());
        }
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, DhcpError> {
        if data.len() < 12 {
            return Err(DhcpError::Malformed("truncated IA_PD".to_string()));
        }
        let mut buf = data;
        let mut iaid = [0u8; 4];
        buf.copy_to_slice(&mut iaid);
        let t1 = buf.get_u32();
        let t2 = buf.get_u32();

        let mut prefixes = Vec::new();
        let mut status = None;
        for (code, payload) in decode_options(buf)? {
            match code {
                option::IA_PREFIX => {
                    if payload.len() < 25 {
                        return Err(DhcpError::Malformed("truncated IAPREFIX".to_string()));
                    }
                    let mut p = payload.as_ref();
                    let preferred_lifetime = p.get_u32();
                    let valid_lifetime = p.get_u32();
                    let prefix_len = p.get_u8();
                    let mut octets = [0u8; 16];
                    p.copy_to_slice(&mut octets);
                    prefixes.push(IaPrefix {
                        preferred_lifetime,
                        valid_lifetime,
                        prefix_len,
                        prefix: Ipv6Addr::from(octets),
                    });
                }
                option::STATUS_CODE => status = Some(StatusCode::decode(&payload)?),
                _ => {}
            }
        }

        Ok(Self {
            iaid,
            t1,
            t2,
            prefixes,
            status,
        })
    }
}

/// Option Request Option payload.
pub fn encode_oro(codes: &[u16]) -> Bytes {
    let mut buf = BytesMut::with_capacity(codes.len() * 2);
    for code in codes {
        buf.put_u16(*code);
    }
    buf.freeze()
}

pub fn encode_dns_servers(servers: &[Ipv6Addr]) -> Bytes {
    let mut buf = BytesMut::with_capacity(servers.len() * 16);
    for server in servers {
        buf.put_slice(&server.octets());
    }
    buf.freeze()
}

pub fn decode_dns_servers(data: &[u8]) -> Vec<Ipv6Addr> {
    data.chunks_exact(16)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(chunk);
            Ipv6Addr::from(octets)
        })
        .collect()
}

pub fn encode_domain_list(names: &[String]) -> Bytes {
    dns::encode_domain_list(names).freeze()
}

pub fn decode_domain_list(data: &[u8]) -> Result<Vec<String>, DhcpError> {
    dns::decode_domain_list(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_layout() {
        let mut msg = Message::new(MessageType::Solicit, [0xaa, 0xbb, 0xcc]);
        msg.push(option::ELAPSED_TIME, Bytes::from_static(&[0, 0]));
        let encoded = msg.encode();
        assert_eq!(
            encoded.as_ref(),
            &[1, 0xaa, 0xbb, 0xcc, 0, 8, 0, 2, 0, 0]
        );
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_truncated_option_rejected() {
        let packet = [7, 1, 2, 3, 0, 25, 0, 40, 0, 0];
        assert!(matches!(
            Message::decode(&packet),
            Err(DhcpError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_message_type() {
        assert!(Message::decode(&[99, 1, 2, 3]).is_err());
    }

    #[test]
    fn test_ia_pd_with_prefix_and_status() {
        let ia = IaPd {
            iaid: [1, 2, 3, 4],
            t1: 1800,
            t2: 2880,
            prefixes: vec![IaPrefix {
                preferred_lifetime: 3600,
                valid_lifetime: 7200,
                prefix_len: 56,
                prefix: "2001:db8:0:100::".parse().unwrap(),
            }],
            status: Some(StatusCode {
                code: 0,
                message: "ok".to_string(),
            }),
        };
        let decoded = IaPd::decode(&ia.encode()).unwrap();
        assert_eq!(decoded, ia);
    }

    #[test]
    fn test_empty_ia_pd_request() {
        let encoded = IaPd::request([76, 61, 73, 74]).encode();
        assert_eq!(encoded.as_ref(), &[76, 61, 73, 74, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_dns_servers_ignore_trailing_bytes() {
        let mut data = encode_dns_servers(&["2001:db8::53".parse().unwrap()]).to_vec();
        data.push(0xff);
        assert_eq!(
            decode_dns_servers(&data),
            vec!["2001:db8::53".parse::<Ipv6Addr>().unwrap()]
        );
    }
}
