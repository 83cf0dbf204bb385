//! RFC 1035 domain name lists, as carried by DHCPv6 option 24 and DHCPv4
//! option 119 (the latter may use compression pointers).

use bytes::{BufMut, BytesMut};

use crate::DhcpError;

const POINTER_MASK: u8 = 0xc0;
const MAX_POINTER_HOPS: usize = 16;

/// Decode a sequence of domain names.
pub(crate) fn decode_domain_list(data: &[u8]) -> Result<Vec<String>, DhcpError> {
    let mut names = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let (name, next) = decode_name(data, offset)?;
        if !name.is_empty() {
            names.push(name);
        }
        offset = next;
    }
    Ok(names)
}

/// Decode one name at `offset`; returns the name and the offset after it.
fn decode_name(data: &[u8], offset: usize) -> Result<(String, usize), DhcpError> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = offset;
    let mut end = None;
    let mut hops = 0;

    loop {
        let len = *data
            .get(pos)
            .ok_or_else(|| DhcpError::Malformed("truncated domain name".to_string()))?;

        if len == 0 {
            end.get_or_insert(pos + 1);
            break;
        }

        if len & POINTER_MASK == POINTER_MASK {
            let low = *data
                .get(pos + 1)
                .ok_or_else(|| DhcpError::Malformed("truncated name pointer".to_string()))?;
            end.get_or_insert(pos + 2);
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(DhcpError::Malformed("name pointer loop".to_string()));
            }
            pos = (((len & !POINTER_MASK) as usize) << 8) | low as usize;
            continue;
        }

        let start = pos + 1;
        let stop = start + len as usize;
        let label = data
            .get(start..stop)
            .ok_or_else(|| DhcpError::Malformed("truncated label".to_string()))?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        pos = stop;
    }

    Ok((labels.join("."), end.unwrap_or(pos + 1)))
}

/// Encode names without compression.
pub(crate) fn encode_domain_list(names: &[String]) -> BytesMut {
    let mut buf = BytesMut::new();
    for name in names {
        for label in name.split('.').filter(|l| !l.is_empty()) {
            buf.put_u8(label.len() as u8);
            buf.put_slice(label.as_bytes());
        }
        buf.put_u8(0);
    }
    buf
}
