use bytes::{BufMut, Bytes, BytesMut};

/// Identity association id used for the single IA_PD we request.
pub const IAID: [u8; 4] = [76, 61, 73, 74];

const DUID_LL: u16 = 3;
const DUID_UUID: u16 = 4;
const HW_TYPE_ETHERNET: u16 = 1;

/// UUID used when several hosts must present the same client identity.
const SHARED_UUID: [u8; 16] = [
    76, 61, 73, 74, 76, 61, 73, 74, 76, 61, 73, 74, 76, 61, 73, 74,
];

/// DHCP unique identifier presented in the ClientID option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Duid {
    /// DUID-LL derived from the interface's hardware address.
    LinkLayer { hw_type: u16, address: Vec<u8> },
    /// DUID-UUID.
    Uuid([u8; 16]),
}

impl Duid {
    pub fn link_layer(mac: [u8; 6]) -> Self {
        Duid::LinkLayer {
            hw_type: HW_TYPE_ETHERNET,
            address: mac.to_vec(),
        }
    }

    /// Fixed identity shared by every host that opts into it.
    pub fn shared() -> Self {
        Duid::Uuid(SHARED_UUID)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Duid::LinkLayer { hw_type, address } => {
                buf.put_u16(DUID_LL);
                buf.put_u16(*hw_type);
                buf.put_slice(address);
            }
            Duid::Uuid(uuid) => {
                buf.put_u16(DUID_UUID);
                buf.put_slice(uuid);
            }
        }
        buf.freeze()
    }
}
