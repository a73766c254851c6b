use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::TypeError;

/// Fixed size of every onion packet on the wire.
pub const PACKET_LEN: usize = 1 << 15;

// Routing-type number space, 16-bit big-endian on the wire.
pub const DROP_TYPE: u16 = 0x0000;
pub const FWD_TYPE: u16 = 0x0001;
pub const SWAP_FWD_TYPE: u16 = 0x0002;
/// Numerically first exit type; everything at or above goes to a module.
pub const MIN_EXIT_TYPE: u16 = 0x0100;
pub const SMTP_TYPE: u16 = 0x0100;
pub const MBOX_TYPE: u16 = 0x0101;

/// An onion packet: an opaque fixed-size blob. Only the packet handler looks
/// inside.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet(#[serde(with = "serde_bytes")] Vec<u8>);

impl Packet {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, TypeError> {
        if bytes.len() != PACKET_LEN {
            return Err(TypeError::BadPacketLength(bytes.len()));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet(")?;
        for byte in self.0.iter().take(4) {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ".., {} bytes)", self.0.len())
    }
}

/// Where to send a forwarded packet. Equality over all three fields defines
/// the per-peer batching bucket in the outgoing queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayEndpoint {
    pub ip: IpAddr,
    pub port: u16,
    pub key_fingerprint: [u8; 32],
}

impl fmt::Display for RelayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Result of unwrapping one onion layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoutingDecision {
    /// Forward the inner packet to the next hop.
    Relay { peer: RelayEndpoint, inner: Packet },
    /// The packet leaves the mix network through a delivery module.
    Exit {
        exit_type: u16,
        #[serde(with = "serde_bytes")]
        exit_info: Vec<u8>,
        #[serde(with = "serde_bytes")]
        app_key: Vec<u8>,
        tag: Option<serde_bytes::ByteBuf>,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    /// Padding; discard silently.
    Drop,
}

/// Delivery state attached to an exit message while it waits in a module
/// queue, replacing the original's sentinel tag strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryTag {
    /// Payload decoded to cleartext (a forward message).
    Clear,
    /// Payload is still encrypted: a reply or an encrypted forward. The tag
    /// is the recipient's decoding handle.
    Encrypted(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Payload failed integrity checks; modules may present a sentinel.
    Corrupt,
}

/// Address of an entry in a module's delivery queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitAddress {
    pub exit_type: u16,
    #[serde(with = "serde_bytes")]
    pub exit_info: Vec<u8>,
    pub tag: DeliveryTag,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_length_enforced() {
        assert!(Packet::from_bytes(vec![0; PACKET_LEN]).is_ok());
        assert!(matches!(
            Packet::from_bytes(vec![0; 100]),
            Err(TypeError::BadPacketLength(100))
        ));
    }

    #[test]
    fn exit_type_space() {
        assert!(SMTP_TYPE >= MIN_EXIT_TYPE);
        assert!(MBOX_TYPE >= MIN_EXIT_TYPE);
        assert!(DROP_TYPE < MIN_EXIT_TYPE);
        assert!(FWD_TYPE < MIN_EXIT_TYPE);
        assert!(SWAP_FWD_TYPE < MIN_EXIT_TYPE);
    }

    #[test]
    fn endpoint_equality_is_the_batching_bucket() {
        let a = RelayEndpoint {
            ip: "127.0.0.1".parse().expect("ip"),
            port: 48099,
            key_fingerprint: [7; 32],
        };
        let mut b = a.clone();
        assert_eq!(a, b);
        b.key_fingerprint[0] = 8;
        assert_ne!(a, b, "differing fingerprints must not share a bucket");
    }

    #[test]
    fn decision_roundtrips_through_msgpack() {
        let decision = RoutingDecision::Exit {
            exit_type: MBOX_TYPE,
            exit_info: b"alice".to_vec(),
            app_key: vec![1, 2, 3],
            tag: Some(serde_bytes::ByteBuf::from(vec![9; 20])),
            payload: b"hello".to_vec(),
        };
        let bytes = rmp_serde::to_vec(&decision).expect("encode");
        let back: RoutingDecision = rmp_serde::from_slice(&bytes).expect("decode");
        assert_eq!(back, decision);
    }

    #[test]
    fn exit_address_roundtrips_through_msgpack() {
        let addr = ExitAddress {
            exit_type: SMTP_TYPE,
            exit_info: b"bob@example.com".to_vec(),
            tag: DeliveryTag::Encrypted(vec![4; 20]),
        };
        let bytes = rmp_serde::to_vec(&addr).expect("encode");
        let back: ExitAddress = rmp_serde::from_slice(&bytes).expect("decode");
        assert_eq!(back, addr);
    }
}
