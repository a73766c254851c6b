//! Shared data model for the relay pipeline: the opaque onion packet, the
//! routing decisions produced by unwrapping one layer, the exit-type number
//! space, payload decoding, and the text escaping used by mail-facing exits.

mod decode;
mod escape;
mod packet;

pub use decode::{decode_payload, encode_payload, DecodedPayload, PAYLOAD_DIGEST_LEN};
pub use escape::{escape_message_for_email, is_printable};
pub use packet::{
    DeliveryTag, ExitAddress, Packet, RelayEndpoint, RoutingDecision, DROP_TYPE, FWD_TYPE,
    MBOX_TYPE, MIN_EXIT_TYPE, PACKET_LEN, SMTP_TYPE, SWAP_FWD_TYPE,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TypeError {
    #[error("packet must be exactly {PACKET_LEN} bytes, got {0}")]
    BadPacketLength(usize),
}
