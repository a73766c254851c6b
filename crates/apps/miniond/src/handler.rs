use minion_keys::ServerKeyset;
use minion_queue::{HashLog, QueueError};
use minion_types::{
    Packet, RelayEndpoint, RoutingDecision, DROP_TYPE, FWD_TYPE, MIN_EXIT_TYPE, PACKET_LEN,
    SWAP_FWD_TYPE,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors raised by the layer-unwrap collaborator.
#[derive(Debug, Error)]
pub enum LayerError {
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("content error: {0}")]
    Content(String),
}

/// Removes one onion layer from a packet. The cryptographic transform lives
/// outside the core; implementations hand back the routing decision carried
/// by the layer addressed to this server's packet key.
pub trait OnionLayer {
    fn unwrap(&self, packet: &Packet) -> Result<Option<RoutingDecision>, LayerError>;
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("replayed packet")]
    Replay,
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("content error: {0}")]
    Content(String),
    #[error(transparent)]
    Log(#[from] QueueError),
}

impl From<LayerError> for ProcessError {
    fn from(err: LayerError) -> Self {
        match err {
            LayerError::Crypto(e) => Self::Crypto(e),
            LayerError::Parse(e) => Self::Parse(e),
            LayerError::Content(e) => Self::Content(e),
        }
    }
}

/// Applies the live key's unwrap capability to incoming packets, rejecting
/// replays against the keyset's hash log.
pub struct PacketHandler {
    layer: Box<dyn OnionLayer>,
    hash_log: HashLog,
}

impl PacketHandler {
    pub fn new(layer: Box<dyn OnionLayer>, hash_log: HashLog) -> Self {
        Self { layer, hash_log }
    }

    /// Process one packet. `Ok(None)` means padding to drop. The packet's
    /// digest is recorded in the hash log only after a successful unwrap, so
    /// a packet rejected for a transient reason can be retried.
    pub fn process(&mut self, packet: &Packet) -> Result<Option<RoutingDecision>, ProcessError> {
        let digest: [u8; 32] = Sha256::digest(packet.as_bytes()).into();
        if self.hash_log.contains(&digest) {
            return Err(ProcessError::Replay);
        }
        let decision = self.layer.unwrap(packet)?;
        self.hash_log.add(digest)?;
        Ok(decision)
    }

    /// Durably flush the replay log. The server loop calls this after each
    /// mix interval and before acting on the mix output.
    pub fn sync_log(&mut self) -> Result<(), QueueError> {
        self.hash_log.sync()
    }

    pub fn close(self) -> Result<(), QueueError> {
        self.hash_log.close()
    }
}

/// Identifier binding a packet layer to a server packet key.
pub fn packet_key_id(public: &x25519_dalek::PublicKey) -> [u8; 32] {
    Sha256::digest(public.to_bytes()).into()
}

pub const KEY_ID_LEN: usize = 32;
const TYPE_OFFSET: usize = KEY_ID_LEN;
const BODY_LEN_OFFSET: usize = TYPE_OFFSET + 2;
const BODY_OFFSET: usize = BODY_LEN_OFFSET + 4;

#[derive(Serialize, Deserialize)]
struct RelayFrame {
    peer: RelayEndpoint,
    #[serde(with = "serde_bytes")]
    inner: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct ExitFrame {
    #[serde(with = "serde_bytes")]
    exit_info: Vec<u8>,
    #[serde(with = "serde_bytes")]
    app_key: Vec<u8>,
    tag: Option<serde_bytes::ByteBuf>,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

/// Parses the cleartext framing of a layer addressed to this server: a key
/// id binding the layer to our packet key, a 16-bit routing type, and a
/// length-prefixed routing body. The decryption that exposes this framing is
/// the external collaborator's job.
pub struct FramedOnionLayer {
    key_id: [u8; 32],
}

impl FramedOnionLayer {
    pub fn new(keyset: &ServerKeyset) -> Self {
        Self { key_id: packet_key_id(&x25519_dalek::PublicKey::from(&keyset.packet_key)) }
    }

    #[cfg(test)]
    fn for_key_id(key_id: [u8; 32]) -> Self {
        Self { key_id }
    }
}

impl OnionLayer for FramedOnionLayer {
    fn unwrap(&self, packet: &Packet) -> Result<Option<RoutingDecision>, LayerError> {
        let bytes = packet.as_bytes();
        if bytes[..KEY_ID_LEN] != self.key_id {
            return Err(LayerError::Crypto("misencrypted packet header".into()));
        }

        let routing_type = u16::from_be_bytes([bytes[TYPE_OFFSET], bytes[TYPE_OFFSET + 1]]);
        let body_len = u32::from_be_bytes(
            bytes[BODY_LEN_OFFSET..BODY_OFFSET].try_into().unwrap_or([0; 4]),
        ) as usize;
        if BODY_OFFSET + body_len > PACKET_LEN {
            return Err(LayerError::Parse(format!("routing body length {body_len} overruns")));
        }
        let body = &bytes[BODY_OFFSET..BODY_OFFSET + body_len];

        match routing_type {
            DROP_TYPE => Ok(None),
            FWD_TYPE | SWAP_FWD_TYPE => {
                let frame: RelayFrame = rmp_serde::from_slice(body)
                    .map_err(|e| LayerError::Parse(format!("relay frame: {e}")))?;
                if frame.inner.len() > PACKET_LEN {
                    return Err(LayerError::Content("inner packet too large".into()));
                }
                // The layer transform re-pads the forwarded packet to the
                // fixed wire size.
                let mut inner = frame.inner;
                inner.resize(PACKET_LEN, 0);
                let inner = Packet::from_bytes(inner)
                    .map_err(|e| LayerError::Content(e.to_string()))?;
                Ok(Some(RoutingDecision::Relay { peer: frame.peer, inner }))
            }
            t if t >= MIN_EXIT_TYPE => {
                let frame: ExitFrame = rmp_serde::from_slice(body)
                    .map_err(|e| LayerError::Parse(format!("exit frame: {e}")))?;
                Ok(Some(RoutingDecision::Exit {
                    exit_type: t,
                    exit_info: frame.exit_info,
                    app_key: frame.app_key,
                    tag: frame.tag,
                    payload: frame.payload,
                }))
            }
            t => Err(LayerError::Content(format!("unrecognized routing type {t:#06x}"))),
        }
    }
}

fn frame(key_id: &[u8; 32], routing_type: u16, body: &[u8]) -> Packet {
    let mut bytes = Vec::with_capacity(PACKET_LEN);
    bytes.extend_from_slice(key_id);
    bytes.extend_from_slice(&routing_type.to_be_bytes());
    bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
    bytes.extend_from_slice(body);
    bytes.resize(PACKET_LEN, 0);
    Packet::from_bytes(bytes).unwrap_or_else(|_| unreachable!("frame is sized to PACKET_LEN"))
}

/// Build a padding packet addressed to `key_id`.
pub fn build_drop_packet(key_id: &[u8; 32]) -> Packet {
    frame(key_id, DROP_TYPE, &[])
}

/// Build a forward packet addressed to `key_id`.
pub fn build_relay_packet(
    key_id: &[u8; 32],
    routing_type: u16,
    peer: &RelayEndpoint,
    inner: &[u8],
) -> Result<Packet, LayerError> {
    let body = rmp_serde::to_vec(&RelayFrame { peer: peer.clone(), inner: inner.to_vec() })
        .map_err(|e| LayerError::Parse(e.to_string()))?;
    if BODY_OFFSET + body.len() > PACKET_LEN {
        return Err(LayerError::Content("relay body too large".into()));
    }
    Ok(frame(key_id, routing_type, &body))
}

/// Build an exit packet addressed to `key_id`.
pub fn build_exit_packet(
    key_id: &[u8; 32],
    exit_type: u16,
    exit_info: &[u8],
    tag: Option<&[u8]>,
    payload: &[u8],
) -> Result<Packet, LayerError> {
    let body = rmp_serde::to_vec(&ExitFrame {
        exit_info: exit_info.to_vec(),
        app_key: Vec::new(),
        tag: tag.map(|t| serde_bytes::ByteBuf::from(t.to_vec())),
        payload: payload.to_vec(),
    })
    .map_err(|e| LayerError::Parse(e.to_string()))?;
    if BODY_OFFSET + body.len() > PACKET_LEN {
        return Err(LayerError::Content("exit body too large".into()));
    }
    Ok(frame(key_id, exit_type, &body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use minion_types::MBOX_TYPE;

    const KEY_ID: [u8; 32] = [0x42; 32];

    fn endpoint() -> RelayEndpoint {
        RelayEndpoint {
            ip: "127.0.0.1".parse().expect("ip"),
            port: 48_099,
            key_fingerprint: [9; 32],
        }
    }

    fn handler(dir: &std::path::Path) -> PacketHandler {
        let log = HashLog::open(dir.join("hash_test")).expect("hashlog");
        PacketHandler::new(Box::new(FramedOnionLayer::for_key_id(KEY_ID)), log)
    }

    #[test]
    fn drop_packet_processes_to_none() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut handler = handler(tmp.path());
        let packet = build_drop_packet(&KEY_ID);
        assert!(handler.process(&packet).expect("process").is_none());
    }

    #[test]
    fn relay_packet_processes_to_relay_decision() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut handler = handler(tmp.path());
        let packet =
            build_relay_packet(&KEY_ID, FWD_TYPE, &endpoint(), b"inner bytes").expect("build");
        match handler.process(&packet).expect("process") {
            Some(RoutingDecision::Relay { peer, inner }) => {
                assert_eq!(peer, endpoint());
                assert_eq!(inner.as_bytes().len(), PACKET_LEN);
                assert_eq!(&inner.as_bytes()[..11], b"inner bytes");
            }
            other => panic!("expected relay decision, got {other:?}"),
        }
    }

    #[test]
    fn exit_packet_carries_info_tag_payload() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut handler = handler(tmp.path());
        let packet =
            build_exit_packet(&KEY_ID, MBOX_TYPE, b"alice", Some(&[7; 20]), b"hello\n")
                .expect("build");
        match handler.process(&packet).expect("process") {
            Some(RoutingDecision::Exit { exit_type, exit_info, tag, payload, .. }) => {
                assert_eq!(exit_type, MBOX_TYPE);
                assert_eq!(exit_info, b"alice");
                assert_eq!(tag.as_deref().map(|t| t.to_vec()), Some(vec![7; 20]));
                assert_eq!(payload, b"hello\n");
            }
            other => panic!("expected exit decision, got {other:?}"),
        }
    }

    #[test]
    fn wrong_key_id_is_a_crypto_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut handler = handler(tmp.path());
        let packet = build_drop_packet(&[0xFF; 32]);
        assert!(matches!(handler.process(&packet), Err(ProcessError::Crypto(_))));
    }

    #[test]
    fn unknown_routing_type_is_a_content_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut handler = handler(tmp.path());
        let packet = frame(&KEY_ID, 0x0003, &[]);
        assert!(matches!(handler.process(&packet), Err(ProcessError::Content(_))));
    }

    #[test]
    fn garbage_body_is_a_parse_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut handler = handler(tmp.path());
        let packet = frame(&KEY_ID, FWD_TYPE, &[0xC1; 64]);
        assert!(matches!(handler.process(&packet), Err(ProcessError::Parse(_))));
    }

    #[test]
    fn second_submission_is_a_replay() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut handler = handler(tmp.path());
        let packet = build_drop_packet(&KEY_ID);
        handler.process(&packet).expect("first pass");
        handler.sync_log().expect("sync");
        assert!(matches!(handler.process(&packet), Err(ProcessError::Replay)));
    }

    #[test]
    fn failed_unwrap_does_not_burn_the_hash() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut handler = handler(tmp.path());
        let bad = frame(&KEY_ID, 0x0003, &[]);
        assert!(handler.process(&bad).is_err());
        // Same packet again: still a content error, not a replay.
        assert!(matches!(handler.process(&bad), Err(ProcessError::Content(_))));
    }
}
