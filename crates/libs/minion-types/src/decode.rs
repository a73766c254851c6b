use sha2::{Digest, Sha256};

pub const PAYLOAD_DIGEST_LEN: usize = 32;

/// Outcome of attempting to decode an exit payload. The three cases drive
/// which tag a message carries into its module's delivery queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedPayload {
    /// Integrity check passed; the cleartext body.
    Plain(Vec<u8>),
    /// The payload did not decode but a decoding handle is present: an
    /// encrypted reply or a forward encrypted to the recipient.
    StillEncrypted,
    /// No handle and no valid cleartext.
    Corrupt,
}

/// Decode an exit payload: a SHA-256 digest of the body followed by the body.
/// `tag` is the decoding handle carried alongside the message, if any.
pub fn decode_payload(payload: &[u8], tag: Option<&[u8]>) -> DecodedPayload {
    if payload.len() >= PAYLOAD_DIGEST_LEN {
        let (digest, body) = payload.split_at(PAYLOAD_DIGEST_LEN);
        if Sha256::digest(body).as_slice() == digest {
            return DecodedPayload::Plain(body.to_vec());
        }
    }
    if tag.is_some() {
        DecodedPayload::StillEncrypted
    } else {
        DecodedPayload::Corrupt
    }
}

/// Frame a cleartext body as a decodable payload.
pub fn encode_payload(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PAYLOAD_DIGEST_LEN + body.len());
    out.extend_from_slice(&Sha256::digest(body));
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_payload_decodes_to_plain() {
        let payload = encode_payload(b"hello\n");
        assert_eq!(decode_payload(&payload, None), DecodedPayload::Plain(b"hello\n".to_vec()));
    }

    #[test]
    fn tagged_garbage_is_still_encrypted() {
        let garbage = vec![0x5A; 64];
        assert_eq!(decode_payload(&garbage, Some(b"handle")), DecodedPayload::StillEncrypted);
    }

    #[test]
    fn untagged_garbage_is_corrupt() {
        let garbage = vec![0x5A; 64];
        assert_eq!(decode_payload(&garbage, None), DecodedPayload::Corrupt);
        assert_eq!(decode_payload(b"tiny", None), DecodedPayload::Corrupt);
    }

    #[test]
    fn flipped_body_bit_fails_integrity() {
        let mut payload = encode_payload(b"hello");
        let last = payload.len() - 1;
        payload[last] ^= 1;
        assert_eq!(decode_payload(&payload, None), DecodedPayload::Corrupt);
    }
}
