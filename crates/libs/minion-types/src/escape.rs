use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::packet::DeliveryTag;

pub const MESSAGE_BEGINS: &str = "============ ANONYMOUS MESSAGE BEGINS\n";
pub const MESSAGE_ENDS: &str = "============ ANONYMOUS MESSAGE ENDS\n";

const ENC_EXPLANATION: &str = "This message is not in plaintext.  It's either 1) a reply; 2) a forward\n\
     message encrypted to you; or 3) junk.\n\n";

/// True iff the bytes contain none of the non-printing control characters
/// (0x00-0x06, 0x0E-0x1F).
pub fn is_printable(bytes: &[u8]) -> bool {
    !bytes.iter().any(|b| matches!(b, 0x00..=0x06 | 0x0E..=0x1F))
}

/// Wrap an exit payload for a text transport such as mail.
///
/// Corrupt messages yield no body. Encrypted messages are base64-encoded and
/// prefixed with the recipient's decoding handle plus a fixed explanation.
/// Plaintext goes through verbatim; anything with non-printing bytes is
/// base64-encoded as binary.
pub fn escape_message_for_email(payload: &[u8], tag: &DeliveryTag) -> Option<String> {
    let (explanation, handle_line, body) = match tag {
        DeliveryTag::Corrupt => return None,
        DeliveryTag::Encrypted(handle) => {
            let line = format!("Decoding handle: {}\n", BASE64.encode(handle));
            (ENC_EXPLANATION, line, encode_body(payload))
        }
        DeliveryTag::Clear => {
            if is_printable(payload) {
                let mut text = String::from_utf8_lossy(payload).into_owned();
                if !text.ends_with('\n') {
                    text.push('\n');
                }
                ("", String::new(), text)
            } else {
                ("", String::new(), encode_body(payload))
            }
        }
    };

    Some(format!("{explanation}{MESSAGE_BEGINS}{handle_line}{body}{MESSAGE_ENDS}"))
}

fn encode_body(payload: &[u8]) -> String {
    let mut body = BASE64.encode(payload);
    body.push('\n');
    body
}
