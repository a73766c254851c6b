use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::KeyError;

/// The signed document advertising one key set's identity, keys, and
/// validity window. Stored as TOML in `key_NNNN/ServerDesc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDesc {
    pub nickname: String,
    pub address: String,
    pub port: u16,
    pub valid_after: u64,
    pub valid_until: u64,
    /// base64 x25519 public half of the packet key.
    pub packet_key: String,
    /// base64 ed25519 verifying half of the transport key.
    pub mmtp_key: String,
    /// base64 ed25519 identity verifying key.
    pub identity: String,
    /// Descriptor fragments advertised by enabled delivery modules.
    #[serde(default)]
    pub module_blocks: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct SignedDesc {
    #[serde(flatten)]
    body: ServerDesc,
    signature: String,
}

impl ServerDesc {
    /// Serialize and sign with the identity key.
    pub fn to_signed_toml(&self, identity: &SigningKey) -> Result<String, KeyError> {
        let body = toml::to_string(self)
            .map_err(|e| KeyError::Descriptor(format!("encode failed: {e}")))?;
        let signature = identity.sign(body.as_bytes());
        let signed = SignedDesc { body: self.clone(), signature: BASE64.encode(signature.to_bytes()) };
        toml::to_string(&signed).map_err(|e| KeyError::Descriptor(format!("encode failed: {e}")))
    }

    /// Parse a descriptor document, verifying its embedded identity
    /// signature.
    pub fn parse(text: &str) -> Result<Self, KeyError> {
        let signed: SignedDesc = toml::from_str(text)
            .map_err(|e| KeyError::Descriptor(format!("parse failed: {e}")))?;
        let body = signed.body;
        if body.valid_after >= body.valid_until {
            return Err(KeyError::Descriptor(format!(
                "validity window inverted: {} >= {}",
                body.valid_after, body.valid_until
            )));
        }

        let identity_bytes: [u8; 32] = BASE64
            .decode(&body.identity)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| KeyError::Descriptor("bad identity key field".into()))?;
        let identity = VerifyingKey::from_bytes(&identity_bytes)
            .map_err(|e| KeyError::Descriptor(format!("bad identity key: {e}")))?;
        let sig_bytes: [u8; 64] = BASE64
            .decode(&signed.signature)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| KeyError::Descriptor("bad signature field".into()))?;
        let canonical = toml::to_string(&body)
            .map_err(|e| KeyError::Descriptor(format!("encode failed: {e}")))?;
        identity
            .verify(canonical.as_bytes(), &Signature::from_bytes(&sig_bytes))
            .map_err(|_| KeyError::Descriptor("signature verification failed".into()))?;
        Ok(body)
    }
}
