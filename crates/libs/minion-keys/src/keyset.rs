use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::descriptor::ServerDesc;
use crate::{create_private_dir, read_exact_file, write_private_file, KeyError};

const MIX_KEY_FILE: &str = "mix.key";
const MMTP_KEY_FILE: &str = "mmtp.key";
const MMTP_CERT_FILE: &str = "mmtp.cert";
const DESC_FILE: &str = "ServerDesc";

/// verifying key (32) + valid_after (8) + valid_until (8) + identity
/// signature (64). The transport layer treats this as its credential blob.
pub const CERT_LEN: usize = 112;

/// One time-bounded bundle of server keys: the packet (mix) key, the
/// transport key and certificate, and the signed descriptor, all under
/// `keys/key_NNNN/`.
pub struct ServerKeyset {
    pub name: String,
    pub dir: PathBuf,
    pub packet_key: StaticSecret,
    pub mmtp_key: SigningKey,
    pub mmtp_cert: Vec<u8>,
    pub descriptor: ServerDesc,
    pub hash_log_path: PathBuf,
}

pub struct KeysetParams<'a> {
    pub nickname: &'a str,
    pub address: &'a str,
    pub port: u16,
    pub valid_after: u64,
    pub valid_until: u64,
    pub module_blocks: &'a [String],
}

impl ServerKeyset {
    /// Generate a fresh key set named `name`, write its files under
    /// `key_dir/key_<name>/`, and return the loaded bundle.
    pub fn generate(
        key_dir: &Path,
        hash_dir: &Path,
        name: &str,
        identity: &SigningKey,
        params: &KeysetParams<'_>,
    ) -> Result<Self, KeyError> {
        let dir = key_dir.join(format!("key_{name}"));
        create_private_dir(&dir)?;

        let packet_key = StaticSecret::random_from_rng(OsRng);
        let mmtp_key = SigningKey::generate(&mut OsRng);
        let mmtp_cert = build_cert(&mmtp_key, params.valid_after, params.valid_until, identity);

        let descriptor = ServerDesc {
            nickname: params.nickname.to_string(),
            address: params.address.to_string(),
            port: params.port,
            valid_after: params.valid_after,
            valid_until: params.valid_until,
            packet_key: BASE64.encode(PublicKey::from(&packet_key).to_bytes()),
            mmtp_key: BASE64.encode(mmtp_key.verifying_key().to_bytes()),
            identity: BASE64.encode(identity.verifying_key().to_bytes()),
            module_blocks: params.module_blocks.to_vec(),
        };

        write_private_file(&dir.join(MIX_KEY_FILE), &packet_key.to_bytes())?;
        write_private_file(
            &dir.join(MMTP_KEY_FILE),
            Zeroizing::new(mmtp_key.to_bytes()).as_slice(),
        )?;
        write_private_file(&dir.join(MMTP_CERT_FILE), &mmtp_cert)?;
        write_private_file(
            &dir.join(DESC_FILE),
            descriptor.to_signed_toml(identity)?.as_bytes(),
        )?;

        Ok(Self {
            name: name.to_string(),
            hash_log_path: hash_dir.join(format!("hash_{name}")),
            dir,
            packet_key,
            mmtp_key,
            mmtp_cert,
            descriptor,
        })
    }

    /// Load an existing key set by name.
    pub fn load(key_dir: &Path, hash_dir: &Path, name: &str) -> Result<Self, KeyError> {
        let dir = key_dir.join(format!("key_{name}"));

        let desc_path = dir.join(DESC_FILE);
        let desc_text = fs::read_to_string(&desc_path).map_err(|e| KeyError::io(&desc_path, e))?;
        let descriptor = ServerDesc::parse(&desc_text)?;

        let packet_bytes: [u8; 32] = read_exact_file(&dir.join(MIX_KEY_FILE))?;
        let mmtp_bytes: [u8; 32] = read_exact_file(&dir.join(MMTP_KEY_FILE))?;
        let cert_path = dir.join(MMTP_CERT_FILE);
        let mmtp_cert = fs::read(&cert_path).map_err(|e| KeyError::io(&cert_path, e))?;
        if mmtp_cert.len() != CERT_LEN {
            return Err(KeyError::Material {
                path: cert_path,
                reason: format!("expected {CERT_LEN}-byte cert, got {}", mmtp_cert.len()),
            });
        }

        Ok(Self {
            name: name.to_string(),
            hash_log_path: hash_dir.join(format!("hash_{name}")),
            dir,
            packet_key: StaticSecret::from(packet_bytes),
            mmtp_key: SigningKey::from_bytes(&mmtp_bytes),
            mmtp_cert,
            descriptor,
        })
    }

    /// SHA-256 of the transport verifying key; peers address us by this.
    pub fn key_fingerprint(&self) -> [u8; 32] {
        Sha256::digest(self.mmtp_key.verifying_key().to_bytes()).into()
    }
}

fn build_cert(
    mmtp_key: &SigningKey,
    valid_after: u64,
    valid_until: u64,
    identity: &SigningKey,
) -> Vec<u8> {
    let mut cert = Vec::with_capacity(CERT_LEN);
    cert.extend_from_slice(&mmtp_key.verifying_key().to_bytes());
    cert.extend_from_slice(&valid_after.to_be_bytes());
    cert.extend_from_slice(&valid_until.to_be_bytes());
    let signature = identity.sign(&cert);
    cert.extend_from_slice(&signature.to_bytes());
    cert
}
