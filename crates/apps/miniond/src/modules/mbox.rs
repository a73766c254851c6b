use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use minion_types::{escape_message_for_email, DeliveryTag, MBOX_TYPE};
use serde::Deserialize;

use crate::config::{ConfigError, ServerConfig};
use crate::modules::smtp::SmtpRelay;
use crate::modules::{DeliveryModule, DeliveryStatus, ModuleDisposition, SectionSpec};

const CORRUPT_SENTINEL: &str =
    "<<This message was damaged in transit and could not be decoded.>>\n";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MboxSection {
    #[serde(default)]
    enabled: bool,
    address_file: Option<PathBuf>,
    return_address: Option<String>,
    remove_contact: Option<String>,
    #[serde(default = "default_smtp_server")]
    smtp_server: String,
}

fn default_smtp_server() -> String {
    "localhost:25".into()
}

struct MboxRuntime {
    smtp_server: String,
    return_address: String,
    contact: String,
    nickname: String,
    advertised_addr: String,
    addresses: HashMap<String, String>,
}

/// Delivers to a fixed set of local pseudonyms: the address file maps each
/// pseudonym to a real mailbox, and the message is wrapped in a warning
/// boilerplate before going out over SMTP.
pub struct MboxModule {
    relay: Box<dyn SmtpRelay>,
    runtime: Option<MboxRuntime>,
}

impl MboxModule {
    pub fn new(relay: Box<dyn SmtpRelay>) -> Self {
        Self { relay, runtime: None }
    }
}

const MBOX_SECTIONS: &[SectionSpec] = &[SectionSpec { name: "mbox", required: &["enabled"] }];

#[async_trait]
impl DeliveryModule for MboxModule {
    fn name(&self) -> &'static str {
        "MBOX"
    }

    fn exit_types(&self) -> &[u16] {
        &[MBOX_TYPE]
    }

    fn config_sections(&self) -> &'static [SectionSpec] {
        MBOX_SECTIONS
    }

    fn configure(&mut self, config: &ServerConfig) -> Result<ModuleDisposition, ConfigError> {
        let Some(section) = config.delivery_section::<MboxSection>("mbox")? else {
            return Ok(ModuleDisposition::Disable);
        };
        if !section.enabled {
            self.runtime = None;
            return Ok(ModuleDisposition::Disable);
        }

        let missing = |key: &str| ConfigError::Missing {
            section: "delivery.mbox".into(),
            key: key.into(),
        };
        let address_file = section.address_file.ok_or_else(|| missing("address_file"))?;
        let return_address = section.return_address.ok_or_else(|| missing("return_address"))?;
        let contact = section.remove_contact.ok_or_else(|| missing("remove_contact"))?;

        let text = fs::read_to_string(&address_file).map_err(|e| {
            ConfigError::Invalid(format!("cannot read {}: {e}", address_file.display()))
        })?;
        let addresses = parse_address_file(&text, &address_file.display().to_string())?;

        let nickname = if config.nickname.is_empty() {
            std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into())
        } else {
            config.nickname.clone()
        };

        self.runtime = Some(MboxRuntime {
            smtp_server: section.smtp_server,
            return_address,
            contact,
            nickname,
            advertised_addr: config.incoming_ip.clone(),
            addresses,
        });
        Ok(ModuleDisposition::Enable)
    }

    fn server_info_block(&self) -> String {
        "[Delivery/MBOX]\nVersion: 0.1\n".into()
    }

    async fn process(
        &mut self,
        payload: &[u8],
        tag: &DeliveryTag,
        _exit_type: u16,
        exit_info: &[u8],
    ) -> DeliveryStatus {
        let Some(runtime) = self.runtime.as_ref() else {
            return DeliveryStatus::Error("module not configured".into());
        };
        log::trace!("received MBOX message");

        let user = String::from_utf8_lossy(exit_info);
        let Some(recipient) = runtime.addresses.get(user.as_ref()) else {
            log::error!("unknown MBOX user {user:?}");
            return DeliveryStatus::NoRetry;
        };

        let body = escape_message_for_email(payload, tag)
            .unwrap_or_else(|| CORRUPT_SENTINEL.to_string());
        let message = format!(
            "To: {recipient}\n\
             From: {return_address}\n\
             Subject: Anonymous Mixminion message\n\
             \n\
             THIS IS AN ANONYMOUS MESSAGE.  The mixminion server '{nickname}' at\n\
             {addr} has been configured to deliver messages to your address.\n\
             If you do not want to receive messages in the future, contact {contact}\n\
             and you will be removed.\n\
             \n\
             {body}",
            return_address = runtime.return_address,
            nickname = runtime.nickname,
            addr = runtime.advertised_addr,
            contact = runtime.contact,
        );

        match self
            .relay
            .send(
                &runtime.smtp_server,
                std::slice::from_ref(recipient),
                &runtime.return_address,
                &message,
            )
            .await
        {
            Ok(()) => DeliveryStatus::Ok,
            Err(err) => {
                log::warn!("unsuccessful smtp: {err}");
                DeliveryStatus::Retry
            }
        }
    }
}

/// Parse an address file of `name : email` lines. `#` starts a comment, `=`
/// is accepted as the separator, anything after the mailbox is ignored.
fn parse_address_file(
    text: &str,
    origin: &str,
) -> Result<HashMap<String, String>, ConfigError> {
    let mut addresses = HashMap::new();
    for (idx, raw_line) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let bad = || ConfigError::Invalid(format!("bad address on line {lineno} of {origin}"));

        let sep = line.find([':', '=']).ok_or_else(bad)?;
        let name = line[..sep].trim();
        if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c == ':' || c == '=') {
            return Err(bad());
        }
        let email = line[sep + 1..]
            .trim_start()
            .split_whitespace()
            .next()
            .ok_or_else(bad)?;

        log::trace!("mapping MBOX address {name} -> {email}");
        addresses.insert(name.to_string(), email.to_string());
    }
    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::smtp::SmtpError;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingRelay {
        sent: Arc<Mutex<Vec<(String, Vec<String>, String, String)>>>,
        fail: bool,
    }

    #[async_trait]
    impl SmtpRelay for RecordingRelay {
        async fn send(
            &mut self,
            server: &str,
            recipients: &[String],
            from: &str,
            message: &str,
        ) -> Result<(), SmtpError> {
            if self.fail {
                return Err(SmtpError::Refused("451 try later".into()));
            }
            self.sent.lock().expect("lock").push((
                server.to_string(),
                recipients.to_vec(),
                from.to_string(),
                message.to_string(),
            ));
            Ok(())
        }
    }

    fn configured_module(relay: RecordingRelay, dir: &std::path::Path) -> MboxModule {
        let address_file = dir.join("addresses");
        fs::write(&address_file, "# local users\nalice : alice@example.com\n")
            .expect("write address file");
        let config = ServerConfig::from_str(&format!(
            "[server]\nhomedir = \"/x\"\nnickname = \"test-relay\"\n\n\
             [incoming]\nip = \"192.0.2.7\"\n\n\
             [delivery.mbox]\nenabled = true\naddress_file = \"{}\"\n\
             return_address = \"relay@example.com\"\nremove_contact = \"abuse@example.com\"\n\
             smtp_server = \"127.0.0.1:2525\"\n",
            address_file.display()
        ))
        .expect("config");
        let mut module = MboxModule::new(Box::new(relay));
        assert_eq!(module.configure(&config).expect("configure"), ModuleDisposition::Enable);
        module
    }

    #[test]
    fn address_file_grammar() {
        let parsed = parse_address_file(
            "# comment\n\nalice : alice@example.com\nbob=bob@example.net trailing junk\n",
            "test",
        )
        .expect("parse");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["alice"], "alice@example.com");
        assert_eq!(parsed["bob"], "bob@example.net");

        assert!(parse_address_file("no separator here\n", "test").is_err());
        assert!(parse_address_file(": nobody@example.com\n", "test").is_err());
    }

    #[tokio::test]
    async fn known_user_gets_wrapped_message() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let relay = RecordingRelay::default();
        let sent = relay.sent.clone();
        let mut module = configured_module(relay, tmp.path());

        let status = module
            .process(b"hello\n", &DeliveryTag::Clear, MBOX_TYPE, b"alice")
            .await;
        assert_eq!(status, DeliveryStatus::Ok);

        let sent = sent.lock().expect("lock");
        assert_eq!(sent.len(), 1);
        let (server, recipients, from, message) = &sent[0];
        assert_eq!(server, "127.0.0.1:2525");
        assert_eq!(recipients, &vec!["alice@example.com".to_string()]);
        assert_eq!(from, "relay@example.com");
        assert!(message.starts_with("To: alice@example.com\nFrom: relay@example.com\n"));
        assert!(message.contains("test-relay"));
        assert!(message.contains("abuse@example.com"));
        assert!(message.contains("ANONYMOUS MESSAGE BEGINS"));
        assert!(message.contains("hello\n"));
        assert!(!message.contains("base64"));
    }

    #[tokio::test]
    async fn unknown_user_is_no_retry_and_sends_nothing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let relay = RecordingRelay::default();
        let sent = relay.sent.clone();
        let mut module = configured_module(relay, tmp.path());

        let status = module.process(b"hello\n", &DeliveryTag::Clear, MBOX_TYPE, b"bob").await;
        assert_eq!(status, DeliveryStatus::NoRetry);
        assert!(sent.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn smtp_refusal_requests_retry() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let relay = RecordingRelay { fail: true, ..RecordingRelay::default() };
        let mut module = configured_module(relay, tmp.path());

        let status = module.process(b"hi", &DeliveryTag::Clear, MBOX_TYPE, b"alice").await;
        assert_eq!(status, DeliveryStatus::Retry);
    }

    #[tokio::test]
    async fn corrupt_message_gets_sentinel_body() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let relay = RecordingRelay::default();
        let sent = relay.sent.clone();
        let mut module = configured_module(relay, tmp.path());

        let status = module
            .process(b"ciphertext", &DeliveryTag::Corrupt, MBOX_TYPE, b"alice")
            .await;
        assert_eq!(status, DeliveryStatus::Ok);
        let sent = sent.lock().expect("lock");
        assert!(sent[0].3.contains("damaged in transit"));
    }
}
