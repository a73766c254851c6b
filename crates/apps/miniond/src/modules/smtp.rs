use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use minion_types::{escape_message_for_email, DeliveryTag, SMTP_TYPE};
use rand_core::{OsRng, RngCore};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::config::{ConfigError, ServerConfig};
use crate::modules::{DeliveryModule, DeliveryStatus, ModuleDisposition, SectionSpec};

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);
const MIX_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SmtpError {
    #[error("smtp io: {0}")]
    Io(String),
    #[error("smtp refused: {0}")]
    Refused(String),
    #[error("smtp timed out")]
    Timeout,
}

/// Hands a composed mail message to an SMTP server. Injected into MBOX so
/// tests can observe delivery without a mail host.
#[async_trait]
pub trait SmtpRelay: Send {
    async fn send(
        &mut self,
        server: &str,
        recipients: &[String],
        from: &str,
        message: &str,
    ) -> Result<(), SmtpError>;
}

/// Minimal SMTP dialogue (HELO, MAIL, RCPT, DATA) over TCP.
pub struct TcpSmtpRelay {
    local_name: String,
}

impl TcpSmtpRelay {
    pub fn new(local_name: String) -> Self {
        Self { local_name }
    }

    async fn dialogue(
        &self,
        server: &str,
        recipients: &[String],
        from: &str,
        message: &str,
    ) -> Result<(), SmtpError> {
        let stream = TcpStream::connect(server)
            .await
            .map_err(|e| SmtpError::Io(e.to_string()))?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        expect_code(&mut reader, 220).await?;
        send_line(&mut write_half, &format!("HELO {}", self.local_name)).await?;
        expect_code(&mut reader, 250).await?;
        send_line(&mut write_half, &format!("MAIL FROM:<{from}>")).await?;
        expect_code(&mut reader, 250).await?;
        for recipient in recipients {
            send_line(&mut write_half, &format!("RCPT TO:<{recipient}>")).await?;
            expect_code(&mut reader, 250).await?;
        }
        send_line(&mut write_half, "DATA").await?;
        expect_code(&mut reader, 354).await?;
        for line in message.lines() {
            // Dot-stuffing per RFC 5321.
            if line.starts_with('.') {
                send_line(&mut write_half, &format!(".{line}")).await?;
            } else {
                send_line(&mut write_half, line).await?;
            }
        }
        send_line(&mut write_half, ".").await?;
        expect_code(&mut reader, 250).await?;
        send_line(&mut write_half, "QUIT").await?;
        Ok(())
    }
}

#[async_trait]
impl SmtpRelay for TcpSmtpRelay {
    async fn send(
        &mut self,
        server: &str,
        recipients: &[String],
        from: &str,
        message: &str,
    ) -> Result<(), SmtpError> {
        log::trace!("sending message via SMTP host {server} to {recipients:?}");
        match tokio::time::timeout(SMTP_TIMEOUT, self.dialogue(server, recipients, from, message))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(SmtpError::Timeout),
        }
    }
}

async fn send_line(
    stream: &mut tokio::net::tcp::OwnedWriteHalf,
    line: &str,
) -> Result<(), SmtpError> {
    stream
        .write_all(format!("{line}\r\n").as_bytes())
        .await
        .map_err(|e| SmtpError::Io(e.to_string()))
}

async fn expect_code(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    code: u16,
) -> Result<(), SmtpError> {
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.map_err(|e| SmtpError::Io(e.to_string()))?;
        if n == 0 {
            return Err(SmtpError::Io("connection closed mid-dialogue".into()));
        }
        // Multi-line replies use "250-..." continuations.
        if line.len() >= 4 && line.as_bytes()[3] == b'-' {
            continue;
        }
        let got: u16 = line.get(..3).and_then(|s| s.parse().ok()).unwrap_or(0);
        if got == code {
            return Ok(());
        }
        return Err(SmtpError::Refused(line.trim_end().to_string()));
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MixmasterSection {
    #[serde(default)]
    enabled: bool,
    mix_command: Option<String>,
    server: Option<String>,
    #[serde(default = "default_subject")]
    subject_line: String,
}

fn default_subject() -> String {
    "Type-III Anonymous Message".into()
}

struct MixmasterRuntime {
    command: PathBuf,
    base_args: Vec<String>,
    server: String,
    subject: String,
    spool_dir: PathBuf,
}

/// Delivers SMTP exit traffic by handing messages to an external mixing
/// remailer binary; fire-and-forget, with the remailer's own pool flushed
/// once per batch.
pub struct MixmasterSmtpModule {
    runtime: Option<MixmasterRuntime>,
    spooled_this_batch: bool,
}

impl MixmasterSmtpModule {
    pub fn new() -> Self {
        Self { runtime: None, spooled_this_batch: false }
    }
}

impl Default for MixmasterSmtpModule {
    fn default() -> Self {
        Self::new()
    }
}

const MIXMASTER_SECTIONS: &[SectionSpec] =
    &[SectionSpec { name: "smtp_mixmaster", required: &["enabled"] }];

#[async_trait]
impl DeliveryModule for MixmasterSmtpModule {
    fn name(&self) -> &'static str {
        "SMTP_MIX2"
    }

    fn exit_types(&self) -> &[u16] {
        &[SMTP_TYPE]
    }

    fn config_sections(&self) -> &'static [SectionSpec] {
        MIXMASTER_SECTIONS
    }

    fn configure(&mut self, config: &ServerConfig) -> Result<ModuleDisposition, ConfigError> {
        let Some(section) = config.delivery_section::<MixmasterSection>("smtp_mixmaster")? else {
            return Ok(ModuleDisposition::Disable);
        };
        if !section.enabled {
            self.runtime = None;
            return Ok(ModuleDisposition::Disable);
        }
        let command_line = section.mix_command.ok_or_else(|| ConfigError::Missing {
            section: "delivery.smtp_mixmaster".into(),
            key: "mix_command".into(),
        })?;
        let server = section.server.ok_or_else(|| ConfigError::Missing {
            section: "delivery.smtp_mixmaster".into(),
            key: "server".into(),
        })?;

        let mut words = command_line.split_whitespace().map(String::from);
        let command = PathBuf::from(words.next().ok_or_else(|| {
            ConfigError::Invalid("mix_command must name a binary".into())
        })?);
        self.runtime = Some(MixmasterRuntime {
            command,
            base_args: words.collect(),
            server,
            subject: section.subject_line,
            spool_dir: PathBuf::new(),
        });
        Ok(ModuleDisposition::Enable)
    }

    fn server_info_block(&self) -> String {
        "[Delivery/SMTP]\nVersion: 0.1\n".into()
    }

    fn attach_queue_dir(&mut self, dir: &Path) -> Result<(), ConfigError> {
        let spool_dir = PathBuf::from(format!("{}_tmp", dir.display()));
        // Stale spool files from a previous run are worthless; clear them.
        if spool_dir.exists() {
            std::fs::remove_dir_all(&spool_dir).map_err(|e| {
                ConfigError::Invalid(format!("cannot clear spool {}: {e}", spool_dir.display()))
            })?;
        }
        std::fs::create_dir_all(&spool_dir).map_err(|e| {
            ConfigError::Invalid(format!("cannot create spool {}: {e}", spool_dir.display()))
        })?;
        if let Some(runtime) = self.runtime.as_mut() {
            runtime.spool_dir = spool_dir;
        }
        Ok(())
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
        let Some(recipient) = parse_mailbox(exit_info) else {
            log::warn!("SMTP_MIX2: invalid recipient mailbox");
            return DeliveryStatus::NoRetry;
        };
        let Some(message) = escape_message_for_email(payload, tag) else {
            // Corrupt message with nothing to show; the remailer has no
            // sentinel convention, so drop it here.
            log::warn!("SMTP_MIX2: dropping corrupt message for {recipient}");
            return DeliveryStatus::NoRetry;
        };

        let mut spool_name = [0u8; 8];
        OsRng.fill_bytes(&mut spool_name);
        let spool_path = runtime.spool_dir.join(hex::encode(spool_name));
        if let Err(err) = std::fs::write(&spool_path, message) {
            return DeliveryStatus::Error(format!("cannot spool message: {err}"));
        }

        let status = tokio::time::timeout(
            MIX_COMMAND_TIMEOUT,
            tokio::process::Command::new(&runtime.command)
                .args(&runtime.base_args)
                .arg("-l")
                .arg(&runtime.server)
                .arg("-s")
                .arg(&runtime.subject)
                .arg("-t")
                .arg(&recipient)
                .arg(&spool_path)
                .status(),
        )
        .await;
        let _ = std::fs::remove_file(&spool_path);

        match status {
            Ok(Ok(code)) => {
                log::debug!("queued mixmaster message: exit code {code}");
                self.spooled_this_batch = true;
                DeliveryStatus::Ok
            }
            Ok(Err(err)) => DeliveryStatus::Error(format!("mixmaster spawn failed: {err}")),
            Err(_) => DeliveryStatus::Error("mixmaster command timed out".into()),
        }
    }

    async fn end_batch(&mut self) {
        if !self.spooled_this_batch {
            return;
        }
        self.spooled_this_batch = false;
        let Some(runtime) = self.runtime.as_ref() else {
            return;
        };
        log::debug!("flushing mixmaster pool");
        match tokio::process::Command::new(&runtime.command)
            .args(&runtime.base_args)
            .arg("-S")
            .spawn()
        {
            Ok(_child) => {}
            Err(err) => log::warn!("SMTP_MIX2: pool flush failed to start: {err}"),
        }
    }
}

/// A mailbox usable on a mixmaster command line: one non-empty token with an
/// `@`, no whitespace or control characters.
fn parse_mailbox(raw: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(raw).ok()?;
    let text = text.trim();
    if text.is_empty()
        || !text.contains('@')
        || text.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return None;
    }
    Some(text.to_string())
}
