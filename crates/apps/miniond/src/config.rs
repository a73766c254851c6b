use std::fs;
use std::path::{Path, PathBuf};

use minion_keys::KeyRingConfig;
use minion_queue::RetryPolicy;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("error in configuration file: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("missing {key} field in [{section}]")]
    Missing { section: String, key: String },
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawServerSection {
    homedir: Option<PathBuf>,
    #[serde(default)]
    nickname: String,
    identity_key_bits: Option<u32>,
    public_key_lifetime: Option<String>,
    public_key_sloppiness: Option<String>,
    mix_interval: Option<String>,
    clean_interval: Option<String>,
    max_retries: Option<u8>,
    retry_base: Option<String>,
    retry_cap: Option<String>,
    send_timeout: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawIncomingSection {
    ip: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    server: RawServerSection,
    #[serde(default)]
    incoming: RawIncomingSection,
    // Delivery sections are owned by their modules; kept in the raw value.
    #[allow(dead_code)]
    delivery: Option<toml::Value>,
}

/// Fully-validated server configuration. Module-owned sections stay in `raw`
/// and are deserialized by the module that claims them.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub homedir: PathBuf,
    pub nickname: String,
    pub identity_key_bits: u32,
    pub public_key_lifetime: u64,
    pub public_key_sloppiness: u64,
    pub mix_interval: u64,
    pub clean_interval: u64,
    pub retry: RetryPolicy,
    pub send_timeout: u64,
    pub incoming_ip: String,
    pub incoming_port: u16,
    raw: toml::Value,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io { path: path.to_path_buf(), source: e })?;
        Self::from_str(&text)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        let raw_value: toml::Value =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let parsed: RawConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let homedir = parsed.server.homedir.ok_or_else(|| ConfigError::Missing {
            section: "server".into(),
            key: "homedir".into(),
        })?;

        let mix_interval = parse_duration(parsed.server.mix_interval.as_deref().unwrap_or("20s"))?;
        if mix_interval == 0 {
            return Err(ConfigError::Invalid("mix_interval must be positive".into()));
        }
        let clean_interval =
            parse_duration(parsed.server.clean_interval.as_deref().unwrap_or("100m"))?;
        let retry = RetryPolicy::new(
            parsed.server.max_retries.unwrap_or(10),
            parse_duration(parsed.server.retry_base.as_deref().unwrap_or("60s"))?,
            parse_duration(parsed.server.retry_cap.as_deref().unwrap_or("1d"))?,
        );
        if retry.base_secs > retry.cap_secs {
            return Err(ConfigError::Invalid("retry_base exceeds retry_cap".into()));
        }

        Ok(Self {
            homedir,
            nickname: parsed.server.nickname,
            identity_key_bits: parsed.server.identity_key_bits.unwrap_or(256),
            public_key_lifetime: parse_duration(
                parsed.server.public_key_lifetime.as_deref().unwrap_or("30d"),
            )?,
            public_key_sloppiness: parse_duration(
                parsed.server.public_key_sloppiness.as_deref().unwrap_or("3h"),
            )?,
            mix_interval,
            clean_interval,
            retry,
            send_timeout: parse_duration(parsed.server.send_timeout.as_deref().unwrap_or("30s"))?,
            incoming_ip: parsed.incoming.ip.unwrap_or_else(|| "0.0.0.0".into()),
            incoming_port: parsed.incoming.port.unwrap_or(48_099),
            raw: raw_value,
        })
    }

    /// Deserialize a `[delivery.<name>]` section, if present.
    pub fn delivery_section<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: serde::de::DeserializeOwned,
    {
        let Some(section) = self.raw.get("delivery").and_then(|d| d.get(name)) else {
            return Ok(None);
        };
        T::deserialize(section.clone())
            .map(Some)
            .map_err(|e| ConfigError::Parse(format!("[delivery.{name}]: {e}")))
    }

    pub fn has_delivery_section(&self, name: &str) -> bool {
        self.raw.get("delivery").and_then(|d| d.get(name)).is_some()
    }

    pub fn work_dir(&self) -> PathBuf {
        self.homedir.join("work")
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.work_dir().join("queues")
    }

    pub fn key_ring_config(&self, module_blocks: Vec<String>) -> KeyRingConfig {
        KeyRingConfig {
            home_dir: self.homedir.clone(),
            nickname: self.nickname.clone(),
            address: self.incoming_ip.clone(),
            port: self.incoming_port,
            identity_key_bits: self.identity_key_bits,
            public_key_lifetime: self.public_key_lifetime,
            key_sloppiness: self.public_key_sloppiness,
            module_blocks,
        }
    }
}

/// Parse a human duration: bare seconds or a number with an s/m/h/d suffix.
pub fn parse_duration(text: &str) -> Result<u64, ConfigError> {
    let text = text.trim();
    let (digits, multiplier) = match text.as_bytes().last() {
        Some(b's') => (&text[..text.len() - 1], 1),
        Some(b'm') => (&text[..text.len() - 1], 60),
        Some(b'h') => (&text[..text.len() - 1], 3_600),
        Some(b'd') => (&text[..text.len() - 1], 86_400),
        Some(b'0'..=b'9') => (text, 1),
        _ => return Err(ConfigError::Invalid(format!("bad duration {text:?}"))),
    };
    digits
        .trim()
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|_| ConfigError::Invalid(format!("bad duration {text:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [server]
        homedir = "/var/lib/miniond"
    "#;

    #[test]
    fn durations_parse_with_suffixes() {
        assert_eq!(parse_duration("20s").expect("parse"), 20);
        assert_eq!(parse_duration("100m").expect("parse"), 6_000);
        assert_eq!(parse_duration("3h").expect("parse"), 10_800);
        assert_eq!(parse_duration("30d").expect("parse"), 2_592_000);
        assert_eq!(parse_duration("45").expect("parse"), 45);
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = ServerConfig::from_str(MINIMAL).expect("parse");
        assert_eq!(config.homedir, PathBuf::from("/var/lib/miniond"));
        assert_eq!(config.mix_interval, 20);
        assert_eq!(config.clean_interval, 6_000);
        assert_eq!(config.retry.max_retries, 10);
        assert_eq!(config.retry.base_secs, 60);
        assert_eq!(config.retry.cap_secs, 86_400);
        assert_eq!(config.incoming_port, 48_099);
    }

    #[test]
    fn missing_homedir_is_an_error() {
        let err = ServerConfig::from_str("[server]\nnickname = \"x\"\n")
            .expect_err("homedir is required");
        assert!(matches!(err, ConfigError::Missing { .. }));
    }

    #[test]
    fn unknown_server_key_rejected() {
        let err = ServerConfig::from_str("[server]\nhomedir = \"/x\"\nbogus = 1\n")
            .expect_err("unknown keys should fail");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn delivery_sections_stay_available_raw() {
        let text = r#"
            [server]
            homedir = "/x"
            mix_interval = "45s"

            [delivery.mbox]
            enabled = true
            address_file = "/etc/mbox-addresses"
        "#;
        let config = ServerConfig::from_str(text).expect("parse");
        assert_eq!(config.mix_interval, 45);
        assert!(config.has_delivery_section("mbox"));
        assert!(!config.has_delivery_section("smtp_mixmaster"));

        #[derive(Deserialize)]
        struct Probe {
            enabled: bool,
            address_file: String,
        }
        let probe: Probe =
            config.delivery_section("mbox").expect("decode").expect("section present");
        assert!(probe.enabled);
        assert_eq!(probe.address_file, "/etc/mbox-addresses");
    }

    #[test]
    fn inverted_retry_bounds_rejected() {
        let text = "[server]\nhomedir = \"/x\"\nretry_base = \"2d\"\nretry_cap = \"1h\"\n";
        assert!(matches!(
            ServerConfig::from_str(text),
            Err(ConfigError::Invalid(_))
        ));
    }
}
