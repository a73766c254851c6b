use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ed25519_dalek::SigningKey;
use rand_core::{OsRng, RngCore};

use crate::keyset::{KeysetParams, ServerKeyset};
use crate::{
    create_private_dir, format_date, previous_midnight, read_exact_file, secure_delete,
    write_private_file, KeyError,
};

const IDENTITY_FILE: &str = "identity.key";
const DH_PARAM_LEN: usize = 256;

#[derive(Debug, Clone)]
pub struct KeyRingConfig {
    pub home_dir: PathBuf,
    pub nickname: String,
    pub address: String,
    pub port: u16,
    /// Width the operator asked for; checked against the stored key.
    pub identity_key_bits: u32,
    /// Lifetime of each rotating key set, seconds.
    pub public_key_lifetime: u64,
    /// Tolerance before an expired key is really considered dead, seconds.
    pub key_sloppiness: u64,
    /// Descriptor fragments from enabled delivery modules.
    pub module_blocks: Vec<String>,
}

/// One key set's place in the schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInterval {
    pub valid_after: u64,
    pub valid_until: u64,
    pub name: String,
    pub dir: PathBuf,
}

/// Immutable snapshot of the on-disk key schedule; rescans build a fresh one.
#[derive(Debug, Clone, Default)]
pub struct KeySchedule {
    intervals: Vec<KeyInterval>,
    key_range: Option<(u32, u32)>,
}

impl KeySchedule {
    pub fn intervals(&self) -> &[KeyInterval] {
        &self.intervals
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// The interval live at `t`: the last one starting at or before `t`,
    /// provided it has not ended.
    pub fn live_at(&self, t: u64) -> Option<&KeyInterval> {
        let idx = self.intervals.partition_point(|k| k.valid_after <= t);
        let candidate = self.intervals.get(idx.checked_sub(1)?)?;
        (candidate.valid_until > t).then_some(candidate)
    }
}

struct CachedLive {
    name: String,
    valid_after: u64,
    next_rotation: u64,
}

/// Discovers, generates, retires, and exposes the server's rotating keys.
pub struct KeyRing {
    config: KeyRingConfig,
    key_dir: PathBuf,
    hash_dir: PathBuf,
    schedule: KeySchedule,
    cached: Option<CachedLive>,
}

impl KeyRing {
    pub fn open(config: KeyRingConfig) -> Result<Self, KeyError> {
        let key_dir = config.home_dir.join("keys");
        let hash_dir = config.home_dir.join("work").join("hashlogs");
        let mut ring =
            Self { config, key_dir, hash_dir, schedule: KeySchedule::default(), cached: None };
        ring.scan()?;
        Ok(ring)
    }

    pub fn schedule(&self) -> &KeySchedule {
        &self.schedule
    }

    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    /// Re-read the key store from disk, replacing the schedule snapshot.
    pub fn scan(&mut self) -> Result<(), KeyError> {
        if !self.key_dir.exists() {
            log::info!("creating server keystore at {}", self.key_dir.display());
            create_private_dir(&self.key_dir)?;
        }
        log::debug!("scanning server keystore at {}", self.key_dir.display());

        let mut intervals = Vec::new();
        let mut first_key: Option<u32> = None;
        let mut last_key: Option<u32> = None;

        let dir_iter = fs::read_dir(&self.key_dir).map_err(|e| KeyError::io(&self.key_dir, e))?;
        for item in dir_iter.flatten() {
            let path = item.path();
            if !path.is_dir() {
                continue;
            }
            let dirname = item.file_name().to_string_lossy().into_owned();
            let Some(name) = dirname.strip_prefix("key_") else {
                log::warn!("unexpected directory {dirname} under {}", self.key_dir.display());
                continue;
            };
            let Ok(number) = name.parse::<u32>() else {
                log::warn!("unexpected directory {dirname} under {}", self.key_dir.display());
                continue;
            };
            first_key = Some(first_key.map_or(number, |f| f.min(number)));
            last_key = Some(last_key.map_or(number, |l| l.max(number)));

            let desc_path = path.join("ServerDesc");
            let desc = fs::read_to_string(&desc_path)
                .map_err(|e| KeyError::io(&desc_path, e))
                .and_then(|text| crate::ServerDesc::parse(&text));
            match desc {
                Ok(desc) => {
                    log::debug!(
                        "found key {dirname} (valid from {} to {})",
                        format_date(desc.valid_after),
                        format_date(desc.valid_until)
                    );
                    intervals.push(KeyInterval {
                        valid_after: desc.valid_after,
                        valid_until: desc.valid_until,
                        name: name.to_string(),
                        dir: path,
                    });
                }
                Err(err) => {
                    log::warn!("no usable server descriptor for key {dirname}: {err}");
                }
            }
        }

        intervals.sort_by_key(|k| (k.valid_after, k.name.clone()));
        for pair in intervals.windows(2) {
            let end = pair[0].valid_until;
            let start = pair[1].valid_after;
            if start < end {
                log::warn!("multiple keys valid at {}; that's unsupported", format_date(end));
            } else if start > end {
                log::warn!(
                    "gap in key schedule: no key from {} to {}",
                    format_date(end),
                    format_date(start)
                );
            }
        }

        self.schedule =
            KeySchedule { intervals, key_range: first_key.zip(last_key) };
        self.cached = None;
        Ok(())
    }

    /// The interval live at `now`, memoised until the rotation point.
    pub fn live_key(&mut self, now: u64) -> Option<&KeyInterval> {
        let cached_ok = self
            .cached
            .as_ref()
            .is_some_and(|c| now >= c.valid_after && now < c.next_rotation);
        if !cached_ok {
            let live = self.schedule.live_at(now)?;
            self.cached = Some(CachedLive {
                name: live.name.clone(),
                valid_after: live.valid_after,
                next_rotation: live.valid_until,
            });
        }
        let name = &self.cached.as_ref()?.name;
        self.schedule.intervals().iter().find(|k| &k.name == name)
    }

    /// Expiration time of the currently live key, if any.
    pub fn next_rotation(&self) -> Option<u64> {
        self.cached.as_ref().map(|c| c.next_rotation)
    }

    /// Load the full key set for the interval live at `now`.
    pub fn live_keyset(&mut self, now: u64) -> Result<ServerKeyset, KeyError> {
        let name = self.live_key(now).ok_or(KeyError::NoLiveKey)?.name.clone();
        ServerKeyset::load(&self.key_dir, &self.hash_dir, &name)
    }

    /// Generate `count` new key sets. The first becomes valid at `start_at`
    /// (rounded down to the previous UTC midnight), or just after the last
    /// existing key expires, or now.
    pub fn create(&mut self, count: u32, start_at: Option<u64>, now: u64) -> Result<(), KeyError> {
        let identity = self.identity_key()?;

        let mut start = start_at.unwrap_or_else(|| {
            self.schedule.intervals().last().map_or(now + 60, |k| k.valid_until + 60)
        });
        start = previous_midnight(start);

        let mut range = self.schedule.key_range;
        for _ in 0..count {
            let number = match range {
                None => {
                    range = Some((1, 1));
                    1
                }
                Some((first, last)) if first > 1 => {
                    range = Some((first - 1, last));
                    first - 1
                }
                Some((first, last)) => {
                    range = Some((first, last + 1));
                    last + 1
                }
            };
            let name = format!("{number:04}");
            let next_start = start + self.config.public_key_lifetime;

            log::info!(
                "generating key {name} to run from {} through {}",
                format_date(start),
                format_date(next_start.saturating_sub(3600))
            );
            ServerKeyset::generate(
                &self.key_dir,
                &self.hash_dir,
                &name,
                &identity,
                &KeysetParams {
                    nickname: &self.config.nickname,
                    address: &self.config.address,
                    port: self.config.port,
                    valid_after: start,
                    valid_until: next_start,
                    module_blocks: &self.config.module_blocks,
                },
            )?;
            start = next_start;
        }

        self.scan()
    }

    /// Remove every key set that expired more than `key_sloppiness` seconds
    /// before `now`, securely deleting its files.
    pub fn remove_dead(&mut self, now: u64) -> Result<(), KeyError> {
        self.scan()?;

        let cutoff = now.saturating_sub(self.config.key_sloppiness);
        let dead: Vec<KeyInterval> = self
            .schedule
            .intervals()
            .iter()
            .filter(|k| k.valid_until < cutoff)
            .cloned()
            .collect();

        for key in &dead {
            log::info!(
                "removing expired key {} (valid from {} through {})",
                key.name,
                format_date(key.valid_after),
                format_date(key.valid_until.saturating_sub(3600))
            );
            let files = fs::read_dir(&key.dir).map_err(|e| KeyError::io(&key.dir, e))?;
            for file in files.flatten() {
                secure_delete(&file.path())?;
            }
            fs::remove_dir(&key.dir).map_err(|e| KeyError::io(&key.dir, e))?;
        }

        self.scan()
    }

    /// The long-lived identity key; generated on first use and never rotated.
    pub fn identity_key(&self) -> Result<SigningKey, KeyError> {
        create_private_dir(&self.key_dir)?;
        let path = self.key_dir.join(IDENTITY_FILE);
        if path.exists() {
            let bytes: [u8; 32] = read_exact_file(&path)?;
            let key = SigningKey::from_bytes(&bytes);
            let stored_bits: u32 = 32 * 8;
            if stored_bits != self.config.identity_key_bits {
                log::warn!(
                    "stored identity key has {stored_bits} bits, but you asked for {}",
                    self.config.identity_key_bits
                );
            }
            Ok(key)
        } else {
            log::info!("generating identity key");
            let key = SigningKey::generate(&mut OsRng);
            write_private_file(&path, &key.to_bytes())?;
            log::info!("generated identity key at {}", path.display());
            Ok(key)
        }
    }

    /// Remove the identity key after a delay, and the transport parameter
    /// file if that path exists.
    pub fn remove_identity(&self, delay: Duration) -> Result<(), KeyError> {
        let path = self.key_dir.join(IDENTITY_FILE);
        if !path.exists() {
            log::info!("no identity key to remove");
        } else {
            log::warn!("removing identity key in {} seconds", delay.as_secs());
            std::thread::sleep(delay);
            log::warn!("removing identity key");
            secure_delete(&path)?;
        }

        let dh_path = self.dh_param_path();
        if dh_path.exists() {
            log::info!("removing transport parameter file");
            secure_delete(&dh_path)?;
        }
        Ok(())
    }

    pub fn dh_param_path(&self) -> PathBuf {
        self.config.home_dir.join("work").join("tls").join("dhparam")
    }

    /// Parameter material for the transport layer; created lazily.
    pub fn dh_params(&self) -> Result<PathBuf, KeyError> {
        let path = self.dh_param_path();
        create_private_dir(&self.config.home_dir.join("work").join("tls"))?;
        if !path.exists() {
            log::info!("generating transport parameters");
            let mut material = vec![0u8; DH_PARAM_LEN];
            OsRng.fill_bytes(&mut material);
            write_private_file(&path, &material)?;
        } else {
            log::debug!("using existing transport parameters from {}", path.display());
        }
        Ok(path)
    }
}
