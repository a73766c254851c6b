use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use rand_core::{OsRng, RngCore};

use crate::entry::{read_entry, write_entry, EntryHeader, QueueEntry};
use crate::retry::RetryPolicy;
use crate::QueueError;

const ACTIVE_PREFIX: &str = "ent_";
const TEMP_PREFIX: &str = "tmp_";
const REMOVED_PREFIX: &str = "rmv_";
const DEAD_DIR: &str = "dead";

/// Stable identifier for a queue entry, valid for the entry's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle(String);

impl Handle {
    pub(crate) fn generate() -> Self {
        let mut raw = [0u8; 16];
        OsRng.fill_bytes(&mut raw);
        Self(hex::encode(raw))
    }

    pub fn from_name(name: String) -> Self {
        Self(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A crash-safe queue of opaque payloads stored one file per entry.
///
/// Entry files are named `ent_<handle>`. Writes land under `tmp_<handle>` and
/// are renamed into place once synced. Removal renames to `rmv_<handle>`;
/// `clean` unlinks the renamed files and any temporaries left by a crash.
/// Entries whose header cannot be parsed are quarantined under `dead/`.
pub struct DurableQueue {
    dir: PathBuf,
    label: String,
    policy: RetryPolicy,
}

impl DurableQueue {
    pub fn open(dir: impl Into<PathBuf>, policy: RetryPolicy) -> Result<Self, QueueError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| QueueError::io(&dir, e))?;
        let dead = dir.join(DEAD_DIR);
        fs::create_dir_all(&dead).map_err(|e| QueueError::io(&dead, e))?;
        let label = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "queue".into());
        Ok(Self { dir, label, policy })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Durably store a payload; returns once the entry file is synced and in
    /// place. `address` is queue-type specific and may be empty.
    pub fn enqueue(
        &self,
        address: &[u8],
        payload: &[u8],
        now: u64,
    ) -> Result<Handle, QueueError> {
        let handle = Handle::generate();
        let header = EntryHeader {
            retry_count: 0,
            first_queued_at: now,
            next_attempt_at: now,
            addr_len: address.len() as u32,
        };
        self.write_atomic(&handle, &header, address, payload)?;
        log::trace!("queue({}): stored entry {}", self.label, handle);
        Ok(handle)
    }

    fn write_atomic(
        &self,
        handle: &Handle,
        header: &EntryHeader,
        address: &[u8],
        payload: &[u8],
    ) -> Result<(), QueueError> {
        let tmp = self.dir.join(format!("{TEMP_PREFIX}{handle}"));
        let dest = self.dir.join(format!("{ACTIVE_PREFIX}{handle}"));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .map_err(|e| QueueError::io(&tmp, e))?;
        write_entry(&mut file, header, address, payload)
            .and_then(|()| file.flush())
            .and_then(|()| file.sync_all())
            .map_err(|e| QueueError::io(&tmp, e))?;
        fs::rename(&tmp, &dest).map_err(|e| QueueError::io(&dest, e))
    }

    /// Return up to `limit` entries whose next-attempt time has arrived.
    /// Unreadable entries are logged and skipped for this pass; entries with
    /// an unparseable header are moved to the `dead/` directory.
    pub fn drain(&self, limit: usize, now: u64) -> Vec<QueueEntry> {
        let mut out = Vec::new();
        for handle in self.active_handles() {
            if out.len() >= limit {
                break;
            }
            match self.fetch(&handle) {
                Ok(entry) => {
                    if entry.next_attempt_at <= now {
                        out.push(entry);
                    }
                }
                Err(QueueError::Corrupt { handle, reason }) => {
                    log::error!(
                        "queue({}): quarantining corrupt entry {handle}: {reason}",
                        self.label
                    );
                    self.quarantine(&Handle::from_name(handle));
                }
                Err(err) => {
                    log::error!("queue({}): skipping entry {handle}: {err}", self.label);
                }
            }
        }
        out
    }

    /// Read a single entry by handle.
    pub fn fetch(&self, handle: &Handle) -> Result<QueueEntry, QueueError> {
        let path = self.dir.join(format!("{ACTIVE_PREFIX}{handle}"));
        let file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                QueueError::UnknownHandle(handle.to_string())
            } else {
                QueueError::io(&path, e)
            }
        })?;
        let mut reader = BufReader::new(file);
        match read_entry(&mut reader, handle.clone()) {
            Ok(Ok(entry)) => Ok(entry),
            Ok(Err(reason)) => Err(QueueError::Corrupt { handle: handle.to_string(), reason }),
            Err(e) => Err(QueueError::io(&path, e)),
        }
    }

    /// Mark an entry delivered; it is unlinked on the next `clean`.
    pub fn succeeded(&self, handle: &Handle) -> Result<(), QueueError> {
        self.mark_removed(handle)
    }

    /// Record a failed attempt. Retriable failures below the retry cap are
    /// re-scheduled with backoff; everything else is dropped.
    pub fn failed(&self, handle: &Handle, retriable: bool, now: u64) -> Result<(), QueueError> {
        let entry = self.fetch(handle)?;
        let next_count = entry.retry_count.saturating_add(1);
        if retriable && !self.policy.exhausted(next_count) {
            let delay = self.policy.delay_secs(next_count);
            let header = EntryHeader {
                retry_count: next_count,
                first_queued_at: entry.first_queued_at,
                next_attempt_at: now + delay,
                addr_len: entry.address.len() as u32,
            };
            // Rewrite under the same handle so the identifier stays stable.
            let tmp = self.dir.join(format!("{TEMP_PREFIX}{handle}"));
            let dest = self.dir.join(format!("{ACTIVE_PREFIX}{handle}"));
            let _ = fs::remove_file(&tmp);
            self.write_atomic_over(&tmp, &dest, &header, &entry.address, &entry.payload)?;
            log::debug!(
                "queue({}): retry {} for {} in {}s",
                self.label,
                next_count,
                handle,
                delay
            );
            Ok(())
        } else {
            if retriable {
                log::warn!(
                    "queue({}): dropping {} after {} attempts",
                    self.label,
                    handle,
                    entry.retry_count
                );
            } else {
                log::warn!("queue({}): dropping undeliverable entry {}", self.label, handle);
            }
            self.mark_removed(handle)
        }
    }

    fn write_atomic_over(
        &self,
        tmp: &Path,
        dest: &Path,
        header: &EntryHeader,
        address: &[u8],
        payload: &[u8],
    ) -> Result<(), QueueError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(tmp)
            .map_err(|e| QueueError::io(tmp, e))?;
        write_entry(&mut file, header, address, payload)
            .and_then(|()| file.flush())
            .and_then(|()| file.sync_all())
            .map_err(|e| QueueError::io(tmp, e))?;
        fs::rename(tmp, dest).map_err(|e| QueueError::io(dest, e))
    }

    pub fn count(&self) -> usize {
        self.active_handles().len()
    }

    /// Unlink removed entries and stale temporaries.
    pub fn clean(&self) {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                log::error!("queue({}): clean failed to list dir: {err}", self.label);
                return;
            }
        };
        for item in entries.flatten() {
            let name = item.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(REMOVED_PREFIX) || name.starts_with(TEMP_PREFIX) {
                if let Err(err) = fs::remove_file(item.path()) {
                    log::error!("queue({}): clean failed to unlink {name}: {err}", self.label);
                }
            }
        }
    }

    fn mark_removed(&self, handle: &Handle) -> Result<(), QueueError> {
        let src = self.dir.join(format!("{ACTIVE_PREFIX}{handle}"));
        let dst = self.dir.join(format!("{REMOVED_PREFIX}{handle}"));
        fs::rename(&src, &dst).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                QueueError::UnknownHandle(handle.to_string())
            } else {
                QueueError::io(&src, e)
            }
        })
    }

    fn quarantine(&self, handle: &Handle) {
        let src = self.dir.join(format!("{ACTIVE_PREFIX}{handle}"));
        let dst = self.dir.join(DEAD_DIR).join(format!("{ACTIVE_PREFIX}{handle}"));
        if let Err(err) = fs::rename(&src, &dst) {
            log::error!("queue({}): failed to quarantine {handle}: {err}", self.label);
        }
    }

    fn active_handles(&self) -> Vec<Handle> {
        let mut handles = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                log::error!("queue({}): failed to list dir: {err}", self.label);
                return handles;
            }
        };
        for item in entries.flatten() {
            let name = item.file_name();
            let name = name.to_string_lossy();
            if let Some(raw) = name.strip_prefix(ACTIVE_PREFIX) {
                handles.push(Handle::from_name(raw.to_string()));
            }
        }
        handles
    }
}
