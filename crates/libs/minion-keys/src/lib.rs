//! Server key material: per-interval key sets with signed descriptors, the
//! rotating key ring that schedules them, and the long-lived identity key.

mod descriptor;
mod keyring;
mod keyset;

pub use descriptor::ServerDesc;
pub use keyring::{KeyInterval, KeyRing, KeyRingConfig, KeySchedule};
pub use keyset::{KeysetParams, ServerKeyset, CERT_LEN};

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bad descriptor: {0}")]
    Descriptor(String),
    #[error("bad key material in {path}: {reason}")]
    Material { path: PathBuf, reason: String },
    #[error("no server key is live")]
    NoLiveKey,
}

impl KeyError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

pub const SECONDS_PER_DAY: u64 = 86_400;

/// Round a unix timestamp down to the previous UTC midnight.
pub fn previous_midnight(t: u64) -> u64 {
    t - t % SECONDS_PER_DAY
}

/// Format a unix timestamp as a UTC calendar date for log lines.
pub fn format_date(t: u64) -> String {
    let Ok(dt) = time::OffsetDateTime::from_unix_timestamp(t as i64) else {
        return format!("@{t}");
    };
    format!("{:04}-{:02}-{:02}", dt.year(), u8::from(dt.month()), dt.day())
}

/// Overwrite a file with zeros before unlinking it.
pub fn secure_delete(path: &Path) -> Result<(), KeyError> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(KeyError::io(path, err)),
    };
    let mut file =
        OpenOptions::new().write(true).open(path).map_err(|e| KeyError::io(path, e))?;
    let zeros = vec![0u8; len.min(1 << 16) as usize];
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(zeros.len() as u64) as usize;
        file.write_all(&zeros[..chunk]).map_err(|e| KeyError::io(path, e))?;
        remaining -= chunk as u64;
    }
    file.sync_all().map_err(|e| KeyError::io(path, e))?;
    drop(file);
    fs::remove_file(path).map_err(|e| KeyError::io(path, e))
}

/// Create a directory (and parents) readable only by the owner.
pub fn create_private_dir(path: &Path) -> Result<(), KeyError> {
    fs::create_dir_all(path).map_err(|e| KeyError::io(path, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o700);
        fs::set_permissions(path, perms).map_err(|e| KeyError::io(path, e))?;
    }
    Ok(())
}

pub(crate) fn write_private_file(path: &Path, bytes: &[u8]) -> Result<(), KeyError> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(|e| KeyError::io(path, e))?;
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .map_err(|e| KeyError::io(path, e))
}

pub(crate) fn read_exact_file<const N: usize>(path: &Path) -> Result<[u8; N], KeyError> {
    let bytes = fs::read(path).map_err(|e| KeyError::io(path, e))?;
    bytes.as_slice().try_into().map_err(|_| KeyError::Material {
        path: path.to_path_buf(),
        reason: format!("expected {N} bytes, got {}", bytes.len()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn previous_midnight_floors_to_day() {
        assert_eq!(previous_midnight(0), 0);
        assert_eq!(previous_midnight(86_399), 0);
        assert_eq!(previous_midnight(86_400), 86_400);
        assert_eq!(previous_midnight(1_700_000_000), 1_699_920_000);
    }

    #[test]
    fn format_date_is_calendar_utc() {
        assert_eq!(format_date(0), "1970-01-01");
        assert_eq!(format_date(86_400), "1970-01-02");
    }

    #[test]
    fn secure_delete_removes_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("secret");
        fs::write(&path, vec![0xAB; 100_000]).expect("write");
        secure_delete(&path).expect("secure delete");
        assert!(!path.exists());
    }

    #[test]
    fn secure_delete_of_missing_file_is_ok() {
        let tmp = tempfile::tempdir().expect("tempdir");
        secure_delete(&tmp.path().join("never-existed")).expect("no-op");
    }
}
