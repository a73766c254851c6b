use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::QueueError;

pub const DIGEST_LEN: usize = 32;

/// Append-only persistent set of packet digests, used to reject replays.
///
/// Digests are buffered in memory and on an unsynced writer until `sync` is
/// called; the server loop syncs once per mix interval, before acting on the
/// batch, so a crash cannot cause a packet to be processed twice with
/// different outcomes.
pub struct HashLog {
    path: PathBuf,
    seen: HashSet<[u8; DIGEST_LEN]>,
    writer: BufWriter<File>,
}

impl HashLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| QueueError::io(parent, e))?;
        }

        let mut seen = HashSet::new();
        match File::open(&path) {
            Ok(mut file) => {
                let mut bytes = Vec::new();
                file.read_to_end(&mut bytes).map_err(|e| QueueError::io(&path, e))?;
                let whole = bytes.len() - bytes.len() % DIGEST_LEN;
                if whole != bytes.len() {
                    // A torn final record from a crash before sync; the packet
                    // it belonged to is still queued and will be re-logged.
                    log::warn!(
                        "hashlog {}: ignoring {} trailing bytes",
                        path.display(),
                        bytes.len() - whole
                    );
                }
                for chunk in bytes[..whole].chunks_exact(DIGEST_LEN) {
                    let mut digest = [0u8; DIGEST_LEN];
                    digest.copy_from_slice(chunk);
                    seen.insert(digest);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(QueueError::io(&path, err)),
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| QueueError::io(&path, e))?;
        log::debug!("hashlog {}: {} digests loaded", path.display(), seen.len());
        Ok(Self { path, seen, writer: BufWriter::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, digest: &[u8; DIGEST_LEN]) -> bool {
        self.seen.contains(digest)
    }

    pub fn add(&mut self, digest: [u8; DIGEST_LEN]) -> Result<(), QueueError> {
        if !self.seen.insert(digest) {
            return Ok(());
        }
        self.writer.write_all(&digest).map_err(|e| QueueError::io(&self.path, e))
    }

    /// Flush and fsync. This is the durable replay-prevention barrier.
    pub fn sync(&mut self) -> Result<(), QueueError> {
        self.writer.flush().map_err(|e| QueueError::io(&self.path, e))?;
        self.writer.get_ref().sync_all().map_err(|e| QueueError::io(&self.path, e))
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn close(mut self) -> Result<(), QueueError> {
        self.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(fill: u8) -> [u8; DIGEST_LEN] {
        [fill; DIGEST_LEN]
    }

    #[test]
    fn added_digests_are_contained() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut log = HashLog::open(tmp.path().join("hash_0001")).expect("open");
        assert!(!log.contains(&digest(1)));
        log.add(digest(1)).expect("add");
        assert!(log.contains(&digest(1)));
    }

    #[test]
    fn synced_digests_survive_reopen() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("hash_0001");
        {
            let mut log = HashLog::open(&path).expect("open");
            log.add(digest(7)).expect("add");
            log.add(digest(8)).expect("add");
            log.sync().expect("sync");
        }
        let log = HashLog::open(&path).expect("reopen");
        assert_eq!(log.len(), 2);
        assert!(log.contains(&digest(7)));
        assert!(log.contains(&digest(8)));
    }

    #[test]
    fn duplicate_add_writes_once() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("hash_0001");
        let mut log = HashLog::open(&path).expect("open");
        log.add(digest(3)).expect("add");
        log.add(digest(3)).expect("re-add");
        log.sync().expect("sync");
        let size = fs::metadata(&path).expect("metadata").len();
        assert_eq!(size as usize, DIGEST_LEN);
    }

    #[test]
    fn torn_trailing_record_is_ignored() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("hash_0001");
        {
            let mut log = HashLog::open(&path).expect("open");
            log.add(digest(9)).expect("add");
            log.sync().expect("sync");
        }
        let mut file = OpenOptions::new().append(true).open(&path).expect("append");
        file.write_all(&[0xAA; 5]).expect("tear");
        drop(file);

        let log = HashLog::open(&path).expect("reopen");
        assert_eq!(log.len(), 1);
        assert!(log.contains(&digest(9)));
    }
}
