//! File-backed delivery queues.
//!
//! Every queue in the relay pipeline stores one file per entry under its own
//! directory. Entries survive a crash at any point: writes go to a temporary
//! name and are renamed into place, so a recovering process sees either a
//! complete entry or nothing.

mod entry;
mod hashlog;
mod queue;
mod retry;

pub use entry::{EntryHeader, QueueEntry, ENTRY_HEADER_LEN, ENTRY_MAGIC, ENTRY_VERSION};
pub use hashlog::HashLog;
pub use queue::{DurableQueue, Handle};
pub use retry::RetryPolicy;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt entry {handle}: {reason}")]
    Corrupt { handle: String, reason: String },
    #[error("no entry for handle {0}")]
    UnknownHandle(String),
}

impl QueueError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}
