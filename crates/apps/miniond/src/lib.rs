//! The relay daemon: config, the packet-processing pipeline (incoming queue,
//! mix pool, outgoing queue), exit-delivery modules, transport glue, and the
//! server loop that drives them.

pub mod config;
pub mod handler;
pub mod incoming;
pub mod mixpool;
pub mod modules;
pub mod outgoing;
pub mod server;
pub mod transport;

use minion_queue::QueueError;
use thiserror::Error;

/// Faults raised while moving messages between pipeline stages.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("codec error: {0}")]
    Codec(String),
}

/// Wall-clock seconds since the unix epoch.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
