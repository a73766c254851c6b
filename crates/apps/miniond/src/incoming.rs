use std::path::Path;

use minion_queue::{DurableQueue, QueueError, RetryPolicy};
use minion_types::Packet;

use crate::handler::{PacketHandler, ProcessError};
use crate::mixpool::{MixAlgorithm, MixPool};

const DRAIN_BATCH: usize = 128;

/// Outcome of one incoming-queue drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    pub processed: usize,
    pub padding_dropped: usize,
    pub replays: usize,
    pub rejected: usize,
}

/// Durable queue of raw ciphertext packets received from the transport.
/// Draining runs each packet through the handler and routes the resulting
/// decision into the mix pool.
pub struct IncomingQueue {
    queue: DurableQueue,
}

impl IncomingQueue {
    pub fn open(dir: &Path, policy: RetryPolicy) -> Result<Self, QueueError> {
        Ok(Self { queue: DurableQueue::open(dir, policy)? })
    }

    pub fn queue_packet(&self, bytes: &[u8], now: u64) -> Result<(), QueueError> {
        let handle = self.queue.enqueue(&[], bytes, now)?;
        log::trace!("incoming: stored packet as {handle}");
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.queue.count()
    }

    pub fn clean(&self) {
        self.queue.clean();
    }

    /// Process one snapshot of ready packets through the handler and into
    /// the pool. The server loop calls this every network tick, so packets
    /// left behind (or re-scheduled) are picked up on the next pass.
    pub fn drain_into<A: MixAlgorithm>(
        &self,
        handler: &mut PacketHandler,
        pool: &MixPool<A>,
        now: u64,
    ) -> DrainOutcome {
        let mut outcome = DrainOutcome::default();
        for entry in self.queue.drain(DRAIN_BATCH, now) {
            let handle = entry.handle.clone();
            let packet = match Packet::from_bytes(entry.payload) {
                Ok(packet) => packet,
                Err(err) => {
                    log::warn!("incoming: discarding undersized packet: {err}");
                    outcome.rejected += 1;
                    self.report(self.queue.failed(&handle, false, now));
                    continue;
                }
            };
            match handler.process(&packet) {
                Ok(Some(decision)) => match pool.insert(&decision, now) {
                    Ok(_) => {
                        outcome.processed += 1;
                        self.report(self.queue.succeeded(&handle));
                    }
                    Err(err) => {
                        log::error!("incoming: failed to pool decision: {err}");
                        self.report(self.queue.failed(&handle, true, now));
                    }
                },
                Ok(None) => {
                    log::debug!("incoming: padding packet dropped");
                    outcome.padding_dropped += 1;
                    self.report(self.queue.succeeded(&handle));
                }
                Err(ProcessError::Replay) => {
                    outcome.replays += 1;
                    self.report(self.queue.succeeded(&handle));
                }
                Err(ProcessError::Crypto(err)) => {
                    log::warn!("incoming: invalid PK or misencrypted packet header: {err}");
                    outcome.rejected += 1;
                    self.report(self.queue.failed(&handle, false, now));
                }
                Err(ProcessError::Parse(err)) => {
                    log::warn!("incoming: malformed packet dropped: {err}");
                    outcome.rejected += 1;
                    self.report(self.queue.failed(&handle, false, now));
                }
                Err(ProcessError::Content(err)) => {
                    log::warn!("incoming: discarding bad packet: {err}");
                    outcome.rejected += 1;
                    self.report(self.queue.failed(&handle, false, now));
                }
                Err(ProcessError::Log(err)) => {
                    // The replay log could not record the packet; keep it
                    // queued rather than risk processing it twice.
                    log::error!("incoming: hash log write failed: {err}");
                    self.report(self.queue.failed(&handle, true, now));
                }
            }
        }
        outcome
    }

    fn report(&self, result: Result<(), QueueError>) {
        if let Err(err) = result {
            log::error!("incoming: queue bookkeeping failed: {err}");
        }
    }
}
