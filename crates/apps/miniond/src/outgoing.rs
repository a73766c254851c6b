use std::collections::HashMap;
use std::path::Path;

use minion_queue::{DurableQueue, QueueEntry, RetryPolicy};
use minion_types::{Packet, RelayEndpoint};

use crate::transport::MmtpClient;
use crate::PipelineError;

const FLUSH_BATCH: usize = 256;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    pub sent: usize,
    pub retried: usize,
    pub dropped: usize,
}

/// Durable queue of packets awaiting transport to other relays, batched by
/// destination endpoint.
pub struct OutgoingQueue {
    queue: DurableQueue,
}

impl OutgoingQueue {
    pub fn open(dir: &Path, policy: RetryPolicy) -> Result<Self, PipelineError> {
        Ok(Self { queue: DurableQueue::open(dir, policy)? })
    }

    pub fn enqueue(
        &self,
        peer: &RelayEndpoint,
        packet: &Packet,
        now: u64,
    ) -> Result<(), PipelineError> {
        let address = rmp_serde::to_vec(peer).map_err(|e| PipelineError::Codec(e.to_string()))?;
        let handle = self.queue.enqueue(&address, packet.as_bytes(), now)?;
        log::trace!("outgoing: queued packet {handle} for {peer}");
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.queue.count()
    }

    pub fn clean(&self) {
        self.queue.clean();
    }

    /// Send every ready entry, one transport call per destination bucket.
    /// Timeouts and refusals re-schedule the batch; a peer that rejects our
    /// authentication drops it.
    pub async fn flush(&self, client: &mut dyn MmtpClient, now: u64) -> FlushStats {
        let mut stats = FlushStats::default();
        let mut buckets: HashMap<Vec<u8>, Vec<QueueEntry>> = HashMap::new();
        for entry in self.queue.drain(FLUSH_BATCH, now) {
            buckets.entry(entry.address.clone()).or_default().push(entry);
        }

        for (address, mut batch) in buckets {
            // FIFO within the bucket.
            batch.sort_by_key(|e| (e.first_queued_at, e.handle.as_str().to_string()));

            let peer: RelayEndpoint = match rmp_serde::from_slice(&address) {
                Ok(peer) => peer,
                Err(err) => {
                    log::error!("outgoing: dropping batch with unreadable address: {err}");
                    for entry in &batch {
                        self.report(self.queue.failed(&entry.handle, false, now));
                        stats.dropped += 1;
                    }
                    continue;
                }
            };

            let mut packets = Vec::with_capacity(batch.len());
            let mut handles = Vec::with_capacity(batch.len());
            for entry in batch {
                match Packet::from_bytes(entry.payload) {
                    Ok(packet) => {
                        packets.push(packet);
                        handles.push(entry.handle);
                    }
                    Err(err) => {
                        log::error!("outgoing: dropping malformed stored packet: {err}");
                        self.report(self.queue.failed(&entry.handle, false, now));
                        stats.dropped += 1;
                    }
                }
            }
            if packets.is_empty() {
                continue;
            }

            match client.send_batch(&peer, &packets).await {
                Ok(()) => {
                    log::debug!("outgoing: sent {} packets to {peer}", packets.len());
                    stats.sent += packets.len();
                    for handle in &handles {
                        self.report(self.queue.succeeded(handle));
                    }
                }
                Err(err) => {
                    let retriable = err.is_retriable();
                    log::warn!(
                        "outgoing: send to {peer} failed ({err}); {}",
                        if retriable { "will retry" } else { "dropping" }
                    );
                    for handle in &handles {
                        self.report(self.queue.failed(handle, retriable, now));
                        if retriable {
                            stats.retried += 1;
                        } else {
                            stats.dropped += 1;
                        }
                    }
                }
            }
        }
        stats
    }

    fn report(&self, result: Result<(), minion_queue::QueueError>) {
        if let Err(err) = result {
            log::error!("outgoing: queue bookkeeping failed: {err}");
        }
    }
}
