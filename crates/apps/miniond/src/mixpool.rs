use std::path::Path;

use minion_queue::{DurableQueue, Handle, RetryPolicy};
use minion_types::RoutingDecision;
use rand_core::{OsRng, RngCore};

use crate::modules::ModuleManager;
use crate::outgoing::OutgoingQueue;
use crate::PipelineError;

/// The batching strategy behind the mix pool. Implementations own durable
/// storage for pending decisions; `select_batch` decides what this tick
/// releases.
pub trait MixAlgorithm {
    fn insert(&self, decision: &RoutingDecision, now: u64) -> Result<Handle, PipelineError>;
    fn select_batch(&self, now: u64) -> Vec<Handle>;
    fn fetch(&self, handle: &Handle) -> Result<RoutingDecision, PipelineError>;
    fn discard(&self, handle: &Handle) -> Result<(), PipelineError>;
    fn count(&self) -> usize;
    fn clean(&self);
}

/// Baseline algorithm: release everything that has been resident for at
/// least one mix interval, shuffled uniformly at random.
pub struct TimedMix {
    queue: DurableQueue,
    interval_secs: u64,
}

impl TimedMix {
    pub fn open(dir: &Path, interval_secs: u64) -> Result<Self, PipelineError> {
        Ok(Self { queue: DurableQueue::open(dir, RetryPolicy::default())?, interval_secs })
    }
}

impl MixAlgorithm for TimedMix {
    fn insert(&self, decision: &RoutingDecision, now: u64) -> Result<Handle, PipelineError> {
        let payload =
            rmp_serde::to_vec(decision).map_err(|e| PipelineError::Codec(e.to_string()))?;
        Ok(self.queue.enqueue(&[], &payload, now)?)
    }

    fn select_batch(&self, now: u64) -> Vec<Handle> {
        let mut handles: Vec<Handle> = self
            .queue
            .drain(usize::MAX, now)
            .into_iter()
            .filter(|e| e.first_queued_at + self.interval_secs <= now)
            .map(|e| e.handle)
            .collect();
        shuffle(&mut handles);
        handles
    }

    fn fetch(&self, handle: &Handle) -> Result<RoutingDecision, PipelineError> {
        let entry = self.queue.fetch(handle)?;
        rmp_serde::from_slice(&entry.payload).map_err(|e| PipelineError::Codec(e.to_string()))
    }

    fn discard(&self, handle: &Handle) -> Result<(), PipelineError> {
        Ok(self.queue.succeeded(handle)?)
    }

    fn count(&self) -> usize {
        self.queue.count()
    }

    fn clean(&self) {
        self.queue.clean();
    }
}

fn shuffle(handles: &mut [Handle]) {
    for i in (1..handles.len()).rev() {
        let j = (OsRng.next_u64() % (i as u64 + 1)) as usize;
        handles.swap(i, j);
    }
}

/// Counts from one mix tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MixStats {
    pub released: usize,
    pub relayed: usize,
    pub exited: usize,
}

/// Detains routing decisions and, on each mix tick, distributes the selected
/// batch to the outgoing queue and the module manager.
pub struct MixPool<A: MixAlgorithm> {
    algorithm: A,
}

impl<A: MixAlgorithm> MixPool<A> {
    pub fn new(algorithm: A) -> Self {
        Self { algorithm }
    }

    pub fn insert(&self, decision: &RoutingDecision, now: u64) -> Result<Handle, PipelineError> {
        log::trace!("pool: inserting decision");
        self.algorithm.insert(decision, now)
    }

    pub fn count(&self) -> usize {
        self.algorithm.count()
    }

    pub fn clean(&self) {
        self.algorithm.clean();
    }

    /// Release this tick's batch. Routing faults are logged, not retried:
    /// the pool has already committed to releasing the message.
    pub async fn mix(
        &self,
        outgoing: &OutgoingQueue,
        modules: &mut ModuleManager,
        now: u64,
    ) -> MixStats {
        let handles = self.algorithm.select_batch(now);
        let mut stats = MixStats { released: handles.len(), ..MixStats::default() };
        log::debug!("pool: mixing {} messages out of {}", handles.len(), self.algorithm.count());

        for handle in handles {
            match self.algorithm.fetch(&handle) {
                Ok(RoutingDecision::Relay { peer, inner }) => {
                    log::trace!("pool: sending message to relay {peer}");
                    match outgoing.enqueue(&peer, &inner, now) {
                        Ok(_) => stats.relayed += 1,
                        Err(err) => log::error!("pool: failed to queue for {peer}: {err}"),
                    }
                }
                Ok(RoutingDecision::Exit { exit_type, exit_info, tag, payload, .. }) => {
                    log::trace!("pool: sending message to exit modules");
                    let tag = tag.as_deref().map(|t| t.to_vec());
                    match modules
                        .accept(&payload, tag.as_deref(), exit_type, &exit_info, now)
                        .await
                    {
                        Ok(()) => stats.exited += 1,
                        Err(err) => {
                            log::error!("pool: exit dispatch failed for {exit_type:#06x}: {err}");
                        }
                    }
                }
                Ok(RoutingDecision::Drop) => {
                    log::debug!("pool: discarding padding decision");
                }
                Err(err) => log::error!("pool: unreadable batch entry {handle}: {err}"),
            }
            if let Err(err) = self.algorithm.discard(&handle) {
                log::error!("pool: failed to discard {handle}: {err}");
            }
        }
        stats
    }
}
