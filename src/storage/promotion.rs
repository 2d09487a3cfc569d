//! Bounded background queue for copying blobs into faster tiers
//!
//! Request handlers enqueue with `try_send` and never wait. A full queue drops the job
//! and counts it; the slowest tier already holds the bytes, so nothing is lost.
//!
//! Every job carries the blob generation seen when it was queued. The worker skips jobs
//! whose id was deleted or stored again since, and undoes a copy when the id is deleted
//! while the copy is in flight, so a promotion never resurrects deleted bytes.

use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BlobMetadata, StorageBackend};

/// Live blob ids and the generation of their latest write or first read.
///
/// Deleting an id retires it; a generation seen before the retire never matches again.
#[derive(Debug, Default)]
pub struct BlobGenerations {
    next: AtomicU64,
    live: Mutex<HashMap<String, Generation>>,
}

#[derive(Debug, Clone, Copy)]
struct Generation {
    current: u64,
    /// Generation of the last write, 0 when the id was only ever read
    written: u64,
}

impl BlobGenerations {
    /// Record a new write of `id`
    pub fn bump(&self, id: &str) -> u64 {
        let generation = self.mint();
        self.lock().insert(
            id.to_string(),
            Generation {
                current: generation,
                written: generation,
            },
        );
        generation
    }

    /// Current generation of `id`, registering ids first seen on a read
    pub fn observe(&self, id: &str) -> u64 {
        let mut live = self.lock();
        if let Some(seen) = live.get(id) {
            return seen.current;
        }
        let generation = self.mint();
        live.insert(
            id.to_string(),
            Generation {
                current: generation,
                written: 0,
            },
        );
        generation
    }

    pub fn current(&self, id: &str) -> Option<u64> {
        self.lock().get(id).map(|g| g.current)
    }

    pub fn is_current(&self, id: &str, generation: u64) -> bool {
        self.current(id) == Some(generation)
    }

    /// Generation of the last write of `id` in this process, 0 if none
    pub fn written(&self, id: &str) -> u64 {
        self.lock().get(id).map_or(0, |g| g.written)
    }

    /// Forget `id`; outstanding generations for it become stale
    pub fn retire(&self, id: &str) {
        self.lock().remove(id);
    }

    /// Forget `id` only if nothing touched it since `generation` was observed
    pub fn retire_if(&self, id: &str, generation: u64) {
        let mut live = self.lock();
        if live.get(id).is_some_and(|g| g.current == generation) {
            live.remove(id);
        }
    }

    fn mint(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Generation>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct PromotionJob {
    pub id: String,
    /// Generation of `id` when the job was queued
    pub generation: u64,
    pub data: Bytes,
    /// Tiers to copy into, fastest first
    pub targets: Vec<Arc<dyn StorageBackend>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PromotionStats {
    pub pending: usize,
    pub completed: u64,
    pub failed: u64,
    pub dropped: u64,
    /// Jobs skipped or undone because the blob was deleted or rewritten meanwhile
    pub stale: u64,
}

#[derive(Default)]
struct Counters {
    pending: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    stale: AtomicU64,
    idle: Notify,
}

pub struct PromotionQueue {
    sender: Mutex<Option<mpsc::Sender<PromotionJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
    generations: Arc<BlobGenerations>,
}

impl PromotionQueue {
    /// Create the queue and spawn its worker on the current Tokio runtime
    pub fn start(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let generations = Arc::new(BlobGenerations::default());
        let worker = tokio::spawn(run_worker(receiver, counters.clone(), generations.clone()));

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            counters,
            generations,
        }
    }

    pub fn generations(&self) -> &BlobGenerations {
        &self.generations
    }

    /// Queue a job without waiting. Returns false when the job was dropped.
    pub fn enqueue(&self, job: PromotionJob) -> bool {
        if job.targets.is_empty() {
            return true;
        }

        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(sender) = sender else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        self.counters.pending.fetch_add(1, Ordering::AcqRel);
        match sender.try_send(job) {
            Ok(()) => true,
            Err(err) => {
                let reason = match err {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "queue closed",
                };
                self.counters.pending.fetch_sub(1, Ordering::AcqRel);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                self.counters.idle.notify_waiters();
                debug!("Dropped promotion job: {}", reason);
                false
            }
        }
    }

    /// Wait until every queued job has been processed
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.counters.idle.notified();
            if self.counters.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting jobs and finish the ones already queued
    pub async fn drain(&self) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        drop(sender);

        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Promotion worker ended abnormally: {}", e);
            }
            let stats = self.stats();
            info!(
                "Promotion queue drained: {} completed, {} failed, {} dropped",
                stats.completed, stats.failed, stats.dropped
            );
        }
    }

    pub fn stats(&self) -> PromotionStats {
        PromotionStats {
            pending: self.counters.pending.load(Ordering::Acquire),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            stale: self.counters.stale.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker(
    mut receiver: mpsc::Receiver<PromotionJob>,
    counters: Arc<Counters>,
    generations: Arc<BlobGenerations>,
) {
    while let Some(job) = receiver.recv().await {
        promote(&job, &counters, &generations).await;
        counters.pending.fetch_sub(1, Ordering::AcqRel);
        counters.idle.notify_waiters();
    }
    debug!("Promotion worker stopped");
}

async fn promote(job: &PromotionJob, counters: &Counters, generations: &BlobGenerations) {
    let metadata = BlobMetadata::with_id(job.id.clone());
    for target in &job.targets {
        if !generations.is_current(&job.id, job.generation) {
            counters.stale.fetch_add(1, Ordering::Relaxed);
            debug!("Skipping promotion of blob {}: deleted or rewritten", job.id);
            return;
        }

        if let Err(e) = target.store(job.data.clone(), &metadata).await {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!("Promotion of blob {} into {} tier failed: {}", job.id, target.name(), e);
            continue;
        }

        // A delete that ran during the copy has already swept this tier
        if generations.current(&job.id).is_none() {
            counters.stale.fetch_add(1, Ordering::Relaxed);
            match target.delete(&job.id).await {
                Err(e) if !e.is_not_found() => {
                    warn!("Undoing promotion of deleted blob {} failed: {}", job.id, e);
                }
                _ => {}
            }
            return;
        }

        counters.completed.fetch_add(1, Ordering::Relaxed);
        debug!("Promoted blob {} into {} tier", job.id, target.name());
    }
}
