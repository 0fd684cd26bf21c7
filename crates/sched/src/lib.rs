//! Spill scheduler: dedup cache, job queue, coalescing wakeup, drain loop.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, OnceLock};

use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use spill_core::{ContentHash, Job, OriginKey};
use spill_host::SheetHost;
use spill_inject::Injector;
use tokio::sync::{watch, Notify};
use tracing::{debug, info};

/// Last accepted content hash per origin. Entries are overwritten, never
/// removed; growth is bounded by the distinct origins seen in-process.
#[derive(Default)]
pub struct DedupCache {
    last: Mutex<FxHashMap<OriginKey, ContentHash>>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check-and-set in one critical section. Returns `false` (recording
    /// nothing) when `hash` is already the last accepted for `key`,
    /// otherwise records it and returns `true`.
    pub fn should_accept(&self, key: OriginKey, hash: ContentHash) -> bool {
        let mut last = self.last.lock().unwrap();
        if last.get(&key) == Some(&hash) {
            counter!("dedup_suppressed_total", 1u64);
            return false;
        }
        last.insert(key, hash);
        true
    }

    pub fn len(&self) -> usize {
        self.last.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// FIFO queue of pending jobs. Producers append under lock; the drain side
/// swaps the whole backing vector out, so injection work never holds it.
#[derive(Default)]
pub struct JobQueue {
    pending: Mutex<Vec<Job>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, job: Job) {
        self.pending.lock().unwrap().push(job);
        counter!("queue_enqueued_total", 1u64);
    }

    /// Atomically empty the queue, returning its contents in enqueue order.
    /// The lock is released before the caller touches any job.
    pub fn drain_all(&self) -> Vec<Job> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One-shot coalescing wakeup for the drain loop. The endpoint is created
/// once, on first use; redundant requests between drains collapse into a
/// single stored permit, so the loop wakes at least once more and processes
/// whatever is queued.
#[derive(Default)]
pub struct Wakeup {
    endpoint: OnceLock<Arc<Notify>>,
}

impl Wakeup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the endpoint if it does not exist yet and return it.
    pub fn ensure_endpoint(&self) -> Arc<Notify> {
        self.endpoint.get_or_init(|| Arc::new(Notify::new())).clone()
    }

    /// Ask the drain loop to run at its next opportunity. Non-blocking.
    pub fn request(&self) {
        self.ensure_endpoint().notify_one();
        counter!("wakeup_requested_total", 1u64);
    }
}

/// Controls a spawned drain loop.
pub struct DrainHandle {
    task: tokio::task::JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl DrainHandle {
    /// Stop the loop. Pending jobs are dropped without injection; an
    /// injection already in flight finishes first.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

/// Spawn the drain loop: the execution context that owns document mutation
/// rights. Each wakeup drains the whole queue and injects job by job, in
/// enqueue order.
pub fn spawn_drain(
    queue: Arc<JobQueue>,
    wakeup: &Wakeup,
    host: Arc<dyn SheetHost>,
    injector: Injector,
) -> DrainHandle {
    let notify = wakeup.ensure_endpoint();
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        info!("drain loop started");
        loop {
            tokio::select! {
                _ = notify.notified() => {
                    let batch = queue.drain_all();
                    if batch.is_empty() {
                        continue;
                    }
                    let t0 = std::time::Instant::now();
                    let n = batch.len();
                    for job in batch {
                        injector.inject(host.as_ref(), job);
                    }
                    histogram!("drain_batch_ms", t0.elapsed().as_secs_f64() * 1000.0);
                    debug!(jobs = n, "drain cycle done");
                }
                _ = stop_rx.changed() => {
                    let dropped = queue.drain_all().len();
                    if dropped > 0 {
                        debug!(dropped, "pending jobs dropped at shutdown");
                    }
                    break;
                }
            }
        }
        info!("drain loop stopped");
    });
    DrainHandle { task, stop: stop_tx }
}
