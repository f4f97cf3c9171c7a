//! Single background classification worker fed by a keep-latest slot.
//!
//! Producers never block. The pending slot is a `bounded(1)` channel: when a
//! frame is already waiting, the producer evicts it and puts the newer one in
//! its place, so at most one item waits while one is being classified.

use std::{
    io,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded, select};
use ml_core::PreprocessedImage;
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

use crate::pipeline::{engine::EngineManager, publisher::ResultPublisher, telemetry};

const WORKER_THREAD_NAME: &str = "classify-worker";
/// Evict-and-retry rounds before a submit gives up on a contended slot.
const SUBMIT_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum ThreadLifecycleError {
    #[error("failed to spawn {name} thread")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("classification worker did not stop within {timeout:?}")]
    TeardownTimeout { timeout: Duration },
    #[error("classification worker panicked")]
    WorkerPanicked,
    #[error("a previous classification worker is still running")]
    StaleWorker,
}

/// What happened to a submitted frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Placed into the empty slot.
    Queued,
    /// Placed into the slot after evicting an older pending frame.
    Replaced,
    /// The slot stayed contended; this frame was dropped.
    Dropped,
    /// The scheduler is quiescing and accepts no work.
    Rejected,
}

/// Cumulative counters, shareable across scheduler restarts.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    submitted: AtomicU64,
    superseded: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    classified: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
    skipped_no_engine: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub superseded: u64,
    /// New frames given up on because the slot stayed contended.
    pub dropped: u64,
    pub rejected: u64,
    pub classified: u64,
    pub failed: u64,
    pub discarded: u64,
    pub skipped_no_engine: u64,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            classified: self.classified.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            skipped_no_engine: self.skipped_no_engine.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Pending {
    image: PreprocessedImage,
    timestamp_ms: i64,
}

struct Shared {
    slot_tx: Sender<Pending>,
    slot_rx: Receiver<Pending>,
    quiescing: AtomicBool,
    /// Held while checking `quiescing` and publishing, and while setting it.
    publishing: Mutex<()>,
    in_flight: AtomicBool,
    stats: Arc<SchedulerStats>,
}

/// Cheap handle producers use to feed the scheduler from any thread.
#[derive(Clone)]
pub struct Submitter {
    shared: Arc<Shared>,
}

impl Submitter {
    /// Offer a frame without blocking. Newer frames replace a pending one.
    pub fn submit(&self, image: PreprocessedImage, timestamp_ms: i64) -> SubmitOutcome {
        let shared = &self.shared;
        if shared.quiescing.load(Ordering::Acquire) {
            SchedulerStats::bump(&shared.stats.rejected);
            metrics::counter!("classify_frames_rejected_total").increment(1);
            return SubmitOutcome::Rejected;
        }

        SchedulerStats::bump(&shared.stats.submitted);
        metrics::counter!("classify_frames_submitted_total").increment(1);

        let mut item = Pending {
            image,
            timestamp_ms,
        };
        let mut replaced = false;
        for _ in 0..SUBMIT_ATTEMPTS {
            match shared.slot_tx.try_send(item) {
                Ok(()) if replaced => return SubmitOutcome::Replaced,
                Ok(()) => return SubmitOutcome::Queued,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    if let Ok(stale) = shared.slot_rx.try_recv() {
                        debug!("Superseding pending frame at {}", stale.timestamp_ms);
                        SchedulerStats::bump(&shared.stats.superseded);
                        metrics::counter!("classify_frames_superseded_total").increment(1);
                        replaced = true;
                    }
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
        }

        debug!("Dropping frame at {timestamp_ms}; pending slot stayed contended");
        SchedulerStats::bump(&shared.stats.dropped);
        metrics::counter!("classify_frames_dropped_total").increment(1);
        SubmitOutcome::Dropped
    }
}

/// Owns the classification worker thread and its quiesce/join contract.
pub struct ClassificationScheduler {
    shared: Arc<Shared>,
    stop_tx: Option<Sender<()>>,
    exited_rx: Receiver<()>,
    worker: Option<JoinHandle<()>>,
}

impl ClassificationScheduler {
    pub fn start(
        engines: Arc<EngineManager>,
        publisher: Arc<ResultPublisher>,
    ) -> Result<Self, ThreadLifecycleError> {
        Self::start_with_stats(engines, publisher, Arc::default())
    }

    /// Start a worker that accumulates into existing `stats`.
    pub fn start_with_stats(
        engines: Arc<EngineManager>,
        publisher: Arc<ResultPublisher>,
        stats: Arc<SchedulerStats>,
    ) -> Result<Self, ThreadLifecycleError> {
        let (slot_tx, slot_rx) = bounded::<Pending>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (exited_tx, exited_rx) = bounded::<()>(0);

        let shared = Arc::new(Shared {
            slot_tx,
            slot_rx,
            quiescing: AtomicBool::new(false),
            publishing: Mutex::new(()),
            in_flight: AtomicBool::new(false),
            stats,
        });

        let worker_shared = shared.clone();
        let worker = telemetry::spawn_thread(WORKER_THREAD_NAME, move || {
            // Dropped on exit, including unwinding, which is what `join` waits for.
            let _exited = exited_tx;
            run_worker(&worker_shared, &stop_rx, &engines, &publisher);
        })
        .map_err(|source| ThreadLifecycleError::Spawn {
            name: WORKER_THREAD_NAME,
            source,
        })?;

        info!("Classification worker started");
        Ok(Self {
            shared,
            stop_tx: Some(stop_tx),
            exited_rx,
            worker: Some(worker),
        })
    }

    pub fn submitter(&self) -> Submitter {
        Submitter {
            shared: self.shared.clone(),
        }
    }

    pub fn submit(&self, image: PreprocessedImage, timestamp_ms: i64) -> SubmitOutcome {
        self.submitter().submit(image, timestamp_ms)
    }

    pub fn stats(&self) -> &Arc<SchedulerStats> {
        &self.shared.stats
    }

    /// Nothing pending and nothing being classified.
    pub fn is_idle(&self) -> bool {
        !self.shared.in_flight.load(Ordering::Acquire) && self.shared.slot_rx.is_empty()
    }

    /// Stop accepting work, drop any pending frame and wake the worker.
    ///
    /// A classification already running finishes, but its result is discarded.
    /// Nothing is published once this returns.
    pub fn quiesce(&mut self) {
        {
            let _publishing = self
                .shared
                .publishing
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.shared.quiescing.store(true, Ordering::Release);
        }
        if self.stop_tx.take().is_some() {
            debug!("Quiescing classification worker");
        }
        while self.shared.slot_rx.try_recv().is_ok() {}
    }

    /// Wait up to `timeout` for the worker to exit, then reap it.
    ///
    /// On `TeardownTimeout` the worker is still owned by `self` and `join` can
    /// be retried.
    pub fn join(&mut self, timeout: Duration) -> Result<(), ThreadLifecycleError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        match self.exited_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                self.worker = Some(worker);
                return Err(ThreadLifecycleError::TeardownTimeout { timeout });
            }
        }

        worker
            .join()
            .map_err(|_| ThreadLifecycleError::WorkerPanicked)?;
        debug!("Classification worker joined");
        Ok(())
    }

    /// Whether the worker thread has exited (or was already reaped).
    pub fn is_finished(&self) -> bool {
        self.worker
            .as_ref()
            .is_none_or(|worker| worker.is_finished())
    }
}

impl Drop for ClassificationScheduler {
    fn drop(&mut self) {
        self.quiesce();
    }
}

fn run_worker(
    shared: &Shared,
    stop_rx: &Receiver<()>,
    engines: &EngineManager,
    publisher: &ResultPublisher,
) {
    loop {
        let pending = select! {
            recv(stop_rx) -> _ => break,
            recv(shared.slot_rx) -> msg => match msg {
                Ok(pending) => pending,
                Err(_) => break,
            },
        };
        if shared.quiescing.load(Ordering::Acquire) {
            break;
        }

        shared.in_flight.store(true, Ordering::Release);
        classify(shared, engines, publisher, pending);
        shared.in_flight.store(false, Ordering::Release);
    }
    info!("Classification worker stopped");
}

fn classify(
    shared: &Shared,
    engines: &EngineManager,
    publisher: &ResultPublisher,
    pending: Pending,
) {
    let Pending {
        image,
        timestamp_ms,
    } = pending;
    let span = info_span!("classify.frame", timestamp_ms);
    let _entered = span.enter();

    // A swap waits for this lease, so the engine stays the same for the whole call.
    let Some(engine) = engines.lease() else {
        debug!("No classifier configured; skipping frame");
        SchedulerStats::bump(&shared.stats.skipped_no_engine);
        return;
    };

    let started = Instant::now();
    let outcome = engine.recognize_image(&image);
    metrics::histogram!("classify_inference_latency_seconds")
        .record(started.elapsed().as_secs_f64());
    let engine_id = engine.id();
    drop(engine);

    let result = match outcome {
        Ok(result) => result,
        Err(err) => {
            warn!("Classification on engine {engine_id} failed: {err}");
            SchedulerStats::bump(&shared.stats.failed);
            metrics::counter!("classify_inference_errors_total").increment(1);
            return;
        }
    };
    SchedulerStats::bump(&shared.stats.classified);

    match result.top() {
        Some(top) => debug!("Engine {engine_id}: {top}"),
        None => debug!("Engine {engine_id}: no recognitions"),
    }

    let _publishing = shared
        .publishing
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if shared.quiescing.load(Ordering::Acquire) {
        debug!("Discarding result for frame at {timestamp_ms}; worker is quiescing");
        SchedulerStats::bump(&shared.stats.discarded);
        metrics::counter!("classify_results_discarded_total").increment(1);
        return;
    }
    publisher.publish(&result, timestamp_ms);
}
