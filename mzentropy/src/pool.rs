//! A bounded-channel worker pool for batch searches.
//!
//! Queries are embarrassingly parallel: workers share nothing but the
//! read-only [`LibraryIndex`], and completion order carries no meaning.
//! The pool owns its lifecycle explicitly. Work arrives as
//! [`WorkerMessage`] values on a bounded channel (submitters block when it
//! fills), results leave on a separate channel as [`JobOutcome`] values
//! keyed by scan id, and shutdown happens by one sentinel per worker.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::index::LibraryIndex;
use crate::search::{search_one, QuerySpectrum, SearchParameters, SpectrumMatch};

/// Depth of the job queue shared by all workers
pub const JOB_QUEUE_DEPTH: usize = 1024;

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A progress snapshot of a build or batch search, polled by callers.
///
/// `ready` flips on once every query has been read (results may still be
/// arriving); `running` covers the whole batch; `error` comes with a
/// human-readable `message`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchStatus {
    pub ready: bool,
    pub running: bool,
    pub error: bool,
    pub message: String,
}

/// Cloneable handle to a shared [`SearchStatus`]. Updates are best-effort
/// status reporting only, never load-bearing for correctness.
#[derive(Debug, Clone, Default)]
pub struct StatusHandle(Arc<Mutex<SearchStatus>>);

impl StatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SearchStatus {
        self.0
            .lock()
            .map(|status| status.clone())
            .unwrap_or_default()
    }

    pub fn update(&self, f: impl FnOnce(&mut SearchStatus)) {
        if let Ok(mut status) = self.0.lock() {
            f(&mut status);
        }
    }

    pub fn set_message(&self, message: impl Into<String>) {
        self.update(|status| status.message = message.into());
    }

    pub fn set_error(&self, message: impl Into<String>) {
        self.update(|status| {
            status.ready = false;
            status.running = false;
            status.error = true;
            status.message = message.into();
        });
    }
}

/// Control-plane message consumed by workers.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Job(QuerySpectrum),
    Shutdown,
}

/// The result of one unit of work. A failure covers exactly one query and
/// never aborts the batch.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Success {
        scan_id: usize,
        matches: Vec<SpectrumMatch>,
    },
    Failure {
        scan_id: usize,
        error: String,
    },
}

impl JobOutcome {
    pub fn scan_id(&self) -> usize {
        match self {
            JobOutcome::Success { scan_id, .. } => *scan_id,
            JobOutcome::Failure { scan_id, .. } => *scan_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("the worker pool is no longer accepting work")]
    Closed,
}

fn describe_panic(cause: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = cause.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = cause.downcast_ref::<String>() {
        message.clone()
    } else {
        "scoring panicked".to_string()
    }
}

fn worker_loop(
    worker_id: usize,
    jobs: Receiver<WorkerMessage>,
    outcomes: Sender<JobOutcome>,
    index: Arc<LibraryIndex>,
    params: Arc<SearchParameters>,
) {
    debug!("Search worker {worker_id} started");
    for message in jobs.iter() {
        let query = match message {
            WorkerMessage::Job(query) => query,
            WorkerMessage::Shutdown => break,
        };
        let scan_id = query.scan_id;
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| {
            search_one(&query, &index, &params)
        })) {
            Ok(matches) => JobOutcome::Success { scan_id, matches },
            Err(cause) => JobOutcome::Failure {
                scan_id,
                error: describe_panic(cause),
            },
        };
        if outcomes.send(outcome).is_err() {
            break;
        }
    }
    debug!("Search worker {worker_id} exiting");
}

/// An explicit worker-pool object: construct, submit, then either
/// [`SearchPool::finish`] or [`SearchPool::cancel`].
pub struct SearchPool {
    job_tx: Sender<WorkerMessage>,
    /// Kept so cancellation can drain jobs the workers never picked up
    job_rx: Receiver<WorkerMessage>,
    outcome_rx: Receiver<JobOutcome>,
    workers: Vec<JoinHandle<()>>,
    submitted: usize,
    received: usize,
    closed: bool,
}

impl SearchPool {
    pub fn new(
        index: Arc<LibraryIndex>,
        params: Arc<SearchParameters>,
        worker_count: usize,
    ) -> Self {
        let worker_count = worker_count.max(1);
        let (job_tx, job_rx) = bounded(JOB_QUEUE_DEPTH);
        let (outcome_tx, outcome_rx) = unbounded();

        let workers = (0..worker_count)
            .map(|worker_id| {
                let jobs = job_rx.clone();
                let outcomes = outcome_tx.clone();
                let index = Arc::clone(&index);
                let params = Arc::clone(&params);
                thread::Builder::new()
                    .name(format!("search-worker-{worker_id}"))
                    .spawn(move || worker_loop(worker_id, jobs, outcomes, index, params))
                    .expect("failed to spawn search worker")
            })
            .collect();

        Self {
            job_tx,
            job_rx,
            outcome_rx,
            workers,
            submitted: 0,
            received: 0,
            closed: false,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn submitted(&self) -> usize {
        self.submitted
    }

    pub fn received(&self) -> usize {
        self.received
    }

    /// Queue one query. Blocks when the job queue is full.
    pub fn submit(&mut self, query: QuerySpectrum) -> Result<(), PoolError> {
        if self.closed {
            return Err(PoolError::Closed);
        }
        self.job_tx
            .send(WorkerMessage::Job(query))
            .map_err(|_| PoolError::Closed)?;
        self.submitted += 1;
        Ok(())
    }

    /// Signal that no more work is coming: one shutdown sentinel per worker.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for _ in 0..self.workers.len() {
            let _ = self.job_tx.send(WorkerMessage::Shutdown);
        }
    }

    /// Receive an outcome without blocking, if one is waiting.
    pub fn try_outcome(&mut self) -> Option<JobOutcome> {
        if self.received >= self.submitted {
            return None;
        }
        match self.outcome_rx.try_recv() {
            Ok(outcome) => {
                self.received += 1;
                Some(outcome)
            }
            Err(_) => None,
        }
    }

    /// Receive the next outcome, blocking until one arrives or every
    /// dispatched job has already been accounted for.
    pub fn next_outcome(&mut self) -> Option<JobOutcome> {
        if self.received >= self.submitted {
            return None;
        }
        match self.outcome_rx.recv() {
            Ok(outcome) => {
                self.received += 1;
                Some(outcome)
            }
            Err(_) => None,
        }
    }

    /// Close the pool, drain every outstanding outcome, and join the
    /// workers.
    pub fn finish(mut self) -> Vec<JobOutcome> {
        self.close();
        let mut outcomes = Vec::with_capacity(self.submitted - self.received);
        while let Some(outcome) = self.next_outcome() {
            outcomes.push(outcome);
        }
        self.join_all();
        outcomes
    }

    /// Abort the batch: discard jobs no worker has picked up, unblock the
    /// workers, and join them within `timeout`. Outcomes already produced
    /// are returned; they remain valid. Workers that fail to stop in time
    /// are detached with a warning, never joined from here again.
    pub fn cancel(mut self, timeout: Duration) -> Vec<JobOutcome> {
        self.closed = true;
        let mut discarded = 0usize;
        while let Ok(message) = self.job_rx.try_recv() {
            if matches!(message, WorkerMessage::Job(_)) {
                discarded += 1;
            }
        }
        self.submitted -= discarded;
        for _ in 0..self.workers.len() {
            let _ = self.job_tx.send(WorkerMessage::Shutdown);
        }

        let deadline = Instant::now() + timeout;
        while !self.workers.iter().all(JoinHandle::is_finished) && Instant::now() < deadline {
            thread::sleep(JOIN_POLL_INTERVAL);
        }

        let mut outcomes = Vec::new();
        while let Ok(outcome) = self.outcome_rx.try_recv() {
            outcomes.push(outcome);
        }

        for handle in self.workers.drain(..) {
            if handle.is_finished() {
                if let Err(cause) = handle.join() {
                    warn!("Search worker terminated abnormally: {cause:?}");
                }
            } else {
                warn!(
                    "A search worker did not stop within {:?}, detaching it",
                    timeout
                );
            }
        }
        outcomes
    }

    fn join_all(&mut self) {
        for handle in self.workers.drain(..) {
            if let Err(cause) = handle.join() {
                warn!("Search worker terminated abnormally: {cause:?}");
            }
        }
    }
}

/// Run a whole batch: feed every query through a [`SearchPool`], collect
/// `(scan_id, matches)` pairs, and report progress through `status`.
/// Failed queries are logged and absent from the result, which is sorted
/// by scan id.
pub fn search_batch<I>(
    queries: I,
    index: Arc<LibraryIndex>,
    params: Arc<SearchParameters>,
    worker_count: usize,
    status: &StatusHandle,
) -> Vec<(usize, Vec<SpectrumMatch>)>
where
    I: IntoIterator<Item = QuerySpectrum>,
{
    status.update(|s| {
        s.ready = false;
        s.running = true;
        s.error = false;
        s.message = "Reading query spectra".to_string();
    });

    let mut pool = SearchPool::new(index, params, worker_count);
    let mut results: Vec<(usize, Vec<SpectrumMatch>)> = Vec::new();
    let mut failures = 0usize;

    fn record(
        outcome: JobOutcome,
        results: &mut Vec<(usize, Vec<SpectrumMatch>)>,
        failures: &mut usize,
    ) {
        match outcome {
            JobOutcome::Success { scan_id, matches } => results.push((scan_id, matches)),
            JobOutcome::Failure { scan_id, error } => {
                *failures += 1;
                warn!("Query {scan_id} failed: {error}");
            }
        }
    }

    for query in queries {
        // keep the outcome side flowing while the queue is backed up
        while let Some(outcome) = pool.try_outcome() {
            record(outcome, &mut results, &mut failures);
        }
        if pool.submit(query).is_err() {
            break;
        }
        if pool.submitted() % 1000 == 0 {
            status.set_message(format!("{} spectra read", pool.submitted()));
        }
    }

    let total = pool.submitted();
    pool.close();
    status.update(|s| {
        s.ready = true;
        s.message = format!("Searching {total} spectra");
    });

    while let Some(outcome) = pool.next_outcome() {
        record(outcome, &mut results, &mut failures);
        let processed = pool.received();
        if processed % 100 == 0 {
            status.set_message(format!(
                "{processed} spectra searched, about {} remaining",
                total - processed
            ));
        }
    }
    pool.join_all();

    if failures > 0 {
        warn!("{failures} of {total} queries failed and were skipped");
    }
    results.sort_by_key(|(scan_id, _)| *scan_id);
    status.update(|s| {
        s.ready = true;
        s.running = false;
        s.message = String::new();
    });
    results
}
