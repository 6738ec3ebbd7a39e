//! Parallel run orchestration.
//!
//! A batch of `runs` independent Monte Carlo runs is split into contiguous
//! index ranges, one per worker thread. Workers report progress after every
//! run and their full result set once at the end over a crossbeam channel.
//! Each run seeds its own generator from `"{seed}-{index}"`, so the merged
//! output does not depend on how the work was split.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use hashbrown::HashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::sr_aggregate::aggregate_with_counterfactual;
use crate::sr_error::SimError;
use crate::sr_kernel::run_once;
use crate::sr_results::{AggregateResult, RunResult};
use crate::sr_scenario::ScenarioSpec;

// ============================================================================
// Messages
// ============================================================================

/// Work assigned to one worker: runs `start_index .. start_index + run_count`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRequest {
    pub spec: ScenarioSpec,
    pub start_index: u32,
    pub run_count: u32,
    pub worker_id: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMessage {
    pub worker_id: usize,
    pub completed_runs: usize,
    pub total_runs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub worker_id: usize,
    pub run_results: Vec<RunResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMessage {
    Progress(ProgressMessage),
    Result(ResultMessage),
}

/// Completed runs over the whole batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub completed_runs: usize,
    pub total_runs: usize,
}

impl BatchProgress {
    pub fn fraction(&self) -> f64 {
        if self.total_runs == 0 {
            1.0
        } else {
            self.completed_runs as f64 / self.total_runs as f64
        }
    }
}

// ============================================================================
// Partitioning
// ============================================================================

/// Split `total_runs` into `(start_index, run_count)` ranges. The first
/// `total_runs % workers` ranges get one extra run.
pub fn partition(total_runs: usize, workers: usize) -> Vec<(usize, usize)> {
    if total_runs == 0 {
        return Vec::new();
    }
    let workers = workers.clamp(1, total_runs);
    let base = total_runs / workers;
    let remainder = total_runs % workers;

    let mut ranges = Vec::with_capacity(workers);
    let mut start = 0;
    for worker in 0..workers {
        let count = base + usize::from(worker < remainder);
        ranges.push((start, count));
        start += count;
    }
    ranges
}

/// Hardware parallelism bounded by the run count and an optional cap
pub fn worker_count(total_runs: usize, limit: Option<usize>) -> usize {
    let hardware = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let mut workers = hardware.min(total_runs);
    if let Some(limit) = limit {
        workers = workers.min(limit);
    }
    workers.max(1)
}

/// Execute one partition. Stops quietly when cancelled or when nobody is
/// listening any more.
pub fn run_partition(request: &WorkRequest, sender: &Sender<WorkerMessage>, cancel: &AtomicBool) {
    let total_runs = request.run_count as usize;
    let mut run_results = Vec::with_capacity(total_runs);

    for offset in 0..request.run_count {
        if cancel.load(Ordering::Relaxed) {
            debug!("worker {} cancelled after {} runs", request.worker_id, offset);
            return;
        }

        run_results.push(run_once(&request.spec, request.start_index + offset));

        let progress = WorkerMessage::Progress(ProgressMessage {
            worker_id: request.worker_id,
            completed_runs: run_results.len(),
            total_runs,
        });
        if sender.send(progress).is_err() {
            return;
        }
    }

    let _ = sender.send(WorkerMessage::Result(ResultMessage {
        worker_id: request.worker_id,
        run_results,
    }));
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Cancels the batch it was taken from, from any thread
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

struct Batch {
    receiver: Receiver<WorkerMessage>,
    cancel: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    total_runs: usize,
    workers: usize,
}

impl Batch {
    fn stop(self) {
        self.cancel.store(true, Ordering::Relaxed);
        drop(self.receiver);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

/// Owns at most one in-flight batch
#[derive(Default)]
pub struct Orchestrator {
    max_workers: Option<usize>,
    batch: Option<Batch>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_workers(max_workers: usize) -> Self {
        Self {
            max_workers: Some(max_workers.max(1)),
            batch: None,
        }
    }

    /// Validate `spec` and launch its runs, cancelling any batch in flight
    pub fn start(&mut self, spec: &ScenarioSpec) -> Result<(), SimError> {
        spec.validate()?;
        if self.batch.is_some() {
            info!("replacing in-flight batch");
            self.cancel();
        }

        let total_runs = spec.runs as usize;
        let ranges = partition(total_runs, worker_count(total_runs, self.max_workers));
        let (sender, receiver) = unbounded();
        let cancel = Arc::new(AtomicBool::new(false));

        info!(
            "starting batch: {} runs across {} workers, fingerprint {}",
            total_runs,
            ranges.len(),
            spec.fingerprint()
        );

        let handles = ranges
            .iter()
            .enumerate()
            .map(|(worker_id, (start, count))| {
                let request = WorkRequest {
                    spec: spec.clone(),
                    start_index: *start as u32,
                    run_count: *count as u32,
                    worker_id,
                };
                let sender = sender.clone();
                let cancel = Arc::clone(&cancel);
                thread::spawn(move || run_partition(&request, &sender, &cancel))
            })
            .collect();

        self.batch = Some(Batch {
            receiver,
            cancel,
            handles,
            total_runs,
            workers: ranges.len(),
        });
        Ok(())
    }

    pub fn cancel_handle(&self) -> Option<CancelHandle> {
        self.batch
            .as_ref()
            .map(|batch| CancelHandle(Arc::clone(&batch.cancel)))
    }

    pub fn is_running(&self) -> bool {
        self.batch.is_some()
    }

    /// Stop the current batch; its results are discarded
    pub fn cancel(&mut self) {
        if let Some(batch) = self.batch.take() {
            warn!("batch cancelled");
            batch.stop();
        }
    }

    /// Block until every worker has reported, returning runs ordered by index
    pub fn await_results<F>(&mut self, mut on_progress: F) -> Result<Vec<RunResult>, SimError>
    where
        F: FnMut(BatchProgress),
    {
        let batch = self.batch.take().ok_or(SimError::NoActiveBatch)?;

        let mut per_worker = vec![0usize; batch.workers];
        let mut results: HashMap<usize, Vec<RunResult>> = HashMap::new();
        let mut reported = 0;

        // ends once every worker has dropped its sender
        for message in batch.receiver.iter() {
            match message {
                WorkerMessage::Progress(progress) => {
                    if let Some(slot) = per_worker.get_mut(progress.worker_id) {
                        *slot = (*slot).max(progress.completed_runs);
                    }
                    let completed: usize = per_worker.iter().sum();
                    if completed > reported {
                        reported = completed;
                        on_progress(BatchProgress {
                            completed_runs: completed,
                            total_runs: batch.total_runs,
                        });
                    }
                }
                WorkerMessage::Result(result) => {
                    debug!(
                        "worker {} reported {} runs",
                        result.worker_id,
                        result.run_results.len()
                    );
                    results.insert(result.worker_id, result.run_results);
                }
            }
        }

        let cancelled = batch.cancel.load(Ordering::Relaxed);
        let mut lost = None;
        for (worker_id, handle) in batch.handles.into_iter().enumerate() {
            if handle.join().is_err() && lost.is_none() {
                lost = Some(worker_id);
            }
        }

        if cancelled {
            return Err(SimError::Cancelled);
        }
        if let Some(worker_id) = lost {
            return Err(SimError::WorkerLost { worker_id });
        }
        if let Some(worker_id) = (0..batch.workers).find(|id| !results.contains_key(id)) {
            return Err(SimError::WorkerLost { worker_id });
        }

        let mut runs: Vec<RunResult> = results.into_values().flatten().collect();
        runs.sort_by_key(|run| run.run_index);
        Ok(runs)
    }

    /// Run a scenario to completion, including the no-limits counterfactual
    /// batch when fraud and spend limits are both enabled. Progress covers
    /// both batches.
    pub fn run<F>(&mut self, spec: &ScenarioSpec, mut on_progress: F) -> Result<AggregateResult, SimError>
    where
        F: FnMut(BatchProgress),
    {
        let runs = spec.runs as usize;
        let batches = if spec.needs_counterfactual() { 2 } else { 1 };
        let total_runs = runs * batches;

        self.start(spec)?;
        let primary = self.await_results(|p| {
            on_progress(BatchProgress {
                completed_runs: p.completed_runs,
                total_runs,
            })
        })?;

        let baseline = if spec.needs_counterfactual() {
            info!("running no-limits counterfactual batch");
            self.start(&spec.without_spend_limits())?;
            Some(self.await_results(|p| {
                on_progress(BatchProgress {
                    completed_runs: runs + p.completed_runs,
                    total_runs,
                })
            })?)
        } else {
            None
        };

        Ok(aggregate_with_counterfactual(spec, &primary, baseline.as_deref()))
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.cancel();
    }
}
