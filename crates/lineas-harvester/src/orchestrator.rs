//! Run orchestrator.
//!
//! Owns the backlog, the result sink and the checkpoint store. Workers only
//! see keys through their assignment channels and report back through one
//! shared channel, so every state transition happens here, on one task.

use crate::backlog::{Backlog, BacklogCounts};
use crate::checkpoint::{rejection_counts, CheckpointStore, RunStats};
use crate::error::{HarvestError, Result};
use crate::governor::BandwidthGovernor;
use crate::profiler::{self, ResourceProfile};
use crate::report::{PerformanceReport, RunFigures, StopReason};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::sink::{FailureRow, ResultSink};
use crate::worker::{Outcome, Worker, WorkerReport};
use chrono::Utc;
use futures::FutureExt;
use lineas_browser::{FetchError, LookupBackend};
use lineas_core::{HarvestConfig, ResultRow, RucKey, WorkRecord};
use rand::Rng;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
/// Time cancelled workers get to close their sessions once the grace period is spent.
const SESSION_CLOSE_WINDOW: Duration = Duration::from_secs(2);

/// Worker id and whether its task returned without panicking.
type WorkerExit = (usize, bool);

/// What a finished run did.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub stop_reason: StopReason,
    pub counts: BacklogCounts,
    /// Keys skipped because the output already had a row for them
    pub skipped_known: usize,
    /// Input rows rejected at load time
    pub rejected: usize,
    /// Checkpoint generation written last
    pub generation: u64,
    pub report: PerformanceReport,
}

/// Drives one harvest run over an input file.
pub struct Orchestrator<B: LookupBackend> {
    config: Arc<HarvestConfig>,
    backend: Arc<B>,
    profile: Option<ResourceProfile>,
}

impl<B: LookupBackend> Orchestrator<B> {
    #[must_use]
    pub fn new(config: Arc<HarvestConfig>, backend: Arc<B>) -> Self {
        Self {
            config,
            backend,
            profile: None,
        }
    }

    /// Use `profile` instead of profiling the host and proxy.
    #[must_use]
    pub fn with_profile(mut self, profile: ResourceProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Process `input` until the backlog drains, a budget runs out or
    /// `shutdown` is cancelled.
    ///
    /// Results and the shrunken input are persisted before returning, so a
    /// second call on the same input continues where this one stopped.
    pub async fn run(&self, input: &Path, shutdown: CancellationToken) -> Result<RunSummary> {
        let started = Utc::now();
        let output = &self.config.output;
        std::fs::create_dir_all(&output.dir).map_err(|e| HarvestError::persistence(&output.dir, e))?;

        let sink = ResultSink::open(output)?;
        let mut store = CheckpointStore::open(input, output)?;
        let pending = store.load_pending()?;

        for (reason, count) in rejection_counts(&pending.rejected) {
            tracing::warn!(reason, count, "Rejected input rows");
        }

        let known = sink.known_keys();
        let loaded = pending.keys.len();
        let keys: Vec<RucKey> = pending
            .keys
            .into_iter()
            .filter(|key| !known.contains(key))
            .collect();
        let skipped_known = loaded - keys.len();
        if skipped_known > 0 {
            tracing::info!(skipped = skipped_known, "Skipping keys already present in the output");
        }

        let backlog = Backlog::new(keys);
        let total = backlog.counts().total;

        let profile = match &self.profile {
            Some(profile) => profile.clone(),
            None if total == 0 => ResourceProfile::fixed(1, Duration::ZERO, Duration::ZERO, 1),
            None => profiler::profile(&self.config, self.backend.as_ref()).await,
        };
        let worker_count = profile.worker_count.min(total).max(1);

        tracing::info!(
            input = %input.display(),
            keys = total,
            workers = worker_count,
            generation = store.generation(),
            "Starting run"
        );

        let governor = Arc::new(BandwidthGovernor::new(&self.config.bandwidth));
        let capacity = governor.snapshot().estimated_keys_remaining;
        if total as u64 > capacity {
            tracing::warn!(
                keys = total,
                capacity,
                "Bandwidth cap covers only part of the input, the rest stays pending for a later run"
            );
        } else {
            tracing::debug!(keys = total, capacity, "Bandwidth cap covers the input");
        }
        let worker_cancel = shutdown.child_token();
        let (report_tx, mut reports) = mpsc::channel(worker_count);
        let profile = Arc::new(profile);

        let mut slots = Vec::with_capacity(worker_count);
        let mut workers = JoinSet::new();
        for id in 0..worker_count {
            let (tx, rx) = mpsc::channel(1);
            let mut worker = Worker::new(
                id,
                Arc::clone(&self.backend),
                Arc::clone(&governor),
                Arc::clone(&profile),
                worker_cancel.clone(),
            );
            if self.config.harvest.stagger_start {
                worker = worker.with_start_delay(stagger_delay(id));
            }
            let task = AssertUnwindSafe(worker.run(rx, report_tx.clone())).catch_unwind();
            workers.spawn(async move { (id, task.await.is_ok()) });
            slots.push(Slot {
                tx: Some(tx),
                busy: None,
            });
        }
        drop(report_tx);

        let mut run = Run {
            config: &self.config,
            policy: RetryPolicy::new(self.config.harvest.max_retries)
                .with_final_kinds(self.config.harvest.give_up_on.iter().copied()),
            governor,
            backlog,
            sink,
            store,
            slots,
            worker_cancel,
            stop: None,
            stop_deadline: None,
            since_checkpoint: 0,
            lines: 0,
            errors_by_type: BTreeMap::new(),
            clock: Instant::now(),
        };

        if let Err(e) = run.drive(&mut reports, &mut workers, &shutdown).await {
            run.worker_cancel.cancel();
            workers.abort_all();
            return Err(e);
        }

        run.release_assigned();
        run.worker_cancel.cancel();
        let grace = run
            .stop_deadline
            .map_or(self.config.harvest.shutdown_grace(), |deadline| {
                deadline.saturating_duration_since(Instant::now())
            })
            .max(SESSION_CLOSE_WINDOW);
        wind_down(workers, grace).await;

        let reason = run.stop.unwrap_or(StopReason::Interrupted);
        run.sink.flush()?;
        let stats = run.stats(Some(reason));
        let generation = run.store.snapshot(&run.backlog.remaining(), &stats)?;

        let counts = run.backlog.counts();
        let report = PerformanceReport::from_figures(RunFigures {
            started,
            finished: Utc::now(),
            total: counts.total,
            succeeded: counts.succeeded,
            failed: counts.failed,
            remaining: counts.pending + counts.in_progress,
            lines: run.lines,
            bandwidth: run.governor.snapshot(),
            worker_count,
            errors_by_type: run.errors_by_type.clone(),
            retries: run.backlog.retries(),
            reason,
        });
        report.write(&output.path(&output.report_file))?;
        report.log();

        Ok(RunSummary {
            stop_reason: reason,
            counts,
            skipped_known,
            rejected: pending.rejected.len(),
            generation,
            report,
        })
    }
}

/// Start-up offset for worker `index`, in waves of four.
fn stagger_delay(index: usize) -> Duration {
    let (min_ms, max_ms) = match index {
        0..=3 => (0, 2_000),
        4..=7 => (2_000, 5_000),
        _ => (4_000, 8_000),
    };
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..max_ms))
}

/// Wait for workers to close their sessions, aborting whoever outlives `grace`.
async fn wind_down<T: 'static>(mut workers: JoinSet<T>, grace: Duration) {
    let joined = tokio::time::timeout(grace, async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    if joined.is_err() {
        tracing::warn!(workers = workers.len(), "Grace period over, aborting workers");
        workers.shutdown().await;
    }
}

struct Slot {
    tx: Option<mpsc::Sender<WorkRecord>>,
    busy: Option<RucKey>,
}

struct Run<'a> {
    config: &'a HarvestConfig,
    policy: RetryPolicy,
    governor: Arc<BandwidthGovernor>,
    backlog: Backlog,
    sink: ResultSink,
    store: CheckpointStore,
    slots: Vec<Slot>,
    worker_cancel: CancellationToken,
    stop: Option<StopReason>,
    stop_deadline: Option<Instant>,
    since_checkpoint: usize,
    lines: usize,
    errors_by_type: BTreeMap<String, u64>,
    clock: Instant,
}

impl Run<'_> {
    async fn drive(
        &mut self,
        reports: &mut mpsc::Receiver<WorkerReport>,
        workers: &mut JoinSet<WorkerExit>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        loop {
            if self.stop.is_none() && shutdown.is_cancelled() {
                self.interrupt()?;
            }
            if self.stop.is_none() {
                self.dispatch();
                if self.backlog.is_drained() {
                    self.stop = Some(StopReason::Completed);
                }
            }
            if self.stop.is_some() && self.busy() == 0 {
                return Ok(());
            }

            let deadline = self.stop_deadline;
            tokio::select! {
                biased;
                () = shutdown.cancelled(), if self.stop.is_none() => {
                    self.interrupt()?;
                }
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    tracing::warn!(busy = self.busy(), "Workers still busy after the grace period");
                    self.worker_cancel.cancel();
                    return Ok(());
                }
                report = reports.recv() => match report {
                    Some(report) => self.apply(report)?,
                    None => {
                        tracing::error!("All workers exited early");
                        self.begin_stop(StopReason::Interrupted);
                        return Ok(());
                    }
                },
                Some(exit) = workers.join_next(), if !workers.is_empty() => self.worker_exited(exit),
            }
        }
    }

    /// Hand pending keys to idle workers.
    fn dispatch(&mut self) {
        for slot in &mut self.slots {
            if slot.busy.is_some() {
                continue;
            }
            let Some(tx) = &slot.tx else { continue };
            let Some(record) = self.backlog.next() else { break };

            let key = record.key.clone();
            if tx.try_send(record).is_ok() {
                slot.busy = Some(key);
            } else {
                tracing::warn!(ruc = %key, "Worker unavailable, returning key to the queue");
                self.backlog.release(&key);
                slot.tx = None;
            }
        }
    }

    fn busy(&self) -> usize {
        self.slots.iter().filter(|slot| slot.busy.is_some()).count()
    }

    fn apply(&mut self, report: WorkerReport) -> Result<()> {
        if let Some(slot) = self.slots.get_mut(report.worker_id) {
            slot.busy = None;
        }
        let key = report.key;

        match report.outcome {
            Outcome::Succeeded(lines) => {
                self.lines += lines.len();
                self.backlog.succeed(&key);
                self.sink.append(ResultRow { key, lines });
                self.since_checkpoint += 1;
            }
            Outcome::Failed(error) => self.record_failure(key, &error),
            Outcome::BandwidthRefused => {
                self.backlog.release(&key);
                let reason = if self.governor.is_proxy_exhausted() {
                    StopReason::ProxyExhausted
                } else {
                    StopReason::BandwidthExhausted
                };
                self.begin_stop(reason);
            }
            Outcome::Abandoned => self.backlog.release(&key),
        }

        if self.since_checkpoint >= self.config.harvest.checkpoint_interval {
            self.checkpoint()?;
        }
        Ok(())
    }

    fn record_failure(&mut self, key: RucKey, error: &FetchError) {
        *self
            .errors_by_type
            .entry(error.kind().as_str().to_string())
            .or_default() += 1;

        match self.backlog.fail(&key, error, &self.policy) {
            RetryDecision::Retry => {
                tracing::debug!(ruc = %key, "Queued for retry");
            }
            RetryDecision::GiveUp => {
                let attempts = self.backlog.record(&key).map_or(0, |r| r.attempts);
                tracing::warn!(ruc = %key, attempts, kind = %error.kind(), "Key failed permanently");
                self.sink.append_failure(FailureRow {
                    key,
                    error_kind: error.kind(),
                    message: error.to_string(),
                    attempts,
                });
                self.since_checkpoint += 1;
            }
        }

        if self.governor.is_proxy_exhausted() {
            tracing::error!("Proxy failing persistently, stopping");
            self.begin_stop(StopReason::ProxyExhausted);
        }
    }

    /// A worker task ended. Outside of shutdown this means it panicked.
    fn worker_exited(&mut self, exit: std::result::Result<WorkerExit, JoinError>) {
        let (id, clean) = match exit {
            Ok(exit) => exit,
            Err(e) => {
                tracing::error!("Worker task failed: {}", e);
                return;
            }
        };
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        slot.tx = None;
        if let Some(key) = slot.busy.take() {
            tracing::error!(worker = id, ruc = %key, "Worker died mid-key, returning key to the queue");
            self.backlog.release(&key);
        } else if !clean {
            tracing::error!(worker = id, "Worker panicked");
        }

        if self.stop.is_none() && self.slots.iter().all(|slot| slot.tx.is_none()) {
            tracing::error!("No workers left");
            self.begin_stop(StopReason::Interrupted);
        }
    }

    fn interrupt(&mut self) -> Result<()> {
        tracing::warn!("Interrupt received, checkpointing before shutdown");
        self.begin_stop(StopReason::Interrupted);
        self.checkpoint()?;
        Ok(())
    }

    /// Stop dispatching. Only an interrupt cancels in-flight fetches; budget
    /// stops let them finish within the grace period.
    fn begin_stop(&mut self, reason: StopReason) {
        self.stop = Some(StopReason::merge(self.stop, reason));
        if reason == StopReason::Interrupted {
            self.worker_cancel.cancel();
        }
        for slot in &mut self.slots {
            if slot.busy.is_none() {
                slot.tx = None;
            }
        }
        if self.stop_deadline.is_none() {
            self.stop_deadline = Some(Instant::now() + self.config.harvest.shutdown_grace());
        }
    }

    /// Return keys still assigned to workers to the pending queue.
    fn release_assigned(&mut self) {
        for slot in &mut self.slots {
            if let Some(key) = slot.busy.take() {
                self.backlog.release(&key);
            }
            slot.tx = None;
        }
    }

    fn checkpoint(&mut self) -> Result<u64> {
        self.sink.flush()?;
        let stats = self.stats(None);
        let generation = self.store.snapshot(&self.backlog.remaining(), &stats)?;
        self.since_checkpoint = 0;
        self.log_progress(generation);
        Ok(generation)
    }

    fn stats(&self, stop_reason: Option<StopReason>) -> RunStats {
        let counts = self.backlog.counts();
        RunStats {
            succeeded: counts.succeeded,
            failed: counts.failed,
            consumed_bytes: self.governor.consumed(),
            stop_reason,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn log_progress(&self, generation: u64) {
        let counts = self.backlog.counts();
        let processed = counts.succeeded + counts.failed;
        let remaining = counts.pending + counts.in_progress;
        let success_rate = if processed > 0 {
            counts.succeeded as f64 / processed as f64 * 100.0
        } else {
            0.0
        };
        let elapsed = self.clock.elapsed();
        let eta = if processed > 0 {
            elapsed.mul_f64(remaining as f64 / processed as f64)
        } else {
            Duration::ZERO
        };

        tracing::info!(
            generation,
            processed,
            total = counts.total,
            remaining,
            success_rate = %format!("{success_rate:.1}%"),
            used_mb = %format!("{:.1}", self.governor.consumed() as f64 / BYTES_PER_MB),
            eta_secs = eta.as_secs(),
            "Checkpoint"
        );
    }
}
