//! Per-stage state and batching: the input/output maps, the intake queue,
//! the local generation counter, and the batch execution algorithm.
//!
//! The inner ends of both queues and both maps are guarded by the stage
//! lock. The lock is never held across a user transform invocation: only the
//! pre-batch selection and the post-batch publication hold it. The outgoing
//! queue is a lock-free hand-off drained by the single coordinator thread.

use crate::config::RunConfig;
use crate::error::PipelineError;
use crate::metrics::RunMetrics;
use crate::notify::{Key, Notification, State, Value};
use crate::transform::{validate_emission, BatchOutput, Transform};
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Lifecycle of a stage, derived from its finality flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    /// Accepting notifications, more may arrive.
    Open,
    /// No more notifications will arrive; queued work remains.
    InputFinal,
    /// Input final and the queue is empty, but batches are still in flight.
    Draining,
    /// Terminal: maps are frozen, nothing further will be emitted.
    OutputFinal,
}

/// Point-in-time view of one stage, for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSnapshot {
    pub index: usize,
    pub status: StageStatus,
    /// Notifications queued for intake.
    pub queued: usize,
    /// Batches in flight.
    pub active: usize,
    /// Local generations handed out so far.
    pub generation: u64,
    /// Keys recorded on the output side.
    pub keys: usize,
}

impl fmt::Display for StageSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.status {
            StageStatus::Open => "open",
            StageStatus::InputFinal => "input-final",
            StageStatus::Draining => "draining",
            StageStatus::OutputFinal => "final",
        };
        write!(
            f,
            "#{} {} q={} act={} gen={} keys={}",
            self.index, status, self.queued, self.active, self.generation, self.keys
        )
    }
}

struct StageInner<K, V> {
    /// Latest accepted input per key.
    input: HashMap<K, State<V>>,
    /// Latest published output per key (pass-through until the stage emits).
    output: HashMap<K, State<V>>,
    /// Intake FIFO awaiting batch dispatch.
    incoming: VecDeque<Notification<K, V>>,
    /// Local generation counter; the next batch takes this value.
    next_gen: u64,
    input_final: bool,
    output_final: bool,
    active_workers: usize,
    prepared: bool,
    /// A batch hit a fatal error; the stage must not finalize, so the
    /// coordinator cannot declare completion before observing the error.
    fatal_pending: bool,
}

/// How one batch ended, decided outside the lock.
enum BatchEnd<K, V> {
    Publish(BatchOutput<K, V>),
    /// Contained failure: the batch is dropped and unwound.
    Skip(PipelineError),
    /// Abort the run.
    Fatal(PipelineError),
}

pub(crate) struct Stage<K: Key, V: Value> {
    pub(crate) index: usize,
    stage_count: usize,
    transform: Arc<dyn Transform<K, V>>,
    eager: bool,
    batch_cap: usize,
    timeout: Option<Duration>,
    max_concurrency: Option<usize>,
    inner: Mutex<StageInner<K, V>>,
    outgoing: SegQueue<Notification<K, V>>,
    metrics: Arc<RunMetrics>,
}

impl<K: Key, V: Value> Stage<K, V> {
    pub(crate) fn new(
        index: usize,
        stage_count: usize,
        transform: Arc<dyn Transform<K, V>>,
        config: &RunConfig,
        metrics: Arc<RunMetrics>,
    ) -> Self {
        let eager = transform.eager() && !config.deliberate_mode;
        let timeout = transform.batch_timeout().or(config.per_stage_timeout);
        let max_concurrency = transform.max_concurrency();
        Self {
            index,
            stage_count,
            transform,
            eager,
            batch_cap: config.batch_cap,
            timeout,
            max_concurrency,
            inner: Mutex::new(StageInner {
                input: HashMap::new(),
                output: HashMap::new(),
                incoming: VecDeque::new(),
                next_gen: 1,
                input_final: false,
                output_final: false,
                active_workers: 0,
                prepared: false,
                fatal_pending: false,
            }),
            outgoing: SegQueue::new(),
            metrics,
        }
    }

    /// Enqueue a notification for intake. Offering to a finalized input is a
    /// protocol error: the coordinator promised nothing further would come.
    pub(crate) fn offer(&self, n: Notification<K, V>) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock();
        if inner.input_final {
            return Err(PipelineError::protocol(
                self.index,
                "notification offered after input finalized",
            ));
        }
        trace!(stage = self.index, gens = %n.state.gens, "intake");
        inner.incoming.push_back(n);
        self.metrics.record_offered();
        Ok(())
    }

    /// Upstream will produce nothing further. Idempotent.
    pub(crate) fn mark_input_final(&self) {
        let mut inner = self.inner.lock();
        if !inner.input_final {
            inner.input_final = true;
            debug!(stage = self.index, "input finalized");
        }
    }

    /// Cancellation path: discard queued intake and refuse anything further.
    pub(crate) fn cancel_input(&self) {
        let mut inner = self.inner.lock();
        let dropped = inner.incoming.len();
        inner.incoming.clear();
        inner.input_final = true;
        if dropped > 0 {
            debug!(stage = self.index, dropped, "intake discarded on cancel");
        }
    }

    /// Transition to output-final iff the input is final, the intake queue is
    /// empty, and no batch is in flight.
    pub(crate) fn try_finalize_output(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.output_final {
            return false;
        }
        if inner.input_final
            && inner.incoming.is_empty()
            && inner.active_workers == 0
            && !inner.fatal_pending
        {
            inner.output_final = true;
            debug!(stage = self.index, "output finalized");
            true
        } else {
            false
        }
    }

    pub(crate) fn is_input_final(&self) -> bool {
        self.inner.lock().input_final
    }

    pub(crate) fn is_output_final(&self) -> bool {
        self.inner.lock().output_final
    }

    pub(crate) fn outgoing_is_empty(&self) -> bool {
        self.outgoing.is_empty()
    }

    /// Return and clear the available outgoing notifications. Only the
    /// coordinator calls this.
    pub(crate) fn drain_outgoing(&self) -> Vec<Notification<K, V>> {
        let mut drained = Vec::new();
        while let Some(n) = self.outgoing.pop() {
            drained.push(n);
        }
        drained
    }

    /// Clone of the published output side, read at run completion.
    pub(crate) fn final_output(&self) -> HashMap<K, State<V>> {
        self.inner.lock().output.clone()
    }

    pub(crate) fn snapshot(&self) -> StageSnapshot {
        let inner = self.inner.lock();
        let status = if inner.output_final {
            StageStatus::OutputFinal
        } else if inner.input_final && inner.incoming.is_empty() {
            StageStatus::Draining
        } else if inner.input_final {
            StageStatus::InputFinal
        } else {
            StageStatus::Open
        };
        StageSnapshot {
            index: self.index,
            status,
            queued: inner.incoming.len(),
            active: inner.active_workers,
            generation: inner.next_gen - 1,
            keys: inner.output.len(),
        }
    }

    /// Worker entry point: pull up to `batch_cap` surviving notifications
    /// from intake and execute them as one batch.
    ///
    /// Returns `Ok(true)` when any intake was consumed or a batch ran, and
    /// `Err` only for violations that must abort the run.
    pub(crate) fn run_next_batch(&self) -> Result<bool, PipelineError> {
        let Some((batch, generation, consumed, needs_prepare)) = self.claim_batch() else {
            return Ok(false);
        };
        let Some(batch) = batch else {
            // Intake consumed (stale or pass-through only); no batch to run.
            return Ok(consumed);
        };

        debug!(
            stage = self.index,
            generation,
            size = batch.len(),
            "batch start"
        );
        self.metrics.record_batch();

        match self.execute(&batch, generation, needs_prepare) {
            BatchEnd::Publish(out) => self.publish(out)?,
            BatchEnd::Skip(err) => {
                warn!(stage = self.index, error = %err, "batch dropped");
                self.metrics.record_batch_failure();
                self.unwind(&batch);
            }
            BatchEnd::Fatal(err) => {
                let mut inner = self.inner.lock();
                inner.active_workers -= 1;
                inner.fatal_pending = true;
                return Err(err);
            }
        }
        Ok(true)
    }

    /// Pre-batch selection, under the stage lock. Returns `None` when the
    /// stage has nothing claimable; `Some((None, ..))` when intake was
    /// consumed but nothing survived.
    #[allow(clippy::type_complexity)]
    fn claim_batch(&self) -> Option<(Option<Vec<Notification<K, V>>>, u64, bool, bool)> {
        let mut inner = self.inner.lock();
        if inner.output_final {
            return None;
        }
        // A deliberate stage holds its queue until every predecessor is
        // output-final, which is exactly when its input becomes final.
        if !self.eager && !inner.input_final {
            return None;
        }
        if let Some(cap) = self.max_concurrency {
            if inner.active_workers >= cap {
                return None;
            }
        }
        if inner.incoming.is_empty() {
            return None;
        }

        let mut batch: Vec<Notification<K, V>> = Vec::new();
        let mut consumed = false;
        while batch.len() < self.batch_cap {
            let Some(n) = inner.incoming.pop_front() else {
                break;
            };
            consumed = true;
            if let Some(current) = inner.input.get(&n.key) {
                if !n.state.gens.dominates(&current.gens) {
                    trace!(stage = self.index, gens = %n.state.gens, "stale, discarded");
                    self.metrics.record_stale();
                    continue;
                }
            }
            inner.input.insert(n.key.clone(), n.state.clone());
            self.metrics.record_accepted();

            // Record the accepted state as the stage's current output unless
            // this stage already published something newer for the key.
            let record = match inner.output.get(&n.key) {
                Some(current) => n.state.gens.dominates(&current.gens),
                None => true,
            };
            if record {
                inner.output.insert(n.key.clone(), n.state.clone());
            }

            if n.state.is_deleted() || !self.transform.matches(&n.key) {
                continue;
            }
            // Within one batch the latest accepted state per key wins.
            if let Some(existing) = batch.iter_mut().find(|b| b.key == n.key) {
                *existing = n;
            } else {
                batch.push(n);
            }
        }

        if batch.is_empty() {
            return Some((None, 0, consumed, false));
        }
        let generation = inner.next_gen;
        inner.next_gen += 1;
        inner.active_workers += 1;
        let needs_prepare = !inner.prepared;
        inner.prepared = true;
        Some((Some(batch), generation, consumed, needs_prepare))
    }

    /// Run prepare (first batch only) and the transform, without the lock.
    fn execute(
        &self,
        batch: &[Notification<K, V>],
        generation: u64,
        needs_prepare: bool,
    ) -> BatchEnd<K, V> {
        let started = Instant::now();
        let mut out = BatchOutput::new(self.index, self.stage_count, generation);
        if needs_prepare {
            if let Err(e) = self.transform.prepare() {
                return BatchEnd::Skip(PipelineError::Transform {
                    stage: self.index,
                    reason: format!("prepare failed: {e:#}"),
                });
            }
        }

        let result = catch_unwind(AssertUnwindSafe(|| self.transform.process(batch, &mut out)));
        let elapsed = started.elapsed();

        match result {
            Err(panic) => BatchEnd::Skip(PipelineError::Transform {
                stage: self.index,
                reason: format!("transform panicked: {}", panic_message(&panic)),
            }),
            Ok(Err(e)) => match e.downcast::<PipelineError>() {
                Ok(pe) if pe.is_fatal() => BatchEnd::Fatal(pe),
                Ok(pe) => BatchEnd::Skip(PipelineError::Transform {
                    stage: self.index,
                    reason: pe.to_string(),
                }),
                Err(e) => BatchEnd::Skip(PipelineError::Transform {
                    stage: self.index,
                    reason: format!("{e:#}"),
                }),
            },
            Ok(Ok(())) => match self.timeout {
                Some(limit) if elapsed > limit => BatchEnd::Skip(PipelineError::BatchTimeout {
                    stage: self.index,
                    elapsed,
                    limit,
                }),
                _ => BatchEnd::Publish(out),
            },
        }
    }

    /// Post-batch publication, under the stage lock: write dominating
    /// outputs and queue them for the coordinator.
    fn publish(&self, out: BatchOutput<K, V>) -> Result<(), PipelineError> {
        self.metrics.record_suppressed(out.suppressed());
        let emitted = out.into_emitted();
        let mut inner = self.inner.lock();
        inner.active_workers -= 1;

        for n in emitted {
            if let Err(e) = validate_emission(self.index, self.stage_count, &n) {
                return Err(e);
            }
            let accept = match inner.output.get(&n.key) {
                Some(current) => n.state.gens.dominates(&current.gens),
                None => true,
            };
            if accept {
                trace!(stage = self.index, gens = %n.state.gens, "emit");
                inner.output.insert(n.key.clone(), n.state.clone());
                self.outgoing.push(n);
                self.metrics.record_emission();
            } else {
                debug!(stage = self.index, gens = %n.state.gens, "output superseded, discarded");
                self.metrics.record_output_discarded();
            }
        }
        Ok(())
    }

    /// Roll a failed batch back: re-assert the current input for each batch
    /// key under a fresh generation, so the stage's latest word on those keys
    /// is the untransformed pass-through and any published speculative change
    /// is dominated. A key whose current output was already derived from the
    /// current input by a batch that succeeded keeps that output.
    fn unwind(&self, batch: &[Notification<K, V>]) {
        let mut inner = self.inner.lock();
        inner.active_workers -= 1;

        let diverged: Vec<K> = batch
            .iter()
            .filter(|n| {
                match (inner.input.get(&n.key), inner.output.get(&n.key)) {
                    (Some(input), Some(output)) => {
                        let derived_from_current = output.gens.slot(self.index) > 0
                            && output.gens.bump(self.index, 0) == input.gens;
                        !derived_from_current
                    }
                    _ => false,
                }
            })
            .map(|n| n.key.clone())
            .collect();
        if diverged.is_empty() {
            return;
        }

        // The corrective must dominate whatever the earlier batch emitted,
        // so it takes a new generation of its own.
        let generation = inner.next_gen;
        inner.next_gen += 1;
        for key in diverged {
            let Some(input) = inner.input.get(&key) else {
                continue;
            };
            let state = input.with_gens(input.gens.bump(self.index, generation));
            debug!(stage = self.index, gens = %state.gens, "corrective emission");
            inner.output.insert(key.clone(), state.clone());
            self.outgoing.push(Notification::new(key, state, Some(self.index)));
            self.metrics.record_corrective();
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
