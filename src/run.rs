//! Run façade: assemble a pipeline, feed it an initial map, and block until
//! the rightmost stage is finalized.

use crate::config::RunConfig;
use crate::coordinator::{Coordinator, Shared, Signal};
use crate::error::{PipelineError, Result};
use crate::metrics::RunMetrics;
use crate::notify::{Key, Notification, State, Value};
use crate::stage::Stage;
use crate::transform::Transform;
use crate::worker::WorkerPool;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Requests cooperative cancellation of a running pipeline. Clonable and
/// sendable; typically handed to another thread before
/// [`Run::run_to_completion`] blocks the caller.
#[derive(Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Ask the run to stop. Workers stop picking up batches, queues drain,
    /// and the run returns whatever the rightmost stage holds.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// A single execution of a pipeline over one initial map.
///
/// Steps are appended with [`Run::add_step`]; their order defines the stage
/// indices. A `Run` is single-use: `run_to_completion` consumes its ability
/// to run again.
pub struct Run<K: Key, V: Value> {
    transforms: Vec<Arc<dyn Transform<K, V>>>,
    config: RunConfig,
    cancel: Arc<AtomicBool>,
    metrics: Arc<RunMetrics>,
    started: bool,
}

impl<K: Key, V: Value> Run<K, V> {
    pub fn new() -> Self {
        Self {
            transforms: Vec::new(),
            config: RunConfig::default(),
            cancel: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(RunMetrics::new()),
            started: false,
        }
    }

    pub fn with_config(config: RunConfig) -> Result<Self> {
        config.validate()?;
        let mut run = Self::new();
        run.config = config;
        Ok(run)
    }

    /// Append a step to the pipeline. Valid only before the run starts.
    pub fn add_step(&mut self, transform: impl Transform<K, V>) -> Result<()> {
        self.add_shared_step(Arc::new(transform))
    }

    /// Append an already-shared step. The same instance cannot appear twice
    /// in one pipeline.
    pub fn add_shared_step(&mut self, transform: Arc<dyn Transform<K, V>>) -> Result<()> {
        if self.started {
            return Err(PipelineError::AddStepAfterStart);
        }
        if let Some(index) = self
            .transforms
            .iter()
            .position(|t| Arc::ptr_eq(t, &transform))
        {
            return Err(PipelineError::DuplicateStage { index });
        }
        self.transforms.push(transform);
        Ok(())
    }

    /// Handle for cancelling this run from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            flag: self.cancel.clone(),
        }
    }

    /// Live counters for this run; readable from any thread while it runs.
    pub fn metrics(&self) -> Arc<RunMetrics> {
        self.metrics.clone()
    }

    /// Feed the initial mapping through every stage and block until the
    /// rightmost stage is finalized. Returns its output map, one `State`
    /// (final value plus generation vector) per surviving key; deleted keys
    /// are absent. On cancellation the partial result is returned, not an
    /// error.
    pub fn run_to_completion(&mut self, initial: HashMap<K, V>) -> Result<HashMap<K, State<V>>> {
        if self.started {
            return Err(PipelineError::RunReused);
        }
        self.started = true;

        if self.transforms.is_empty() {
            return Err(PipelineError::config("pipeline has no steps"));
        }
        for (i, t) in self.transforms.iter().enumerate() {
            if t.max_concurrency() == Some(0) {
                return Err(PipelineError::config(format!(
                    "stage {i} has max_concurrency 0 and could never drain"
                )));
            }
        }

        let stage_count = self.transforms.len();
        let stages: Vec<Arc<Stage<K, V>>> = self
            .transforms
            .iter()
            .enumerate()
            .map(|(i, t)| {
                Arc::new(Stage::new(
                    i,
                    stage_count,
                    t.clone(),
                    &self.config,
                    self.metrics.clone(),
                ))
            })
            .collect();
        let shared = Arc::new(Shared {
            stages,
            running: AtomicBool::new(true),
            cancel: self.cancel.clone(),
            fatal: Mutex::new(None),
            work: Signal::new(),
            progress: Signal::new(),
        });

        let signal_ids = if self.config.cancel_on_signal {
            register_cancel_signals(&self.cancel)?
        } else {
            Vec::new()
        };

        info!(
            stages = stage_count,
            workers = self.config.effective_worker_count(),
            keys = initial.len(),
            "run starting"
        );

        let pool = WorkerPool::spawn(shared.clone(), self.config.effective_worker_count())?;

        // Seed: every stage hears the initial inputs directly, so values
        // reach downstream even when nothing upstream changes them. Stage
        // 0's input is complete once they are queued.
        let mut seed_error = None;
        'seed: for (key, value) in initial {
            let note = Notification::source(key, value, stage_count);
            for stage in &shared.stages {
                if let Err(e) = stage.offer(note.clone()) {
                    seed_error = Some(e);
                    break 'seed;
                }
            }
        }
        shared.stages[0].mark_input_final();
        shared.work.notify();

        // The caller's thread serves as the dedicated coordinator thread
        // for the duration of the run.
        let outcome = match seed_error {
            Some(e) => Err(e),
            None => Coordinator::new(shared.clone()).run(),
        };

        shared.running.store(false, Ordering::Release);
        shared.work.notify();
        pool.join();
        for id in signal_ids {
            signal_hook::low_level::unregister(id);
        }

        outcome?;

        if self.cancel.load(Ordering::Relaxed) {
            warn!("run cancelled, returning partial results");
        }
        let map = shared.stages[stage_count - 1].final_output();
        Ok(map
            .into_iter()
            .filter(|(_, state)| !state.is_deleted())
            .collect())
    }
}

impl<K: Key, V: Value> Default for Run<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

fn register_cancel_signals(flag: &Arc<AtomicBool>) -> Result<Vec<signal_hook::SigId>> {
    let mut ids = Vec::new();
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        let id = signal_hook::flag::register(sig, flag.clone()).map_err(anyhow::Error::from)?;
        ids.push(id);
    }
    Ok(ids)
}
