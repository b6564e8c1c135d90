//! The coordination loop: a single thread that moves notifications between
//! stages, sets finality flags, and detects run completion.
//!
//! Single-threadedness is deliberate: the outer ends of the stage queues are
//! touched only here, so they need no locking among themselves. Workers hand
//! emissions off through each stage's lock-free outgoing queue.

use crate::error::PipelineError;
use crate::notify::{Key, Notification, Value};
use crate::stage::Stage;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long a parked thread sleeps before re-scanning regardless of signals.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How often the coordinator logs a stage status line.
const STATUS_INTERVAL: Duration = Duration::from_millis(500);

/// Wait/notify pair with a latched dirty bit, so a notification that lands
/// just before a thread parks is not lost.
pub(crate) struct Signal {
    dirty: Mutex<bool>,
    cv: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self {
            dirty: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn notify(&self) {
        let mut dirty = self.dirty.lock();
        *dirty = true;
        self.cv.notify_all();
    }

    pub(crate) fn wait(&self, timeout: Duration) {
        let mut dirty = self.dirty.lock();
        if !*dirty {
            self.cv.wait_for(&mut dirty, timeout);
        }
        *dirty = false;
    }
}

/// Everything the coordinator and the workers share for one run.
pub(crate) struct Shared<K: Key, V: Value> {
    pub(crate) stages: Vec<Arc<Stage<K, V>>>,
    /// Workers loop while this holds.
    pub(crate) running: AtomicBool,
    /// Run-wide cooperative cancellation flag.
    pub(crate) cancel: Arc<AtomicBool>,
    /// First fatal error wins; the coordinator aborts on it.
    pub(crate) fatal: Mutex<Option<PipelineError>>,
    /// Workers park here when no stage has claimable work.
    pub(crate) work: Signal,
    /// The coordinator parks here between rounds of progress.
    pub(crate) progress: Signal,
}

impl<K: Key, V: Value> Shared<K, V> {
    pub(crate) fn report_fatal(&self, err: PipelineError) {
        let mut slot = self.fatal.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        drop(slot);
        self.progress.notify();
    }
}

/// Coordinator for one pipeline run.
pub(crate) struct Coordinator<K: Key, V: Value> {
    shared: Arc<Shared<K, V>>,
}

impl<K: Key, V: Value> Coordinator<K, V> {
    pub(crate) fn new(shared: Arc<Shared<K, V>>) -> Self {
        Self { shared }
    }

    /// Run until the rightmost stage is output-final (or a fatal error).
    ///
    /// Each round: drain every stage's outgoing queue left-to-right and fan
    /// the notifications out to all later stages, then probe finalization and
    /// cascade input finality rightward. Downstream stages hear about changes
    /// before upstream is final; that is what makes the work speculative.
    pub(crate) fn run(&self) -> Result<(), PipelineError> {
        let stages = &self.shared.stages;
        let n = stages.len();
        let mut cancelling = false;
        let mut last_status = Instant::now();

        loop {
            if let Some(err) = self.shared.fatal.lock().take() {
                error!(error = %err, "fatal error, aborting run");
                self.shared.cancel.store(true, Ordering::Relaxed);
                self.shared.work.notify();
                return Err(err);
            }

            let mut progressed = false;

            if self.shared.cancel.load(Ordering::Relaxed) && !cancelling {
                cancelling = true;
                warn!("cancellation requested, draining stages");
                for stage in stages.iter() {
                    stage.cancel_input();
                }
                self.shared.work.notify();
                progressed = true;
            }

            // Move emissions downstream, leftmost stages first.
            let mut fanned = false;
            for i in 0..n {
                for note in stages[i].drain_outgoing() {
                    progressed = true;
                    if cancelling {
                        continue;
                    }
                    self.fan_out(i, note)?;
                    fanned = true;
                }
            }
            if fanned {
                self.shared.work.notify();
            }

            // Finalization cascade: a stage with final input, empty intake,
            // and no in-flight batches freezes; once its outgoing is drained
            // too, its right neighbour's input is complete.
            for i in 0..n {
                if stages[i].try_finalize_output() {
                    progressed = true;
                    self.shared.work.notify();
                }
                if stages[i].is_output_final()
                    && stages[i].outgoing_is_empty()
                    && i + 1 < n
                    && !stages[i + 1].is_input_final()
                {
                    stages[i + 1].mark_input_final();
                    self.shared.work.notify();
                    progressed = true;
                }
            }

            if stages[n - 1].is_output_final() && stages[n - 1].outgoing_is_empty() {
                info!(cancelled = cancelling, "pipeline complete");
                return Ok(());
            }

            if last_status.elapsed() >= STATUS_INTERVAL {
                last_status = Instant::now();
                let line = stages
                    .iter()
                    .map(|s| s.snapshot().to_string())
                    .collect::<Vec<_>>()
                    .join("  ");
                debug!("{line}");
            }

            if !progressed {
                self.shared.progress.wait(POLL_INTERVAL);
            }
        }
    }

    /// Offer one drained notification to every stage after its origin.
    fn fan_out(&self, origin: usize, note: Notification<K, V>) -> Result<(), PipelineError> {
        let stages = &self.shared.stages;
        for stage in &stages[origin + 1..] {
            stage.offer(note.clone())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_signal_is_latched() {
        let signal = Signal::new();
        signal.notify();
        // A notify before the wait must not be lost.
        let start = Instant::now();
        signal.wait(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let signal = Arc::new(Signal::new());
        let waker = signal.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.notify();
        });
        signal.wait(Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_signal_wait_times_out() {
        let signal = Signal::new();
        let start = Instant::now();
        signal.wait(Duration::from_millis(10));
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
