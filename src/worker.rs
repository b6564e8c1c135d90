//! Worker dispatch glue: a pool of OS threads that drain stage intake
//! queues and execute batches.

use crate::coordinator::{Shared, POLL_INTERVAL};
use crate::error::Result;
use crate::notify::{Key, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn<K: Key, V: Value>(shared: Arc<Shared<K, V>>, count: usize) -> Result<Self> {
        let mut handles = Vec::with_capacity(count);
        for id in 0..count {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("conveyor-worker-{id}"))
                .spawn(move || worker_loop(shared, id))
                .map_err(anyhow::Error::from)?;
            handles.push(handle);
        }
        Ok(Self { handles })
    }

    pub(crate) fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop<K: Key, V: Value>(shared: Arc<Shared<K, V>>, id: usize) {
    debug!(worker = id, "worker started");
    while shared.running.load(Ordering::Acquire) {
        if shared.cancel.load(Ordering::Relaxed) {
            // Stop picking up batches; in-flight work drains on its own.
            shared.work.wait(POLL_INTERVAL);
            continue;
        }

        let mut did_work = false;
        // Leftmost stages first: work there invalidates downstream
        // speculation, so retiring it early wastes the least effort.
        for stage in &shared.stages {
            match stage.run_next_batch() {
                Ok(true) => {
                    did_work = true;
                    shared.progress.notify();
                    break;
                }
                Ok(false) => {}
                Err(err) => {
                    error!(worker = id, error = %err, "protocol failure");
                    shared.report_fatal(err);
                    did_work = true;
                    break;
                }
            }
        }
        if !did_work {
            shared.work.wait(POLL_INTERVAL);
        }
    }
    debug!(worker = id, "worker stopped");
}
