//! Thread-pool group
//!
//! A fixed number of OS threads pull runnables from a shared queue. A fatal
//! error cancels every pending unit; units already running cannot be
//! preempted and finish before the pool returns.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Mutex};
use std::thread;
use tracing::{debug, error};

use super::ExecutionGroup;
use crate::error::{EngineError, EngineResult};
use crate::results::RunResult;
use crate::runnable::RunnableRef;

#[derive(Debug)]
pub struct ThreadPool {
    size: usize,
    is_run: AtomicBool,
}

impl ThreadPool {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            is_run: AtomicBool::new(false),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl ExecutionGroup for ThreadPool {
    fn name(&self) -> &'static str {
        "threading"
    }

    fn run(&self, collection: &[RunnableRef], result: &RunResult) -> EngineResult<()> {
        self.is_run.store(true, Ordering::SeqCst);
        let queue: Mutex<VecDeque<RunnableRef>> = Mutex::new(collection.iter().cloned().collect());
        let cancelled = AtomicBool::new(false);
        let (tx, rx) = mpsc::channel::<EngineError>();
        let workers = self.size.min(collection.len());
        debug!("Thread pool: {} workers for {} runnables", workers, collection.len());

        thread::scope(|scope| {
            for index in 0..workers {
                let worker_tx = tx.clone();
                let queue = &queue;
                let cancelled = &cancelled;
                let spawned = thread::Builder::new()
                    .name(format!("testrig-worker-{index}"))
                    .spawn_scoped(scope, move || loop {
                        if cancelled.load(Ordering::SeqCst) || result.should_stop() {
                            break;
                        }
                        let next = queue.lock().ok().and_then(|mut q| q.pop_front());
                        let Some(runnable) = next else {
                            break;
                        };
                        if let Err(err) = runnable.run(result) {
                            error!("{} aborted the thread pool: {}", runnable.id(), err);
                            cancelled.store(true, Ordering::SeqCst);
                            let _ = worker_tx.send(err);
                            break;
                        }
                    });
                if let Err(err) = spawned {
                    cancelled.store(true, Ordering::SeqCst);
                    let _ = tx.send(EngineError::Io(err));
                    break;
                }
            }
        });
        drop(tx);

        if let Ok(mut pending) = queue.lock() {
            if !pending.is_empty() {
                debug!("Thread pool cancelled {} pending runnables", pending.len());
                pending.clear();
            }
        }
        match rx.try_recv() {
            Ok(err) => {
                result.stop();
                Err(err)
            }
            Err(_) => Ok(()),
        }
    }

    fn is_run(&self) -> bool {
        self.is_run.load(Ordering::SeqCst)
    }
}
