//! Process pool
//!
//! Every runnable runs in its own worker process. At most `max_processes`
//! workers are alive at once: a slot is taken before a spawn and released
//! once the worker has been joined. Workers cannot share the parent's
//! buckets, so each one writes into a mirror result and prints its batch;
//! the batches are queued and merged into the real result when the pool
//! tears down, re-associated with the original runnables by id.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::worker::{Batch, STOP_FILE_ENV, WORKER_ENV};
use super::ExecutionGroup;
use crate::error::{EngineError, EngineResult};
use crate::results::RunResult;
use crate::runnable::{RunnableId, RunnableRef};

/// Builds the command that starts one worker
pub trait Launcher: Send + Sync {
    fn command(&self, id: &RunnableId, stop_file: &Path) -> std::io::Result<Command>;
}

impl<F> Launcher for F
where
    F: Fn(&RunnableId, &Path) -> std::io::Result<Command> + Send + Sync,
{
    fn command(&self, id: &RunnableId, stop_file: &Path) -> std::io::Result<Command> {
        self(id, stop_file)
    }
}

/// Re-executes the current binary with the same arguments
#[derive(Clone, Copy, Debug, Default)]
pub struct SelfExec;

impl Launcher for SelfExec {
    fn command(&self, id: &RunnableId, stop_file: &Path) -> std::io::Result<Command> {
        let mut command = Command::new(std::env::current_exe()?);
        command
            .args(std::env::args_os().skip(1))
            .env(WORKER_ENV, id.as_str())
            .env(STOP_FILE_ENV, stop_file);
        Ok(command)
    }
}

/// What one worker left in the queue
#[derive(Debug)]
struct Released {
    id: RunnableId,
    output: String,
    exit_code: Option<i32>,
}

pub struct ProcessPool {
    max_processes: usize,
    release_timeout: Duration,
    launcher: Arc<dyn Launcher>,
    alive: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    is_run: AtomicBool,
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("max_processes", &self.max_processes)
            .field("release_timeout", &self.release_timeout)
            .field("alive", &self.alive())
            .finish()
    }
}

impl ProcessPool {
    pub fn new(max_processes: usize, release_timeout: Duration, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            max_processes: max_processes.max(1),
            release_timeout,
            launcher,
            alive: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            is_run: AtomicBool::new(false),
        }
    }

    pub fn max_processes(&self) -> usize {
        self.max_processes
    }

    /// Workers currently alive
    pub fn alive(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    /// Shared alive-worker gauge, for sampling from another thread
    pub fn alive_gauge(&self) -> Arc<AtomicUsize> {
        self.alive.clone()
    }

    /// Highest number of workers seen alive at once
    pub fn peak_alive(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn schedule(
        &self,
        collection: &[RunnableRef],
        result: &RunResult,
        stop_file: &Path,
        queue: mpsc::UnboundedSender<Released>,
    ) -> EngineResult<()> {
        let slots = Arc::new(Semaphore::new(self.max_processes));
        let mut workers: JoinSet<EngineResult<()>> = JoinSet::new();

        for runnable in collection {
            // Wait for a released slot before spawning more.
            let permit = slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| EngineError::misuse("process pool closed"))?;
            if let Some(ret) = workers.try_join_next() {
                settle(ret, &mut workers)?;
            }
            if result.should_stop() {
                debug!("Stop requested, {} not spawned", runnable.id());
                break;
            }

            let id = runnable.id().clone();
            let mut command = self.launcher.command(&id, stop_file)?;
            command
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(true);
            let mut child = command.spawn()?;
            let now_alive = self.alive.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_alive, Ordering::SeqCst);
            debug!("Spawned worker for {} ({} alive)", id, now_alive);

            let alive = self.alive.clone();
            let queue = queue.clone();
            let timeout = self.release_timeout;
            workers.spawn(async move {
                let mut output = String::new();
                if let Some(mut stdout) = child.stdout.take() {
                    stdout.read_to_string(&mut output).await?;
                }
                let status = tokio::time::timeout(timeout, child.wait()).await;
                alive.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
                let status = match status {
                    Ok(status) => status?,
                    Err(_) => {
                        return Err(EngineError::ReleaseTimeout {
                            id: id.to_string(),
                            timeout,
                        })
                    }
                };
                debug!("Released worker for {} ({})", id, status);
                let _ = queue.send(Released {
                    id,
                    output,
                    exit_code: status.code(),
                });
                Ok(())
            });
        }

        while let Some(ret) = workers.join_next().await {
            settle(ret, &mut workers)?;
        }
        Ok(())
    }
}

fn settle(
    ret: Result<EngineResult<()>, tokio::task::JoinError>,
    workers: &mut JoinSet<EngineResult<()>>,
) -> EngineResult<()> {
    let ret = ret.map_err(|e| EngineError::Worker(format!("worker task failed: {e}")));
    match ret {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) | Err(err) => {
            // Dropping the tasks kills their children.
            workers.abort_all();
            Err(err)
        }
    }
}

impl ExecutionGroup for ProcessPool {
    fn name(&self) -> &'static str {
        "multiprocessing"
    }

    fn run(&self, collection: &[RunnableRef], result: &RunResult) -> EngineResult<()> {
        self.is_run.store(true, Ordering::SeqCst);
        let stop_file = result.stop_flag().promote()?;
        let identity: HashMap<RunnableId, RunnableRef> = collection
            .iter()
            .map(|runnable| (runnable.id().clone(), runnable.clone()))
            .collect();
        let (tx, mut rx) = mpsc::unbounded_channel::<Released>();
        debug!(
            "Process pool: {} slots for {} runnables",
            self.max_processes,
            collection.len()
        );

        let scheduled = std::thread::scope(|scope| {
            let driver = std::thread::Builder::new()
                .name("testrig-process-pool".to_string())
                .spawn_scoped(scope, || -> EngineResult<()> {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()?;
                    runtime.block_on(self.schedule(collection, result, &stop_file, tx))
                })?;
            driver
                .join()
                .unwrap_or_else(|_| Err(EngineError::Worker("process pool driver panicked".to_string())))
        });

        // Drain whatever the workers managed to push, even after a failure.
        let mut fatal = None;
        while let Ok(released) = rx.try_recv() {
            if let Err(err) = self.merge(&identity, released, result) {
                fatal.get_or_insert(err);
            }
        }

        let ret = scheduled.and(fatal.map_or(Ok(()), Err));
        if let Err(err) = &ret {
            error!("Process pool aborted: {}", err);
            result.stop();
        }
        ret
    }

    fn is_run(&self) -> bool {
        self.is_run.load(Ordering::SeqCst)
    }
}

impl ProcessPool {
    fn merge(
        &self,
        identity: &HashMap<RunnableId, RunnableRef>,
        released: Released,
        result: &RunResult,
    ) -> EngineResult<()> {
        let batch = match Batch::from_output(&released.output) {
            Some(batch) => batch?,
            None => {
                return Err(EngineError::Worker(format!(
                    "worker for {} exited with {:?} without saving a batch",
                    released.id, released.exit_code
                )))
            }
        };
        if batch.id != released.id {
            warn!("Worker for {} reported batch of {}", released.id, batch.id);
        }
        let Some(runnable) = identity.get(&batch.id) else {
            warn!("Dropping batch of unknown runnable {}", batch.id);
            return Ok(());
        };

        let markers: String = batch
            .buckets
            .iter()
            .map(|entry| entry.data.status().marker())
            .collect();
        debug!("Merging {} outcomes from {}", batch.buckets.tests(), runnable.id());
        let fatal = batch.fatal.is_some();
        let should_stop = batch.should_stop;
        let (buckets, children) = (batch.buckets.clone(), batch.children.clone());
        result.merge(buckets, children);
        result.emit(&markers);
        if should_stop {
            result.stop();
        }
        if fatal {
            return Err(batch.into());
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::XUnitData;
    use crate::results::Entry;

    struct Dummy(RunnableId);

    impl crate::runnable::Runnable for Dummy {
        fn id(&self) -> &RunnableId {
            &self.0
        }
        fn kind(&self) -> crate::runnable::EntityKind {
            crate::runnable::EntityKind::Case
        }
        fn run(&self, _result: &RunResult) -> EngineResult<()> {
            unreachable!("dummies only run in shell workers")
        }
        fn is_run(&self) -> bool {
            false
        }
        fn stopped_on(&self) -> Option<String> {
            None
        }
        fn reason(&self) -> String {
            String::new()
        }
    }

    fn batch_line(id: &RunnableId) -> String {
        let mut batch = Batch::new(id.clone());
        batch.buckets.push(Entry {
            id: id.clone(),
            data: XUnitData::success("Dummy", id.as_str(), 0.2),
        });
        batch.to_line().unwrap()
    }

    fn shell(script: String) -> std::io::Result<Command> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        Ok(command)
    }

    #[test]
    fn test_merges_shell_worker_batches() {
        let launcher = |id: &RunnableId, _stop: &Path| shell(format!("echo '{}'", batch_line(id)));
        let pool = ProcessPool::new(2, Duration::from_secs(5), Arc::new(launcher));
        let collection: Vec<RunnableRef> = (0..3)
            .map(|i| Arc::new(Dummy(RunnableId::new(format!("s:D.test_{i}")))) as RunnableRef)
            .collect();
        let result = RunResult::new();
        pool.run(&collection, &result).unwrap();
        assert_eq!(result.successes().len(), 3);
        assert!(result.stop_flag().is_shared());
        assert_eq!(pool.alive(), 0);
    }

    #[test]
    fn test_missing_batch_is_worker_error() {
        let launcher = |_: &RunnableId, _: &Path| shell("exit 1".to_string());
        let pool = ProcessPool::new(1, Duration::from_secs(5), Arc::new(launcher));
        let collection: Vec<RunnableRef> = vec![Arc::new(Dummy(RunnableId::new("s")))];
        let result = RunResult::new();
        assert!(matches!(pool.run(&collection, &result), Err(EngineError::Worker(_))));
        assert!(result.should_stop());
    }

    #[test]
    fn test_stop_file_prevents_spawns() {
        let launcher = |id: &RunnableId, stop: &Path| {
            shell(format!("touch '{}'; echo '{}'", stop.display(), batch_line(id)))
        };
        let pool = ProcessPool::new(1, Duration::from_secs(5), Arc::new(launcher));
        let collection: Vec<RunnableRef> = (0..4)
            .map(|i| Arc::new(Dummy(RunnableId::new(format!("s:D.test_{i}")))) as RunnableRef)
            .collect();
        let result = RunResult::new();
        pool.run(&collection, &result).unwrap();
        assert_eq!(result.tests_run(), 1);
        assert!(result.should_stop());
    }
}
