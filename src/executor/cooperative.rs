//! Cooperative pool
//!
//! Lightweight tasks on a single-threaded tokio runtime. Each task awaits
//! [`run_local`](crate::runnable::Runnable::run_local), so a case with an
//! async body gives way to the other tasks at its `.await` points. Buckets
//! are only written between suspensions, so the plain mutex inside
//! [`RunResult`] is never held across one.
//!
//! The runtime lives on a dedicated driver thread so that a cooperative
//! group can be nested inside another group's runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinSet, LocalSet};
use tracing::{debug, error};

use super::ExecutionGroup;
use crate::error::{EngineError, EngineResult};
use crate::results::RunResult;
use crate::runnable::RunnableRef;

#[derive(Debug)]
pub struct CooperativePool {
    size: usize,
    is_run: AtomicBool,
}

impl CooperativePool {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            is_run: AtomicBool::new(false),
        }
    }

    fn drive(&self, collection: Vec<RunnableRef>, mirror: Arc<RunResult>) -> EngineResult<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let local = LocalSet::new();
        let size = self.size;

        local.block_on(&runtime, async move {
            let permits = Arc::new(Semaphore::new(size));
            let mut tasks = JoinSet::new();
            for runnable in collection {
                let permits = permits.clone();
                let mirror = mirror.clone();
                tasks.spawn_local(async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|_| EngineError::misuse("cooperative pool closed"))?;
                    if mirror.should_stop() {
                        return Ok(());
                    }
                    let ret = runnable.run_local(&mirror).await;
                    tokio::task::yield_now().await;
                    ret
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let ret = joined.map_err(|e| EngineError::Worker(format!("cooperative task failed: {e}")))?;
                if let Err(err) = ret {
                    error!("Cooperative pool killed: {}", err);
                    tasks.abort_all();
                    mirror.stop();
                    return Err(err);
                }
            }
            Ok(())
        })
    }
}

impl ExecutionGroup for CooperativePool {
    fn name(&self) -> &'static str {
        "cooperative"
    }

    fn run(&self, collection: &[RunnableRef], result: &RunResult) -> EngineResult<()> {
        self.is_run.store(true, Ordering::SeqCst);
        debug!("Cooperative pool: {} slots for {} runnables", self.size, collection.len());

        // Tasks need owned state; they record into a mirror sharing the stop flag.
        let mirror = Arc::new(result.create_proxy(result.name().unwrap_or("cooperative")));
        let units = collection.to_vec();

        let ret = std::thread::scope(|scope| {
            let driver = std::thread::Builder::new()
                .name("testrig-cooperative".to_string())
                .spawn_scoped(scope, || self.drive(units, mirror.clone()))?;
            driver
                .join()
                .unwrap_or_else(|_| Err(EngineError::Worker("cooperative driver panicked".to_string())))
        });

        result.merge(mirror.buckets(), mirror.children());
        let output = mirror.take_output();
        if !output.is_empty() {
            result.emit(&output);
        }
        ret
    }

    fn is_run(&self) -> bool {
        self.is_run.load(Ordering::SeqCst)
    }
}
