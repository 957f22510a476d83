//! Sequential group

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use super::ExecutionGroup;
use crate::error::EngineResult;
use crate::results::RunResult;
use crate::runnable::RunnableRef;

/// Runs the collection in declaration order on the calling thread
#[derive(Debug, Default)]
pub struct Sequential {
    is_run: AtomicBool,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionGroup for Sequential {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn run(&self, collection: &[RunnableRef], result: &RunResult) -> EngineResult<()> {
        self.is_run.store(true, Ordering::SeqCst);
        for runnable in collection {
            if result.should_stop() {
                debug!("Stop requested, {} not started", runnable.id());
                break;
            }
            runnable.run(result)?;
        }
        Ok(())
    }

    fn is_run(&self) -> bool {
        self.is_run.load(Ordering::SeqCst)
    }
}
