//! Before/after scripts
//!
//! A script is a named closure the program runs around its suites. Scripts
//! are not tests: success records nothing, while a failure or error is
//! recorded as an error entry with class `script`.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::case::panic_message;
use crate::error::{EngineError, EngineResult};
use crate::models::{Failure, Signal, TestReturn, XUnitData};
use crate::results::RunResult;
use crate::runnable::{EntityKind, EntityState, Runnable, RunnableId};
use crate::utils::timer::Timer;

/// Class name of script error entries
pub const SCRIPT_CLASS: &str = "script";

pub type ScriptFn = Arc<dyn Fn() -> TestReturn + Send + Sync>;

pub struct Script {
    state: EntityState,
    func: ScriptFn,
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script").field("id", self.state.id()).finish()
    }
}

impl Script {
    pub fn new<F>(name: impl AsRef<str>, func: F) -> Self
    where
        F: Fn() -> TestReturn + Send + Sync + 'static,
    {
        Self {
            state: EntityState::new(EntityKind::Script, RunnableId::new(name)),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        self.state.id().as_str()
    }
}

impl Runnable for Script {
    fn id(&self) -> &RunnableId {
        self.state.id()
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Script
    }

    fn run(&self, result: &RunResult) -> EngineResult<()> {
        self.state.mark_run();
        let timer = Timer::start(self.name());
        let ret = catch_unwind(AssertUnwindSafe(|| (self.func)()))
            .unwrap_or_else(|payload| Err(Signal::Fail(Failure::new("panic", panic_message(payload.as_ref())))));
        let runtime = timer.stop().as_secs_f64();

        match ret {
            Ok(()) => {
                debug!("Script {} done", self.name());
                Ok(())
            }
            Err(Signal::Skip(reason)) => {
                debug!("Script {} skipped: {}", self.name(), reason);
                Ok(())
            }
            Err(Signal::Fatal(message)) => {
                self.state.set_stopped_on("run");
                result.stop();
                Err(EngineError::fatal(self.name(), message))
            }
            Err(Signal::Fail(failure)) | Err(Signal::Error(failure)) => {
                warn!("Script {} failed: {}", self.name(), failure.message);
                let data = XUnitData::error(SCRIPT_CLASS, self.name(), runtime, failure);
                result.add_error(self.state.id(), data);
                Ok(())
            }
        }
    }

    fn is_run(&self) -> bool {
        self.state.is_run()
    }

    fn stopped_on(&self) -> Option<String> {
        self.state.stopped_on()
    }

    fn reason(&self) -> String {
        self.state.render_reasons()
    }
}
