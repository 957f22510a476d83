//! Worker side of the process pool
//!
//! A worker is the same executable started with the same arguments and two
//! extra environment variables. It runs exactly one runnable into a mirror
//! result and hands the outcomes back to the parent as a single JSON line
//! on stdout.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, error};

use crate::error::{EngineError, EngineResult};
use crate::results::{Buckets, ProxyRecord, RunResult, ShouldStop};
use crate::runnable::{RunnableId, RunnableRef};

/// Runnable id the worker should run
pub const WORKER_ENV: &str = "TESTRIG_WORKER";
/// Marker file of the parent's shared stop flag
pub const STOP_FILE_ENV: &str = "TESTRIG_STOP_FILE";
/// Prefix of the batch line on the worker's stdout
pub const BATCH_PREFIX: &str = "@@testrig-batch@@";
/// Worker exit code after a fatal error
pub const FATAL_EXIT_CODE: i32 = 3;

/// Worker settings read from the environment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerMode {
    pub id: RunnableId,
    pub stop_file: Option<PathBuf>,
}

impl WorkerMode {
    /// `Some` when this process was started by a process pool
    pub fn from_env() -> Option<Self> {
        let id = std::env::var(WORKER_ENV).ok().filter(|v| !v.is_empty())?;
        Some(Self {
            id: RunnableId::new(id),
            stop_file: std::env::var_os(STOP_FILE_ENV).map(PathBuf::from),
        })
    }

    /// Mirror result for this worker, attached to the parent's stop flag
    pub fn mirror(&self, failfast: bool) -> RunResult {
        let result = RunResult::new().failfast(failfast);
        match &self.stop_file {
            Some(path) => result.with_stop(ShouldStop::attach(path)),
            None => result,
        }
    }
}

/// Serialized outcomes of one worker
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: RunnableId,
    pub buckets: Buckets,
    #[serde(default)]
    pub children: Vec<ProxyRecord>,
    #[serde(default)]
    pub should_stop: bool,
    /// Message of the fatal error that ended the worker, if any
    #[serde(default)]
    pub fatal: Option<String>,
}

impl Batch {
    pub fn new(id: RunnableId) -> Self {
        Self {
            id,
            buckets: Buckets::default(),
            children: Vec::new(),
            should_stop: false,
            fatal: None,
        }
    }

    pub fn from_result(id: &RunnableId, result: &RunResult) -> Self {
        Self {
            id: id.clone(),
            buckets: result.buckets(),
            children: result.children(),
            should_stop: result.should_stop(),
            fatal: None,
        }
    }

    pub fn with_fatal(mut self, message: impl Into<String>) -> Self {
        self.fatal = Some(message.into());
        self
    }

    /// One stdout line carrying the batch
    pub fn to_line(&self) -> serde_json::Result<String> {
        Ok(format!("{BATCH_PREFIX} {}", serde_json::to_string(self)?))
    }

    /// Find and decode the batch line in a worker's stdout
    pub fn from_output(output: &str) -> Option<serde_json::Result<Batch>> {
        output
            .lines()
            .rev()
            .find_map(|line| line.trim().strip_prefix(BATCH_PREFIX))
            .map(|raw| serde_json::from_str(raw.trim()))
    }
}

/// Push the batch to the parent through stdout
pub fn save(batch: &Batch) -> EngineResult<()> {
    let line = batch.to_line()?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    writeln!(out)?;
    writeln!(out, "{line}")?;
    out.flush()?;
    Ok(())
}

/// Run the runnable named by `mode` and save its batch.
///
/// Returns the worker's exit code.
pub fn run_worker(mode: &WorkerMode, runnable: Option<RunnableRef>, failfast: bool) -> i32 {
    let Some(runnable) = runnable else {
        error!("Worker asked to run unknown runnable {}", mode.id);
        return FATAL_EXIT_CODE;
    };
    debug!("Worker {} starting", mode.id);

    let mirror = mode.mirror(failfast);
    let ret = runnable.run(&mirror);
    let mut batch = Batch::from_result(&mode.id, &mirror);
    let code = match &ret {
        Ok(()) => 0,
        Err(err) => {
            error!("Worker {} failed: {}", mode.id, err);
            batch = batch.with_fatal(err.to_string());
            FATAL_EXIT_CODE
        }
    };
    if let Err(err) = save(&batch) {
        error!("Worker {} could not save its batch: {}", mode.id, err);
        return FATAL_EXIT_CODE;
    }
    code
}

impl From<Batch> for EngineError {
    fn from(batch: Batch) -> Self {
        EngineError::fatal(
            batch.id.as_str(),
            batch.fatal.unwrap_or_else(|| "worker aborted".to_string()),
        )
    }
}
