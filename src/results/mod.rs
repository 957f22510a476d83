//! Outcome aggregation
//!
//! [`RunResult`] collects outcomes in four insertion-ordered buckets.
//! Scoped sub-collectors ([`ProxyGuard`]) share the stop flag and merge
//! their buckets into the parent exactly once, when the scope ends.

mod cell;
mod console;
mod proxy;
mod xunit;

pub use cell::{SharedStop, ShouldStop, StopCell};
pub use console::Console;
pub use proxy::ProxyGuard;
pub use xunit::{render_xunit, write_xunit};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::models::{Status, XUnitData};
use crate::runnable::RunnableId;

/// One recorded outcome
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: RunnableId,
    pub data: XUnitData,
}

/// The four outcome buckets
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Buckets {
    pub successes: Vec<Entry>,
    pub skipped: Vec<Entry>,
    pub failures: Vec<Entry>,
    pub errors: Vec<Entry>,
}

impl Buckets {
    fn bucket_mut(&mut self, status: Status) -> &mut Vec<Entry> {
        match status {
            Status::Success => &mut self.successes,
            Status::Skip => &mut self.skipped,
            Status::Fail => &mut self.failures,
            Status::Error => &mut self.errors,
        }
    }

    pub fn push(&mut self, entry: Entry) {
        self.bucket_mut(entry.data.status()).push(entry);
    }

    /// List-append of every bucket of `other`
    pub fn append(&mut self, other: Buckets) {
        self.successes.extend(other.successes);
        self.skipped.extend(other.skipped);
        self.failures.extend(other.failures);
        self.errors.extend(other.errors);
    }

    pub fn tests(&self) -> usize {
        self.successes.len() + self.skipped.len() + self.failures.len() + self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests() == 0
    }

    pub fn was_success(&self) -> bool {
        self.failures.is_empty() && self.errors.is_empty()
    }

    /// All entries, bucket by bucket
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.successes
            .iter()
            .chain(self.skipped.iter())
            .chain(self.failures.iter())
            .chain(self.errors.iter())
    }

    pub fn runtime(&self) -> f64 {
        self.iter().map(|e| e.data.runtime()).sum()
    }
}

/// Snapshot of a proxy taken when its scope ended
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub name: String,
    pub runtime: f64,
    pub started_at: DateTime<Utc>,
    pub buckets: Buckets,
    #[serde(default)]
    pub children: Vec<ProxyRecord>,
}

/// Lock `mutex`, recovering the guard if a recording thread panicked
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tree-shaped outcome collector
#[derive(Debug)]
pub struct RunResult {
    name: Option<String>,
    buckets: Mutex<Buckets>,
    children: Mutex<Vec<ProxyRecord>>,
    output: Mutex<String>,
    stop: ShouldStop,
    failfast: bool,
    console: Arc<Console>,
}

impl Default for RunResult {
    fn default() -> Self {
        Self::new()
    }
}

impl RunResult {
    /// Root result with a silent console
    pub fn new() -> Self {
        Self::with_console(Console::silent())
    }

    pub fn with_console(console: Console) -> Self {
        Self {
            name: None,
            buckets: Mutex::new(Buckets::default()),
            children: Mutex::new(Vec::new()),
            output: Mutex::new(String::new()),
            stop: ShouldStop::new(),
            failfast: false,
            console: Arc::new(console),
        }
    }

    /// Stop the run after the first failure or error
    pub fn failfast(mut self, enabled: bool) -> Self {
        self.failfast = enabled;
        self
    }

    /// Replace the stop flag, e.g. with one attached from a parent process
    pub fn with_stop(mut self, stop: ShouldStop) -> Self {
        self.stop = stop;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn is_failfast(&self) -> bool {
        self.failfast
    }

    /// Isolated collector sharing this result's stop flag
    pub fn create_proxy(&self, name: impl Into<String>) -> RunResult {
        RunResult {
            name: Some(name.into()),
            buckets: Mutex::new(Buckets::default()),
            children: Mutex::new(Vec::new()),
            output: Mutex::new(String::new()),
            stop: self.stop.clone(),
            failfast: self.failfast,
            console: self.console.clone(),
        }
    }

    /// Scoped proxy merged back into `self` when the guard drops
    pub fn proxy(&self, name: impl Into<String>) -> ProxyGuard<'_> {
        ProxyGuard::new(self, self.create_proxy(name))
    }

    pub fn stop_flag(&self) -> &ShouldStop {
        &self.stop
    }

    pub fn should_stop(&self) -> bool {
        self.stop.is_set()
    }

    /// Raise the stop flag; it never goes back down
    pub fn stop(&self) {
        self.stop.set();
    }

    /// Record one outcome into the bucket matching its status
    pub fn record(&self, id: &RunnableId, data: XUnitData) {
        let status = data.status();
        debug!("{} -> {}", id, status);
        lock(&self.buckets).push(Entry {
            id: id.clone(),
            data,
        });
        self.emit(status.marker());
        if self.failfast && matches!(status, Status::Fail | Status::Error) {
            self.stop();
        }
    }

    pub fn add_success(&self, id: &RunnableId, data: XUnitData) {
        debug_assert_eq!(data.status(), Status::Success);
        self.record(id, data);
    }

    pub fn add_skip(&self, id: &RunnableId, data: XUnitData) {
        debug_assert_eq!(data.status(), Status::Skip);
        self.record(id, data);
    }

    pub fn add_failure(&self, id: &RunnableId, data: XUnitData) {
        debug_assert_eq!(data.status(), Status::Fail);
        self.record(id, data);
    }

    pub fn add_error(&self, id: &RunnableId, data: XUnitData) {
        debug_assert_eq!(data.status(), Status::Error);
        self.record(id, data);
    }

    /// Append pre-recorded buckets and proxy snapshots (no markers, no failfast)
    pub fn merge(&self, buckets: Buckets, records: Vec<ProxyRecord>) {
        let failed = !buckets.was_success();
        lock(&self.buckets).append(buckets);
        if !records.is_empty() {
            lock(&self.children).extend(records);
        }
        if self.failfast && failed {
            self.stop();
        }
    }

    /// Write console output; proxies buffer until their scope ends
    pub fn emit(&self, text: &str) {
        if self.name.is_none() {
            self.console.write(text);
        } else {
            lock(&self.output).push_str(text);
        }
    }

    pub(crate) fn take_output(&self) -> String {
        std::mem::take(&mut *lock(&self.output))
    }

    pub(crate) fn push_child(&self, record: ProxyRecord) {
        lock(&self.children).push(record);
    }

    /// Copy of the buckets
    pub fn buckets(&self) -> Buckets {
        lock(&self.buckets).clone()
    }

    /// Snapshots of proxies merged into this result
    pub fn children(&self) -> Vec<ProxyRecord> {
        lock(&self.children).clone()
    }

    pub fn successes(&self) -> Vec<Entry> {
        self.buckets().successes
    }

    pub fn skipped(&self) -> Vec<Entry> {
        self.buckets().skipped
    }

    pub fn failures(&self) -> Vec<Entry> {
        self.buckets().failures
    }

    pub fn errors(&self) -> Vec<Entry> {
        self.buckets().errors
    }

    /// successes + skipped + failures + errors
    pub fn tests_run(&self) -> usize {
        lock(&self.buckets).tests()
    }

    /// No failures and no errors in any bucket
    pub fn was_success(&self) -> bool {
        lock(&self.buckets).was_success()
    }
}
