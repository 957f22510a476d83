//! Execution groups
//!
//! An execution group runs a homogeneous collection of runnables against a
//! shared [`RunResult`]. Four strategies are interchangeable: sequential,
//! thread pool, cooperative pool and process pool. Every strategy yields the
//! same multiset of outcomes; only Sequential guarantees insertion order.

mod cooperative;
mod process_pool;
mod sequential;
mod thread_pool;
pub mod worker;

pub use cooperative::CooperativePool;
pub use process_pool::{Launcher, ProcessPool, SelfExec};
pub use sequential::Sequential;
pub use thread_pool::ThreadPool;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::EngineResult;
use crate::results::RunResult;
use crate::runnable::RunnableRef;

/// Default release timeout for worker processes
pub const DEFAULT_RELEASE_TIMEOUT: Duration = Duration::from_secs(30);

/// Concurrency strategy selected from configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    Sequential,
    #[default]
    Threading,
    Cooperative,
    Multiprocessing,
}

impl GroupKind {
    pub fn name(&self) -> &'static str {
        match self {
            GroupKind::Sequential => "sequential",
            GroupKind::Threading => "threading",
            GroupKind::Cooperative => "cooperative",
            GroupKind::Multiprocessing => "multiprocessing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sequential" | "serial" => Some(GroupKind::Sequential),
            "threading" | "thread" | "threads" => Some(GroupKind::Threading),
            "cooperative" | "gevent" => Some(GroupKind::Cooperative),
            "multiprocessing" | "process" | "processes" => Some(GroupKind::Multiprocessing),
            _ => None,
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Strategy running a collection of runnables
pub trait ExecutionGroup: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run every runnable of `collection` into `result`.
    ///
    /// The first fatal error stops the group and is returned.
    fn run(&self, collection: &[RunnableRef], result: &RunResult) -> EngineResult<()>;

    fn is_run(&self) -> bool;
}

/// Group selection for one nesting level
#[derive(Clone)]
pub struct GroupConfig {
    pub kind: GroupKind,
    /// `None` runs sequentially; `<= 0` resolves to the core count
    pub size: Option<i64>,
    pub release_timeout: Duration,
    pub launcher: Option<Arc<dyn Launcher>>,
}

impl fmt::Debug for GroupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupConfig")
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("release_timeout", &self.release_timeout)
            .field("custom_launcher", &self.launcher.is_some())
            .finish()
    }
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self::sequential()
    }
}

impl GroupConfig {
    pub fn sequential() -> Self {
        Self {
            kind: GroupKind::Sequential,
            size: None,
            release_timeout: DEFAULT_RELEASE_TIMEOUT,
            launcher: None,
        }
    }

    pub fn new(kind: GroupKind, size: Option<i64>) -> Self {
        Self {
            kind,
            size,
            ..Self::sequential()
        }
    }

    pub fn with_release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = timeout;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Effective strategy for a collection of `count` runnables
    pub fn effective_kind(&self) -> GroupKind {
        match self.size {
            None => GroupKind::Sequential,
            Some(_) => self.kind,
        }
    }

    /// Build the group for a collection of `count` runnables
    pub fn select(&self, count: usize) -> Box<dyn ExecutionGroup> {
        let size = pool_size(self.size.unwrap_or(1), count);
        match self.effective_kind() {
            GroupKind::Sequential => Box::new(Sequential::new()),
            GroupKind::Threading => Box::new(ThreadPool::new(size)),
            GroupKind::Cooperative => Box::new(CooperativePool::new(size)),
            GroupKind::Multiprocessing => {
                let launcher = self.launcher.clone().unwrap_or_else(|| Arc::new(SelfExec));
                Box::new(ProcessPool::new(size, self.release_timeout, launcher))
            }
        }
    }
}

/// Host core count, at least one
pub fn core_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Pool size from a configured value: `<= 0` means the core count.
///
/// Never larger than the collection and never zero.
pub fn pool_size(configured: i64, count: usize) -> usize {
    let size = if configured <= 0 {
        core_count()
    } else {
        usize::try_from(configured).unwrap_or(usize::MAX)
    };
    size.min(count.max(1)).max(1)
}
