//! Runnable entity contract
//!
//! Every schedulable unit (Program, Suite, Case, Script) implements
//! [`Runnable`] and embeds an [`EntityState`] carrying its identity, the
//! `stopped_on` breadcrumb and free-form reason annotations.

use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{EngineError, EngineResult};
use crate::results::RunResult;

/// Stable identity of a runnable, also used across process boundaries
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunnableId(Arc<str>);

impl RunnableId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunnableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Nesting level of a runnable
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Program,
    Suite,
    Case,
    Script,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Program => "program",
            EntityKind::Suite => "suite",
            EntityKind::Case => "case",
            EntityKind::Script => "script",
        };
        f.write_str(name)
    }
}

/// Minimal interface of every schedulable unit
pub trait Runnable: Send + Sync {
    fn id(&self) -> &RunnableId;

    fn kind(&self) -> EntityKind;

    /// Execute against `result`. Only framework-level failures come back as `Err`.
    fn run(&self, result: &RunResult) -> EngineResult<()>;

    /// Execute as a task on a cooperative group's `LocalSet`.
    ///
    /// Runnables with suspension points override this; the default runs
    /// [`Runnable::run`] to completion in a single poll.
    fn run_local<'a>(&'a self, result: &'a RunResult) -> LocalBoxFuture<'a, EngineResult<()>> {
        Box::pin(async move { self.run(result) })
    }

    fn is_run(&self) -> bool;

    /// Dispatch point that was active when something raised
    fn stopped_on(&self) -> Option<String>;

    /// Rendered reason annotations
    fn reason(&self) -> String;
}

/// Shared runnable handle used by execution groups
pub type RunnableRef = Arc<dyn Runnable>;

/// Identity, breadcrumb and annotations common to all entities
#[derive(Debug)]
pub struct EntityState {
    id: RunnableId,
    kind: EntityKind,
    is_run: AtomicBool,
    stopped_on: Mutex<Option<String>>,
    reasons: Mutex<BTreeMap<String, String>>,
}

impl EntityState {
    pub fn new(kind: EntityKind, id: RunnableId) -> Self {
        Self {
            id,
            kind,
            is_run: AtomicBool::new(false),
            stopped_on: Mutex::new(None),
            reasons: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> &RunnableId {
        &self.id
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn mark_run(&self) {
        self.is_run.store(true, Ordering::SeqCst);
    }

    pub fn is_run(&self) -> bool {
        self.is_run.load(Ordering::SeqCst)
    }

    pub fn set_stopped_on(&self, point: &str) {
        if let Ok(mut slot) = self.stopped_on.lock() {
            *slot = Some(point.to_string());
        }
    }

    pub fn stopped_on(&self) -> Option<String> {
        self.stopped_on.lock().ok().and_then(|slot| slot.clone())
    }

    /// Attach a reason annotation for later reporting
    pub fn add_reason(&self, key: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut reasons) = self.reasons.lock() {
            reasons.insert(key.into(), value.into());
        }
    }

    pub fn reasons(&self) -> BTreeMap<String, String> {
        self.reasons
            .lock()
            .map(|reasons| reasons.clone())
            .unwrap_or_default()
    }

    /// `key: value` lines, in key order
    pub fn render_reasons(&self) -> String {
        self.reasons()
            .iter()
            .map(|(key, value)| format!("{key}: {value}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Binding of an entity to its owner, set once at mount time
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountData {
    /// Owning suite (or program) name
    pub owner: String,
    /// Union of capability names required by the entity and its owner
    pub capabilities: BTreeSet<String>,
}

impl MountData {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            capabilities: BTreeSet::new(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.extend(names.into_iter().map(Into::into));
        self
    }
}

/// Write-once slot guarding mount-gated operations
#[derive(Debug, Default)]
pub struct MountSlot<T> {
    slot: OnceLock<T>,
}

impl<T> MountSlot<T> {
    pub fn new() -> Self {
        Self {
            slot: OnceLock::new(),
        }
    }

    /// Store `value`; a second call is a programming error
    pub fn set(&self, entity: &RunnableId, value: T) -> EngineResult<()> {
        self.slot
            .set(value)
            .map_err(|_| EngineError::misuse(format!("{entity} is already mounted")))
    }

    /// Access the stored value or fail with a programming error
    pub fn get(&self, entity: &RunnableId) -> EngineResult<&T> {
        self.slot
            .get()
            .ok_or_else(|| EngineError::misuse(format!("{entity} used before mount")))
    }

    pub fn is_set(&self) -> bool {
        self.slot.get().is_some()
    }
}
