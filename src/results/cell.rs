//! Stop flag shared between a result tree and worker processes
//!
//! A [`StopCell`] starts `Local`; the process pool promotes it to `Shared`
//! once before spawning so that workers can raise it through the
//! filesystem. The flag is monotonic: there is no way to clear it.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tempfile::TempDir;
use tracing::debug;

/// File name of the marker inside a promoted cell's directory
const MARKER: &str = "should-stop";

/// Backing store of the stop flag
#[derive(Clone, Debug)]
pub enum StopCell {
    /// In-process flag
    Local(Arc<AtomicBool>),
    /// Marker-file flag visible to other processes
    Shared(SharedStop),
}

/// Process-shared handle: the marker file plus a local cache
#[derive(Clone, Debug)]
pub struct SharedStop {
    path: PathBuf,
    cache: Arc<AtomicBool>,
    // Keeps the directory alive for the owner; workers attach without it.
    _dir: Option<Arc<TempDir>>,
}

impl SharedStop {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StopCell {
    pub fn is_set(&self) -> bool {
        match self {
            StopCell::Local(flag) => flag.load(Ordering::SeqCst),
            StopCell::Shared(shared) => {
                if shared.cache.load(Ordering::SeqCst) {
                    return true;
                }
                let seen = shared.path.exists();
                if seen {
                    shared.cache.store(true, Ordering::SeqCst);
                }
                seen
            }
        }
    }

    pub fn set(&self) {
        match self {
            StopCell::Local(flag) => flag.store(true, Ordering::SeqCst),
            StopCell::Shared(shared) => {
                shared.cache.store(true, Ordering::SeqCst);
                if let Err(e) = touch(&shared.path) {
                    tracing::warn!("Could not raise shared stop marker {}: {}", shared.path.display(), e);
                }
            }
        }
    }
}

fn touch(path: &Path) -> std::io::Result<()> {
    OpenOptions::new().create(true).append(true).open(path).map(|_| ())
}

/// Stop flag handle shared by a result and all of its proxies
#[derive(Clone, Debug)]
pub struct ShouldStop {
    cell: Arc<RwLock<StopCell>>,
}

impl Default for ShouldStop {
    fn default() -> Self {
        Self::new()
    }
}

impl ShouldStop {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(RwLock::new(StopCell::Local(Arc::new(AtomicBool::new(false))))),
        }
    }

    /// Attach to a marker file created by a parent process
    pub fn attach(path: impl Into<PathBuf>) -> Self {
        let shared = SharedStop {
            path: path.into(),
            cache: Arc::new(AtomicBool::new(false)),
            _dir: None,
        };
        Self {
            cell: Arc::new(RwLock::new(StopCell::Shared(shared))),
        }
    }

    pub fn is_set(&self) -> bool {
        self.cell.read().map(|cell| cell.is_set()).unwrap_or(true)
    }

    pub fn set(&self) {
        if let Ok(cell) = self.cell.read() {
            cell.set();
        }
    }

    pub fn is_shared(&self) -> bool {
        self.cell
            .read()
            .map(|cell| matches!(*cell, StopCell::Shared(_)))
            .unwrap_or(false)
    }

    /// Turn a local cell into a shared one and return the marker path.
    ///
    /// Promoting an already shared cell returns its existing path.
    pub fn promote(&self) -> std::io::Result<PathBuf> {
        let mut cell = self
            .cell
            .write()
            .map_err(|_| std::io::Error::other("stop cell lock poisoned"))?;

        let was_set = match &*cell {
            StopCell::Shared(shared) => return Ok(shared.path.clone()),
            StopCell::Local(flag) => flag.load(Ordering::SeqCst),
        };

        let dir = tempfile::Builder::new().prefix("testrig-stop").tempdir()?;
        let path = dir.path().join(MARKER);
        if was_set {
            touch(&path)?;
        }
        debug!("Promoted stop flag to {}", path.display());

        *cell = StopCell::Shared(SharedStop {
            path: path.clone(),
            cache: Arc::new(AtomicBool::new(was_set)),
            _dir: Some(Arc::new(dir)),
        });
        Ok(path)
    }
}
