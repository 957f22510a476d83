//! Extension registry
//!
//! Name-to-factory lookup for capabilities such as a browser driver or a
//! database client. The registry is an explicit object handed to the
//! program (and from there to suites and cases); extensions are installed
//! once at program construction and the registry is cleared when the
//! program finishes.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::context::LayerRegistry;
use crate::error::{EngineError, EngineResult};
use crate::models::Signal;
use crate::program::Program;

/// A capability instance owned by one case or suite
pub type Capability = Box<dyn Any + Send>;

/// Registered capability provider
pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    /// Called once when the program is constructed
    fn install(&self, _program: &Program) -> anyhow::Result<()> {
        Ok(())
    }

    /// Create a fresh instance for one owner
    fn create(&self) -> anyhow::Result<Capability>;
}

/// Extension backed by a factory closure
pub struct FnExtension<F> {
    name: String,
    factory: F,
}

impl<F> FnExtension<F>
where
    F: Fn() -> anyhow::Result<Capability> + Send + Sync,
{
    pub fn new(name: impl Into<String>, factory: F) -> Self {
        Self {
            name: name.into(),
            factory,
        }
    }
}

impl<F> Extension for FnExtension<F>
where
    F: Fn() -> anyhow::Result<Capability> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self) -> anyhow::Result<Capability> {
        (self.factory)()
    }
}

/// Extensions plus the program-wide layer tiers
pub struct Registry {
    // `None` once cleared.
    extensions: RwLock<Option<BTreeMap<String, Arc<dyn Extension>>>>,
    layers: LayerRegistry,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("extensions", &self.names())
            .field("cleared", &self.is_cleared())
            .finish()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            extensions: RwLock::new(Some(BTreeMap::new())),
            layers: LayerRegistry::new(),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register or replace an extension under its name
    pub fn register<E: Extension + 'static>(&self, extension: E) -> EngineResult<()> {
        let name = extension.name().to_string();
        let mut guard = self
            .extensions
            .write()
            .map_err(|_| EngineError::misuse("extension registry lock poisoned"))?;
        let map = guard
            .as_mut()
            .ok_or_else(|| EngineError::RegistryCleared {
                capability: name.clone(),
            })?;
        debug!("Registered extension {}", name);
        map.insert(name, Arc::new(extension));
        Ok(())
    }

    /// Register a factory closure
    pub fn register_fn<F>(&self, name: impl Into<String>, factory: F) -> EngineResult<()>
    where
        F: Fn() -> anyhow::Result<Capability> + Send + Sync + 'static,
    {
        self.register(FnExtension::new(name, factory))
    }

    /// Create a fresh capability instance by name
    pub fn get(&self, name: &str) -> EngineResult<Capability> {
        let extension = {
            let guard = self
                .extensions
                .read()
                .map_err(|_| EngineError::misuse("extension registry lock poisoned"))?;
            let map = guard.as_ref().ok_or_else(|| EngineError::RegistryCleared {
                capability: name.to_string(),
            })?;
            map.get(name)
                .cloned()
                .ok_or_else(|| EngineError::UnknownCapability(name.to_string()))?
        };
        extension.create().map_err(|source| EngineError::Framework {
            point: "get",
            entity: name.to_string(),
            source,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.extensions
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|map| map.contains_key(name)))
            .unwrap_or(false)
    }

    pub fn names(&self) -> Vec<String> {
        self.extensions
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|map| map.keys().cloned().collect()))
            .unwrap_or_default()
    }

    /// Call `install` on every registered extension
    pub fn install(&self, program: &Program) -> EngineResult<()> {
        let extensions: Vec<Arc<dyn Extension>> = self
            .extensions
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|map| map.values().cloned().collect()))
            .unwrap_or_default();
        for extension in extensions {
            extension.install(program).map_err(|source| EngineError::Framework {
                point: "install",
                entity: extension.name().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    /// Drop every extension and layer; later lookups are fatal
    pub fn clear(&self) {
        if let Ok(mut guard) = self.extensions.write() {
            *guard = None;
        }
        self.layers.clear();
    }

    pub fn is_cleared(&self) -> bool {
        self.extensions
            .read()
            .map(|guard| guard.is_none())
            .unwrap_or(true)
    }

    pub fn layers(&self) -> &LayerRegistry {
        &self.layers
    }
}

/// Capability instances owned by one case or suite.
///
/// Instances are created lazily from the registry on first use and dropped
/// with the owner. Only names declared at build time can be looked up.
pub struct Capabilities {
    registry: Arc<Registry>,
    declared: BTreeSet<String>,
    instances: HashMap<String, Capability>,
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("declared", &self.declared)
            .field("created", &self.instances.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Capabilities {
    pub fn new(registry: Arc<Registry>, declared: BTreeSet<String>) -> Self {
        Self {
            registry,
            declared,
            instances: HashMap::new(),
        }
    }

    pub fn declared(&self) -> &BTreeSet<String> {
        &self.declared
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Borrow the instance for `name`, creating it on first use
    pub fn get_mut<T: Any>(&mut self, name: &str) -> Result<&mut T, Signal> {
        if !self.declared.contains(name) {
            return Err(Signal::error(format!(
                "capability '{name}' is not declared as required"
            )));
        }
        if !self.instances.contains_key(name) {
            let instance = self.registry.get(name).map_err(|err| match err {
                EngineError::RegistryCleared { .. } => Signal::fatal(err.to_string()),
                other => Signal::error(other),
            })?;
            self.instances.insert(name.to_string(), instance);
        }
        self.instances
            .get_mut(name)
            .and_then(|instance| instance.downcast_mut::<T>())
            .ok_or_else(|| {
                Signal::error(format!(
                    "capability '{name}' is not a {}",
                    std::any::type_name::<T>()
                ))
            })
    }

    /// Drop every created instance
    pub fn release(&mut self) {
        self.instances.clear();
    }
}
