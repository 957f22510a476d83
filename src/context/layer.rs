//! Layers: cross-cutting observers with optional lifecycle hooks
//!
//! A layer implements only the hooks it cares about; the rest default to
//! no-ops. Layers attach per instance, per entity kind or globally, and
//! each attachment can be switched off at runtime through its
//! [`LayerHandle`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::models::XUnitData;
use crate::runnable::{EntityKind, RunnableId};

/// Dispatch points a layer can observe
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookPoint {
    Init,
    Run,
    Setup,
    Teardown,
    Skip,
    Fail,
    Error,
    AnyError,
    Success,
}

impl HookPoint {
    pub fn name(&self) -> &'static str {
        match self {
            HookPoint::Init => "on_init",
            HookPoint::Run => "on_run",
            HookPoint::Setup => "on_setup",
            HookPoint::Teardown => "on_teardown",
            HookPoint::Skip => "on_skip",
            HookPoint::Fail => "on_fail",
            HookPoint::Error => "on_error",
            HookPoint::AnyError => "on_any_error",
            HookPoint::Success => "on_success",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a hook gets to see
#[derive(Clone, Copy, Debug)]
pub struct HookEvent<'a> {
    pub point: HookPoint,
    pub kind: EntityKind,
    pub id: &'a RunnableId,
    /// Snapshot being recorded (outcome hooks only)
    pub data: Option<&'a XUnitData>,
    /// Skip reason (skip hook only)
    pub reason: Option<&'a str>,
}

/// Capability object with optional lifecycle hooks
pub trait Layer: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn on_init(&self, _event: &HookEvent<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_run(&self, _event: &HookEvent<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_setup(&self, _event: &HookEvent<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_teardown(&self, _event: &HookEvent<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_skip(&self, _event: &HookEvent<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_fail(&self, _event: &HookEvent<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_error(&self, _event: &HookEvent<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after `on_fail` or `on_error`
    fn on_any_error(&self, _event: &HookEvent<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_success(&self, _event: &HookEvent<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Attachment of a layer that can be disabled at runtime
#[derive(Clone)]
pub struct LayerHandle {
    layer: Arc<dyn Layer>,
    enabled: Arc<AtomicBool>,
}

impl fmt::Debug for LayerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerHandle")
            .field("layer", &self.layer.name())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl LayerHandle {
    pub fn new<L: Layer + 'static>(layer: L) -> Self {
        Self::from_arc(Arc::new(layer))
    }

    pub fn from_arc(layer: Arc<dyn Layer>) -> Self {
        Self {
            layer,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn name(&self) -> &str {
        self.layer.name()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Invoke the hook for `event.point`
    pub fn call(&self, event: &HookEvent<'_>) -> anyhow::Result<()> {
        let layer = &self.layer;
        match event.point {
            HookPoint::Init => layer.on_init(event),
            HookPoint::Run => layer.on_run(event),
            HookPoint::Setup => layer.on_setup(event),
            HookPoint::Teardown => layer.on_teardown(event),
            HookPoint::Skip => layer.on_skip(event),
            HookPoint::Fail => layer.on_fail(event),
            HookPoint::Error => layer.on_error(event),
            HookPoint::AnyError => layer.on_any_error(event),
            HookPoint::Success => layer.on_success(event),
        }
    }
}

/// Type-matched and default layers shared by a whole program
#[derive(Debug, Default)]
pub struct LayerRegistry {
    typed: RwLock<HashMap<EntityKind, Vec<LayerHandle>>>,
    defaults: RwLock<Vec<LayerHandle>>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to every entity of `kind`
    pub fn add_typed(&self, kind: EntityKind, layer: LayerHandle) {
        if let Ok(mut typed) = self.typed.write() {
            typed.entry(kind).or_default().push(layer);
        }
    }

    /// Attach to every entity
    pub fn add_default(&self, layer: LayerHandle) {
        if let Ok(mut defaults) = self.defaults.write() {
            defaults.push(layer);
        }
    }

    pub fn typed(&self, kind: EntityKind) -> Vec<LayerHandle> {
        self.typed
            .read()
            .ok()
            .and_then(|typed| typed.get(&kind).cloned())
            .unwrap_or_default()
    }

    pub fn defaults(&self) -> Vec<LayerHandle> {
        self.defaults
            .read()
            .map(|defaults| defaults.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut typed) = self.typed.write() {
            typed.clear();
        }
        if let Ok(mut defaults) = self.defaults.write() {
            defaults.clear();
        }
    }
}
