//! Per-entity context
//!
//! A [`Context`] owns the entity's ordered setup/teardown callbacks and the
//! list of visible layers. The layer list is computed once, at mount time:
//! instance layers, then layers registered for the entity kind, then the
//! default layers. The three tiers are concatenated as-is.

mod layer;

pub use layer::{HookEvent, HookPoint, Layer, LayerHandle, LayerRegistry};

use std::fmt;
use std::sync::Arc;
use tracing::error;

use crate::error::{EngineError, EngineResult};
use crate::models::{Signal, TestReturn, XUnitData};
use crate::runnable::EntityState;

/// Lifecycle callback receiving the entity-specific argument
pub type Callback<A> = Arc<dyn Fn(&mut A) -> TestReturn + Send + Sync>;

/// Setup/teardown chains and visible layers of one entity
pub struct Context<A> {
    layers: Vec<LayerHandle>,
    setups: Vec<Callback<A>>,
    teardowns: Vec<Callback<A>>,
    own_setup: Option<Callback<A>>,
    own_teardown: Option<Callback<A>>,
}

impl<A> fmt::Debug for Context<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("layers", &self.layers)
            .field("setups", &(self.setups.len() + usize::from(self.own_setup.is_some())))
            .field(
                "teardowns",
                &(self.teardowns.len() + usize::from(self.own_teardown.is_some())),
            )
            .finish()
    }
}

impl<A> Context<A> {
    /// Build the context, fixing the layer order for the entity's lifetime
    pub fn mount(state: &EntityState, instance: &[LayerHandle], registry: &LayerRegistry) -> Self {
        let mut layers = instance.to_vec();
        layers.extend(registry.typed(state.kind()));
        layers.extend(registry.defaults());
        Self {
            layers,
            setups: Vec::new(),
            teardowns: Vec::new(),
            own_setup: None,
            own_teardown: None,
        }
    }

    /// Set the owner's own callbacks (the innermost entries)
    pub fn with_own(mut self, setup: Option<Callback<A>>, teardown: Option<Callback<A>>) -> Self {
        self.own_setup = setup;
        self.own_teardown = teardown;
        self
    }

    pub fn add_setup(&mut self, callback: Callback<A>) {
        self.setups.push(callback);
    }

    pub fn add_teardown(&mut self, callback: Callback<A>) {
        self.teardowns.push(callback);
    }

    pub fn layers(&self) -> &[LayerHandle] {
        &self.layers
    }

    /// Call every enabled layer's hook for `point`.
    ///
    /// A failing hook tags the entity's breadcrumb and aborts the run.
    pub fn dispatch(
        &self,
        state: &EntityState,
        point: HookPoint,
        data: Option<&XUnitData>,
        reason: Option<&str>,
    ) -> EngineResult<()> {
        let event = HookEvent {
            point,
            kind: state.kind(),
            id: state.id(),
            data,
            reason,
        };
        for layer in self.layers.iter().filter(|l| l.is_enabled()) {
            if let Err(source) = layer.call(&event) {
                state.set_stopped_on(point.name());
                error!(
                    "Layer {} failed in {} of {}: {:#}",
                    layer.name(),
                    point,
                    state.id(),
                    source
                );
                return Err(EngineError::Framework {
                    point: point.name(),
                    entity: state.id().to_string(),
                    source,
                });
            }
        }
        Ok(())
    }

    pub fn on_init(&self, state: &EntityState) -> EngineResult<()> {
        self.dispatch(state, HookPoint::Init, None, None)
    }

    pub fn on_run(&self, state: &EntityState) -> EngineResult<()> {
        self.dispatch(state, HookPoint::Run, None, None)
    }

    pub fn on_skip(&self, state: &EntityState, data: &XUnitData, reason: &str) -> EngineResult<()> {
        self.dispatch(state, HookPoint::Skip, Some(data), Some(reason))
    }

    pub fn on_fail(&self, state: &EntityState, data: &XUnitData) -> EngineResult<()> {
        self.dispatch(state, HookPoint::Fail, Some(data), None)?;
        self.dispatch(state, HookPoint::AnyError, Some(data), None)
    }

    pub fn on_error(&self, state: &EntityState, data: &XUnitData) -> EngineResult<()> {
        self.dispatch(state, HookPoint::Error, Some(data), None)?;
        self.dispatch(state, HookPoint::AnyError, Some(data), None)
    }

    pub fn on_success(&self, state: &EntityState, data: &XUnitData) -> EngineResult<()> {
        self.dispatch(state, HookPoint::Success, Some(data), None)
    }

    /// Layer setup hooks, then the setup chain (outer callbacks first, own last).
    ///
    /// The outer `Err` is fatal; the inner return is the chain's signal.
    pub fn start_context(&self, state: &EntityState, arg: &mut A) -> EngineResult<TestReturn> {
        self.dispatch(state, HookPoint::Setup, None, None)?;
        for callback in self.setups.iter().chain(self.own_setup.iter()) {
            if let Err(signal) = callback(arg) {
                return Ok(Err(signal));
            }
        }
        Ok(Ok(()))
    }

    /// Layer teardown hooks, then the teardown chain (own first).
    ///
    /// Every callback runs; the first signal is returned unless a later one is fatal.
    pub fn stop_context(&self, state: &EntityState, arg: &mut A) -> EngineResult<TestReturn> {
        self.dispatch(state, HookPoint::Teardown, None, None)?;
        let mut kept = Ok(());
        for callback in self.own_teardown.iter().chain(self.teardowns.iter().rev()) {
            let ret = callback(arg);
            let escalates = matches!(ret, Err(Signal::Fatal(_))) && !matches!(kept, Err(Signal::Fatal(_)));
            if kept.is_ok() || escalates {
                kept = ret;
            }
        }
        Ok(kept)
    }
}
