//! Test cases
//!
//! A [`CaseClass`] declares tests (plain bodies or step plans), lifecycle
//! callbacks, layers, flows and repeat policy. A Suite materializes one
//! [`Case`] per declared test (and per flow when flows are split); each
//! `Case` is a runnable driving the case state machine:
//!
//! ```text
//! Init -> AlwaysSuccess | Skipped | Armed
//! Armed -> repeat { Setup -> Body (per flow) -> Teardown } -> Success | Fail | Error
//! ```
//!
//! Async bodies suspend at their own `.await` points. Under a cooperative
//! group those are where other cases get to run.

mod steps;

pub use steps::{Step, StepFn, StepPlan};

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::context::{Callback, Context, LayerHandle};
use crate::error::{EngineError, EngineResult};
use crate::extension::{Capabilities, Registry};
use crate::models::{Failure, Outcome, Signal, Status, TestReturn, XUnitData};
use crate::results::RunResult;
use crate::runnable::{EntityKind, EntityState, MountData, MountSlot, Runnable, RunnableId};
use crate::utils::timer::Timer;

/// Test body
pub type TestBody = Arc<dyn Fn(&mut CaseContext) -> TestReturn + Send + Sync>;

/// Test body returning a future that may borrow the context
pub type AsyncTestBody = Arc<dyn for<'c> Fn(&'c mut CaseContext) -> LocalBoxFuture<'c, TestReturn> + Send + Sync>;

#[derive(Clone)]
enum TestKind {
    Body(TestBody),
    Async(AsyncTestBody),
    Steps(Arc<StepPlan>),
}

/// One declared test method of a case class
#[derive(Clone)]
pub struct TestDef {
    name: String,
    kind: TestKind,
    skip: Option<String>,
    always_success: bool,
}

impl fmt::Debug for TestDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestDef")
            .field("name", &self.name)
            .field("steps", &matches!(self.kind, TestKind::Steps(_)))
            .field("async", &matches!(self.kind, TestKind::Async(_)))
            .field("skip", &self.skip)
            .field("always_success", &self.always_success)
            .finish()
    }
}

impl TestDef {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut CaseContext) -> TestReturn + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: TestKind::Body(Arc::new(body)),
            skip: None,
            always_success: false,
        }
    }

    /// Test whose body suspends at its `.await` points
    pub fn new_async<F>(name: impl Into<String>, body: F) -> Self
    where
        F: for<'c> Fn(&'c mut CaseContext) -> LocalBoxFuture<'c, TestReturn> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: TestKind::Async(Arc::new(body)),
            skip: None,
            always_success: false,
        }
    }

    /// Test driven by a step plan
    pub fn with_steps(name: impl Into<String>, plan: StepPlan) -> Self {
        Self {
            name: name.into(),
            kind: TestKind::Steps(Arc::new(plan)),
            skip: None,
            always_success: false,
        }
    }

    /// Mark as skipped with a reason
    pub fn skip(mut self, reason: impl Into<String>) -> Self {
        self.skip = Some(reason.into());
        self
    }

    /// Record success without entering the context or running the body
    pub fn always_success(mut self) -> Self {
        self.always_success = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_async(&self) -> bool {
        matches!(self.kind, TestKind::Async(_))
    }
}

/// Declaration of a group of related tests
#[derive(Clone, Default)]
pub struct CaseClass {
    name: String,
    tests: Vec<TestDef>,
    setup: Option<Callback<CaseContext>>,
    teardown: Option<Callback<CaseContext>>,
    outer_setups: Vec<Callback<CaseContext>>,
    outer_teardowns: Vec<Callback<CaseContext>>,
    layers: Vec<LayerHandle>,
    requires: BTreeSet<String>,
    flows: Vec<serde_json::Value>,
    repeatable: bool,
    repeat: Option<u32>,
    skip: Option<String>,
}

impl fmt::Debug for CaseClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaseClass")
            .field("name", &self.name)
            .field("tests", &self.tests)
            .field("requires", &self.requires)
            .field("flows", &self.flows.len())
            .field("repeatable", &self.repeatable)
            .field("repeat", &self.repeat)
            .finish()
    }
}

impl CaseClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Class wrapping a single plain test function
    pub fn from_fn<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut CaseContext) -> TestReturn + Send + Sync + 'static,
    {
        let name = name.into();
        Self::new(name.clone()).test(name, body)
    }

    pub fn test<F>(self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut CaseContext) -> TestReturn + Send + Sync + 'static,
    {
        self.test_def(TestDef::new(name, body))
    }

    /// Add an async test, e.g. `.test_async("test_wait", |ctx| Box::pin(async move { .. }))`
    pub fn test_async<F>(self, name: impl Into<String>, body: F) -> Self
    where
        F: for<'c> Fn(&'c mut CaseContext) -> LocalBoxFuture<'c, TestReturn> + Send + Sync + 'static,
    {
        self.test_def(TestDef::new_async(name, body))
    }

    pub fn steps(self, name: impl Into<String>, plan: StepPlan) -> Self {
        self.test_def(TestDef::with_steps(name, plan))
    }

    pub fn test_def(mut self, def: TestDef) -> Self {
        self.tests.push(def);
        self
    }

    /// The class's own setup (innermost)
    pub fn setup<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CaseContext) -> TestReturn + Send + Sync + 'static,
    {
        self.setup = Some(Arc::new(f));
        self
    }

    /// The class's own teardown (innermost)
    pub fn teardown<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CaseContext) -> TestReturn + Send + Sync + 'static,
    {
        self.teardown = Some(Arc::new(f));
        self
    }

    /// Extra setup callback running before the class's own setup
    pub fn outer_setup<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CaseContext) -> TestReturn + Send + Sync + 'static,
    {
        self.outer_setups.push(Arc::new(f));
        self
    }

    /// Extra teardown callback running after the class's own teardown
    pub fn outer_teardown<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CaseContext) -> TestReturn + Send + Sync + 'static,
    {
        self.outer_teardowns.push(Arc::new(f));
        self
    }

    pub fn layer(mut self, layer: LayerHandle) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn requires<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires.extend(names.into_iter().map(Into::into));
        self
    }

    /// Replay every test once per flow value
    pub fn flows(mut self, flows: Vec<serde_json::Value>) -> Self {
        self.flows = flows;
        self
    }

    /// Allow repeating; `None` takes the program's repeat count
    pub fn repeatable(mut self, count: Option<u32>) -> Self {
        self.repeatable = true;
        self.repeat = count;
        self
    }

    /// Skip every test of the class
    pub fn skip(mut self, reason: impl Into<String>) -> Self {
        self.skip = Some(reason.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tests(&self) -> &[TestDef] {
        &self.tests
    }

    pub fn test_names(&self) -> impl Iterator<Item = &str> {
        self.tests.iter().map(|t| t.name.as_str())
    }

    pub fn flow_values(&self) -> &[serde_json::Value] {
        &self.flows
    }

    pub fn required(&self) -> &BTreeSet<String> {
        &self.requires
    }
}

/// Build-time options applied to every case of a suite
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaseOptions {
    /// Run tests even when marked skipped
    pub no_skip: bool,
    /// Repeat count for repeatable classes without their own count
    pub repeat: u32,
}

impl Default for CaseOptions {
    fn default() -> Self {
        Self {
            no_skip: false,
            repeat: 1,
        }
    }
}

/// Argument of test bodies, steps and case callbacks
pub struct CaseContext {
    id: RunnableId,
    class_name: String,
    method_name: String,
    flow: Option<serde_json::Value>,
    iteration: u32,
    state: Arc<EntityState>,
    capabilities: Capabilities,
    history: Vec<String>,
}

impl fmt::Debug for CaseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaseContext")
            .field("id", &self.id)
            .field("flow", &self.flow)
            .field("iteration", &self.iteration)
            .finish()
    }
}

impl CaseContext {
    pub(crate) fn new(
        state: Arc<EntityState>,
        class_name: &str,
        method_name: &str,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            id: state.id().clone(),
            class_name: class_name.to_string(),
            method_name: method_name.to_string(),
            flow: None,
            iteration: 0,
            state,
            capabilities,
            history: Vec::new(),
        }
    }

    pub fn id(&self) -> &RunnableId {
        &self.id
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// Active flow value, if the class declares flows
    pub fn flow(&self) -> Option<&serde_json::Value> {
        self.flow.as_ref()
    }

    /// Zero-based repeat iteration
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Borrow a declared capability, creating it on first use
    pub fn capability<T: std::any::Any>(&mut self, name: &str) -> Result<&mut T, Signal> {
        self.capabilities.get_mut(name)
    }

    /// Attach an annotation reported with failures
    pub fn reason(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state.add_reason(key, value);
    }

    /// Skip the rest of this iteration
    pub fn skip(&self, reason: impl Into<String>) -> TestReturn {
        Err(Signal::skip(reason))
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn push_history(&mut self, entry: impl Into<String>) {
        self.history.push(entry.into());
    }
}

struct Mounted {
    data: MountData,
    context: Context<CaseContext>,
    registry: Arc<Registry>,
}

/// Runnable instance of one (test, flow) pairing
pub struct Case {
    state: Arc<EntityState>,
    class: Arc<CaseClass>,
    test: usize,
    /// Set when flows are split into independent cases
    flow: Option<(usize, serde_json::Value)>,
    options: CaseOptions,
    skip_marker: Mutex<Option<String>>,
    mount: MountSlot<Mounted>,
}

impl fmt::Debug for Case {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Case")
            .field("id", self.state.id())
            .field("flow", &self.flow.as_ref().map(|(i, _)| i))
            .field("mounted", &self.mount.is_set())
            .finish()
    }
}

impl Case {
    /// Instance for `class.tests()[test]` owned by `suite`
    pub fn new(
        suite: &str,
        class: Arc<CaseClass>,
        test: usize,
        flow: Option<(usize, serde_json::Value)>,
        options: CaseOptions,
    ) -> EngineResult<Self> {
        let def = class.tests.get(test).ok_or_else(|| {
            EngineError::misuse(format!("{} has no test #{test}", class.name))
        })?;
        let mut id = format!("{suite}:{}.{}", class.name, def.name);
        if let Some((index, _)) = &flow {
            id.push_str(&format!("#{index}"));
        }
        let skip = if options.no_skip {
            None
        } else {
            def.skip.clone().or_else(|| class.skip.clone())
        };
        Ok(Self {
            state: Arc::new(EntityState::new(EntityKind::Case, RunnableId::new(id))),
            class,
            test,
            flow,
            options,
            skip_marker: Mutex::new(skip),
            mount: MountSlot::new(),
        })
    }

    fn def(&self) -> &TestDef {
        &self.class.tests[self.test]
    }

    pub fn class_name(&self) -> String {
        match &self.flow {
            Some((index, _)) => format!("{}#{index}", self.class.name),
            None => self.class.name.clone(),
        }
    }

    pub fn method_name(&self) -> &str {
        &self.def().name
    }

    pub fn class(&self) -> &Arc<CaseClass> {
        &self.class
    }

    /// Bind to the owning suite and compute the layer list. Once only.
    pub fn mount(
        &self,
        suite: &str,
        suite_requires: &BTreeSet<String>,
        registry: Arc<Registry>,
    ) -> EngineResult<()> {
        let data = MountData::new(suite)
            .with_capabilities(self.class.requires.iter().cloned())
            .with_capabilities(suite_requires.iter().cloned());
        for name in &data.capabilities {
            if !registry.contains(name) {
                return Err(EngineError::UnknownCapability(name.clone()));
            }
        }

        let mut context = Context::mount(&self.state, &self.class.layers, registry.layers())
            .with_own(self.class.setup.clone(), self.class.teardown.clone());
        for callback in &self.class.outer_setups {
            context.add_setup(callback.clone());
        }
        for callback in &self.class.outer_teardowns {
            context.add_teardown(callback.clone());
        }

        self.mount.set(
            self.state.id(),
            Mounted {
                data,
                context,
                registry,
            },
        )?;
        self.mount.get(self.state.id())?.context.on_init(&self.state)
    }

    pub fn mount_data(&self) -> EngineResult<&MountData> {
        Ok(&self.mount.get(self.state.id())?.data)
    }

    /// Attach a skip marker before the case runs
    pub fn skip_test(&self, reason: impl Into<String>) {
        if let Ok(mut marker) = self.skip_marker.lock() {
            *marker = Some(reason.into());
        }
    }

    pub fn add_reason(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state.add_reason(key, value);
    }

    fn repeat_count(&self) -> u32 {
        if self.class.repeatable {
            self.class.repeat.unwrap_or(self.options.repeat).max(1)
        } else {
            1
        }
    }

    async fn run_inner(&self, mounted: &Mounted, result: &RunResult) -> EngineResult<()> {
        let def = self.def();
        let class_name = self.class_name();

        if def.always_success {
            let data = XUnitData::success(&class_name, &def.name, 0.0);
            return self.record(mounted, result, data);
        }

        let skip = self.skip_marker.lock().ok().and_then(|m| m.clone());
        if let Some(reason) = skip {
            let data = XUnitData::skip(&class_name, &def.name, 0.0, &reason);
            return self.record(mounted, result, data);
        }

        mounted.context.on_run(&self.state)?;

        let capabilities = Capabilities::new(mounted.registry.clone(), mounted.data.capabilities.clone());
        let mut ctx = CaseContext::new(self.state.clone(), &class_name, &def.name, capabilities);

        for iteration in 0..self.repeat_count() {
            if iteration > 0 && result.should_stop() {
                break;
            }
            ctx.iteration = iteration;
            let timer = Timer::start(self.state.id().as_str());
            let outcome = self.iterate(mounted, &mut ctx).await?;
            let runtime = timer.stop().as_secs_f64();

            let success = matches!(outcome, Outcome::Success);
            let data = XUnitData::from_outcome(&class_name, &def.name, runtime, &self.annotate(outcome, &ctx));
            self.record(mounted, result, data)?;
            if !success {
                break;
            }
        }
        ctx.capabilities.release();
        Ok(())
    }

    /// One Setup -> Body -> Teardown pass
    async fn iterate(&self, mounted: &Mounted, ctx: &mut CaseContext) -> EngineResult<Outcome> {
        let context = &mounted.context;
        ctx.history.clear();

        if let Err(signal) = context.start_context(&self.state, ctx)? {
            debug!("{} setup signalled {:?}", self.state.id(), signal);
            return self.classify(Err(signal));
        }

        let body = self.run_body(ctx).await;
        let teardown = context.stop_context(&self.state, ctx)?;

        let ret = match (body, teardown) {
            (Ok(()), teardown) => teardown,
            (Err(signal), Ok(())) => Err(signal),
            (Err(masked), Err(fatal @ Signal::Fatal(_))) => {
                warn!("{} teardown raised a fatal signal over {:?}", self.state.id(), masked);
                Err(fatal)
            }
            (Err(signal), Err(masked)) => {
                warn!("{} teardown signalled {:?} after an earlier outcome", self.state.id(), masked);
                Err(signal)
            }
        };
        self.classify(ret)
    }

    /// Method-repeat generator: one call, or one per flow value
    async fn run_body(&self, ctx: &mut CaseContext) -> TestReturn {
        let flows: Vec<Option<serde_json::Value>> = match &self.flow {
            Some((_, value)) => vec![Some(value.clone())],
            None if self.class.flows.is_empty() => vec![None],
            None => self.class.flows.iter().cloned().map(Some).collect(),
        };
        for flow in flows {
            ctx.flow = flow;
            self.invoke(ctx).await?;
        }
        Ok(())
    }

    async fn invoke(&self, ctx: &mut CaseContext) -> TestReturn {
        let kind = self.def().kind.clone();
        let ret = match &kind {
            TestKind::Body(body) => catch_unwind(AssertUnwindSafe(|| body(ctx))),
            TestKind::Steps(plan) => catch_unwind(AssertUnwindSafe(|| plan.run(ctx))),
            TestKind::Async(body) => AssertUnwindSafe(body(ctx)).catch_unwind().await,
        };
        match ret {
            Ok(ret) => ret,
            Err(payload) => Err(Signal::Fail(Failure::new("panic", panic_message(payload.as_ref())))),
        }
    }

    fn classify(&self, ret: TestReturn) -> EngineResult<Outcome> {
        Outcome::classify(ret).map_err(|message| {
            self.state.set_stopped_on("run");
            EngineError::fatal(self.state.id().as_str(), message)
        })
    }

    fn annotate(&self, outcome: Outcome, ctx: &CaseContext) -> Outcome {
        let mut notes = self.state.render_reasons();
        if let Some(flow) = ctx.flow() {
            notes = format!("flow: {flow}\n{notes}").trim_end().to_string();
        }
        match outcome {
            Outcome::Fail(mut failure) => {
                failure.annotate(&notes);
                Outcome::Fail(failure)
            }
            Outcome::Error(mut failure) => {
                failure.annotate(&notes);
                Outcome::Error(failure)
            }
            other => other,
        }
    }

    /// Hook chain first, then the bucket. Hook failures escape.
    fn record(&self, mounted: &Mounted, result: &RunResult, data: XUnitData) -> EngineResult<()> {
        let context = &mounted.context;
        let id = self.state.id();
        match data.status() {
            Status::Success => {
                context.on_success(&self.state, &data)?;
                result.add_success(id, data);
            }
            Status::Skip => {
                let reason = data.skip_reason().unwrap_or_default().to_string();
                context.on_skip(&self.state, &data, &reason)?;
                result.add_skip(id, data);
            }
            Status::Fail => {
                context.on_fail(&self.state, &data)?;
                result.add_failure(id, data);
            }
            Status::Error => {
                context.on_error(&self.state, &data)?;
                result.add_error(id, data);
            }
        }
        Ok(())
    }

    async fn run_async(&self, result: &RunResult) -> EngineResult<()> {
        let mounted = self.mount.get(self.state.id())?;
        if result.should_stop() {
            debug!("{} not started: stop requested", self.state.id());
            return Ok(());
        }
        self.state.mark_run();
        let ret = self.run_inner(mounted, result).await;
        if ret.is_err() {
            result.stop();
        }
        ret
    }
}

/// Drive `make()` on a private current-thread runtime.
///
/// A thread already inside a runtime cannot block on another one, so the
/// driver then moves to a scoped helper thread.
fn block_on_runtime<'a, F>(make: impl FnOnce() -> F + Send + 'a) -> EngineResult<()>
where
    F: Future<Output = EngineResult<()>>,
{
    let drive = move || -> EngineResult<()> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        runtime.block_on(make())
    };
    if tokio::runtime::Handle::try_current().is_err() {
        return drive();
    }
    std::thread::scope(|scope| {
        std::thread::Builder::new()
            .name("testrig-case-driver".to_string())
            .spawn_scoped(scope, drive)?
            .join()
            .unwrap_or_else(|_| Err(EngineError::Worker("case driver panicked".to_string())))
    })
}

impl Runnable for Case {
    fn id(&self) -> &RunnableId {
        self.state.id()
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Case
    }

    fn run(&self, result: &RunResult) -> EngineResult<()> {
        if self.def().is_async() {
            block_on_runtime(|| self.run_async(result))
        } else {
            // Nothing suspends without an async body.
            futures::executor::block_on(self.run_async(result))
        }
    }

    fn run_local<'a>(&'a self, result: &'a RunResult) -> LocalBoxFuture<'a, EngineResult<()>> {
        Box::pin(self.run_async(result))
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

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests;
