//! Test suites
//!
//! A [`Suite`] names an ordered list of case classes. Building materializes
//! one [`Case`] per selected test (per flow when flows are split); running
//! enters the suite context and drives the cases through an execution group
//! inside a result proxy scoped to the suite.

pub mod discover;
mod rule;

pub use rule::{parse_rules, BuildRule, RuleError};

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info};

use crate::case::{Case, CaseClass, CaseOptions};
use crate::context::{Callback, Context, LayerHandle};
use crate::error::{EngineError, EngineResult};
use crate::executor::GroupConfig;
use crate::extension::{Capabilities, Registry};
use crate::models::{Signal, TestReturn, XUnitData};
use crate::results::RunResult;
use crate::runnable::{EntityKind, EntityState, MountSlot, Runnable, RunnableId, RunnableRef};

/// Build-time options
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SuiteOptions {
    pub case: CaseOptions,
    /// Expand a class with N flows into N independent cases
    pub split_flows: bool,
}

/// Argument of suite setup/teardown callbacks
pub struct SuiteContext {
    name: String,
    state: Arc<EntityState>,
    capabilities: Capabilities,
}

impl fmt::Debug for SuiteContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuiteContext").field("name", &self.name).finish()
    }
}

impl SuiteContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capability<T: std::any::Any>(&mut self, name: &str) -> Result<&mut T, Signal> {
        self.capabilities.get_mut(name)
    }

    pub fn reason(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state.add_reason(key, value);
    }
}

struct Mounted {
    context: Context<SuiteContext>,
    registry: Arc<Registry>,
    group: GroupConfig,
}

pub struct Suite {
    state: Arc<EntityState>,
    classes: Vec<Arc<CaseClass>>,
    setup: Option<Callback<SuiteContext>>,
    teardown: Option<Callback<SuiteContext>>,
    layers: Vec<LayerHandle>,
    requires: BTreeSet<String>,
    rules: Vec<BuildRule>,
    options: SuiteOptions,
    cases: OnceLock<Vec<Arc<Case>>>,
    mount: MountSlot<Mounted>,
}

impl fmt::Debug for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suite")
            .field("name", &self.name())
            .field("classes", &self.classes.iter().map(|c| c.name()).collect::<Vec<_>>())
            .field("rules", &self.rules)
            .field("built", &self.cases.get().map(Vec::len))
            .field("mounted", &self.mount.is_set())
            .finish()
    }
}

impl Suite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(EntityState::new(EntityKind::Suite, RunnableId::new(name.into()))),
            classes: Vec::new(),
            setup: None,
            teardown: None,
            layers: Vec::new(),
            requires: BTreeSet::new(),
            rules: Vec::new(),
            options: SuiteOptions::default(),
            cases: OnceLock::new(),
            mount: MountSlot::new(),
        }
    }

    pub fn case(mut self, class: CaseClass) -> Self {
        self.classes.push(Arc::new(class));
        self
    }

    pub fn setup<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut SuiteContext) -> TestReturn + Send + Sync + 'static,
    {
        self.setup = Some(Arc::new(f));
        self
    }

    pub fn teardown<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut SuiteContext) -> TestReturn + Send + Sync + 'static,
    {
        self.teardown = Some(Arc::new(f));
        self
    }

    pub fn layer(mut self, layer: LayerHandle) -> Self {
        self.layers.push(layer);
        self
    }

    /// Capabilities available to the suite and all of its cases
    pub fn requires<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_options(mut self, options: SuiteOptions) -> Self {
        self.options = options;
        self
    }

    pub fn set_options(&mut self, options: SuiteOptions) {
        self.options = options;
    }

    /// Accumulate a rule; rules for other suites are ignored at build time
    pub fn add_rule(&mut self, rule: BuildRule) {
        if !self.rules.contains(&rule) {
            self.rules.push(rule);
        }
    }

    pub fn name(&self) -> &str {
        self.state.id().as_str()
    }

    pub fn classes(&self) -> &[Arc<CaseClass>] {
        &self.classes
    }

    pub fn rules(&self) -> &[BuildRule] {
        &self.rules
    }

    pub fn is_built(&self) -> bool {
        self.cases.get().is_some()
    }

    /// Built cases; empty before `build`
    pub fn cases(&self) -> &[Arc<Case>] {
        self.cases.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Materialize cases from an explicit filter or the accumulated rules.
    ///
    /// Building twice is an error. Returns the number of built cases.
    pub fn build(&self, case: Option<&str>, test: Option<&str>) -> EngineResult<usize> {
        if self.is_built() {
            return Err(EngineError::misuse(format!("suite {} is already built", self.name())));
        }
        let rules: Vec<BuildRule> = match case {
            Some(case) => vec![BuildRule {
                suite: self.name().to_string(),
                case: Some(case.to_string()),
                test: test.map(str::to_string),
            }],
            None => self
                .rules
                .iter()
                .filter(|rule| rule.applies_to(self.name()))
                .cloned()
                .collect(),
        };
        let select_all = rules.is_empty() || rules.iter().any(|rule| rule.case.is_none());

        let mut cases = Vec::new();
        for class in &self.classes {
            for (index, def) in class.tests().iter().enumerate() {
                if !select_all && !rules.iter().any(|rule| rule.selects(class.name(), def.name())) {
                    continue;
                }
                if self.options.split_flows && !class.flow_values().is_empty() {
                    for (flow_index, flow) in class.flow_values().iter().enumerate() {
                        let flow = Some((flow_index, flow.clone()));
                        cases.push(Arc::new(Case::new(self.name(), class.clone(), index, flow, self.options.case)?));
                    }
                } else {
                    cases.push(Arc::new(Case::new(self.name(), class.clone(), index, None, self.options.case)?));
                }
            }
        }

        let count = cases.len();
        self.cases
            .set(cases)
            .map_err(|_| EngineError::misuse(format!("suite {} is already built", self.name())))?;
        debug!("Built suite {} with {} cases", self.name(), count);
        Ok(count)
    }

    /// Compute layers, bind the case-level group and mount every case. Once only.
    pub fn mount(&self, registry: Arc<Registry>, group: GroupConfig) -> EngineResult<()> {
        if !self.is_built() {
            return Err(EngineError::misuse(format!("suite {} mounted before build", self.name())));
        }
        for name in &self.requires {
            if !registry.contains(name) {
                return Err(EngineError::UnknownCapability(name.clone()));
            }
        }
        let context = Context::mount(&self.state, &self.layers, registry.layers())
            .with_own(self.setup.clone(), self.teardown.clone());
        self.mount.set(
            self.state.id(),
            Mounted {
                context,
                registry: registry.clone(),
                group,
            },
        )?;
        self.mount.get(self.state.id())?.context.on_init(&self.state)?;
        for case in self.cases() {
            case.mount(self.name(), &self.requires, registry.clone())?;
        }
        Ok(())
    }

    pub fn add_reason(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state.add_reason(key, value);
    }

    /// Look up this suite or one of its cases by id
    pub fn find(self: &Arc<Self>, id: &RunnableId) -> Option<RunnableRef> {
        if self.state.id() == id {
            return Some(self.clone() as RunnableRef);
        }
        self.cases()
            .iter()
            .find(|case| case.id() == id)
            .map(|case| case.clone() as RunnableRef)
    }

    fn run_inner(&self, mounted: &Mounted, result: &RunResult) -> EngineResult<()> {
        let context = &mounted.context;
        context.on_run(&self.state)?;

        let mut ctx = SuiteContext {
            name: self.name().to_string(),
            state: self.state.clone(),
            capabilities: Capabilities::new(mounted.registry.clone(), self.requires.clone()),
        };
        if let Err(signal) = context.start_context(&self.state, &mut ctx)? {
            return self.record_signal(mounted, result, "setup", signal);
        }

        let collection: Vec<RunnableRef> = self.cases().iter().map(|case| case.clone() as RunnableRef).collect();
        let group = mounted.group.select(collection.len());
        debug!("Suite {} runs {} cases on {}", self.name(), collection.len(), group.name());
        let ran = group.run(&collection, result);

        let teardown = context.stop_context(&self.state, &mut ctx);
        ctx.capabilities.release();
        ran?;
        if let Err(signal) = teardown? {
            self.record_signal(mounted, result, "teardown", signal)?;
        }
        Ok(())
    }

    /// Suite-level outcome of a setup or teardown signal
    fn record_signal(&self, mounted: &Mounted, result: &RunResult, point: &str, signal: Signal) -> EngineResult<()> {
        let context = &mounted.context;
        match signal {
            Signal::Fatal(message) => {
                self.state.set_stopped_on(point);
                Err(EngineError::fatal(self.name(), message))
            }
            Signal::Skip(reason) if point == "setup" => {
                for case in self.cases() {
                    let data = XUnitData::skip(&case.class_name(), case.method_name(), 0.0, &reason);
                    context.on_skip(&self.state, &data, &reason)?;
                    result.add_skip(case.id(), data);
                }
                Ok(())
            }
            Signal::Skip(reason) => {
                debug!("Suite {} teardown skipped: {}", self.name(), reason);
                Ok(())
            }
            Signal::Fail(mut failure) | Signal::Error(mut failure) => {
                failure.annotate(&self.state.render_reasons());
                let data = XUnitData::error(self.name(), point, 0.0, failure);
                context.on_error(&self.state, &data)?;
                result.add_error(self.state.id(), data);
                Ok(())
            }
        }
    }
}

impl Runnable for Suite {
    fn id(&self) -> &RunnableId {
        self.state.id()
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Suite
    }

    fn run(&self, result: &RunResult) -> EngineResult<()> {
        let mounted = self.mount.get(self.state.id())?;
        if result.should_stop() || self.cases().is_empty() {
            debug!("Suite {} not started", self.name());
            return Ok(());
        }
        self.state.mark_run();
        info!("Suite {} started ({} cases)", self.name(), self.cases().len());

        let proxy = result.proxy(self.name());
        let ret = self.run_inner(mounted, &proxy);
        match &ret {
            Ok(()) => info!(
                "Suite {} finished: {} tests, {} failures, {} errors",
                self.name(),
                proxy.tests_run(),
                proxy.failures().len(),
                proxy.errors().len()
            ),
            Err(err) => {
                error!("Suite {} aborted: {}", self.name(), err);
                proxy.stop();
            }
        }
        ret
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
