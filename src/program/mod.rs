//! Program orchestration
//!
//! The [`Program`] is the root runnable. It materializes the selected suites
//! from its catalog (and from discovery manifests), orders them, runs the
//! before scripts, drives the suites through the suite-level execution
//! group, runs the after scripts and finally renders the console summary and
//! the optional XUnit report.

mod script;

pub use script::{Script, ScriptFn, SCRIPT_CLASS};

use anyhow::Context as _;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::RunConfig;
use crate::context::{Callback, Context, LayerHandle};
use crate::error::{EngineError, EngineResult};
use crate::executor::worker::{run_worker, WorkerMode, FATAL_EXIT_CODE};
use crate::executor::{GroupConfig, Launcher};
use crate::extension::Registry;
use crate::results::{write_xunit, Console, RunResult};
use crate::models::{Signal, TestReturn, XUnitData};
use crate::runnable::{EntityKind, EntityState, MountSlot, Runnable, RunnableId, RunnableRef};
use crate::suite::discover::discover;
use crate::suite::Suite;
use crate::utils::timer::Timer;

/// Id of the program runnable
pub const PROGRAM_ID: &str = "program";

/// Exit code when the run recorded failures or errors
pub const EXIT_FAILED: i32 = 1;
/// Exit code when the run was aborted by a fatal or framework error
pub const EXIT_ABORTED: i32 = 2;

pub struct Program {
    state: EntityState,
    registry: Arc<Registry>,
    config: RunConfig,
    catalog: Vec<Suite>,
    before: Vec<Script>,
    after: Vec<Script>,
    setup: Option<Callback<()>>,
    teardown: Option<Callback<()>>,
    layers: Vec<LayerHandle>,
    launcher: Option<Arc<dyn Launcher>>,
    suites: Vec<Arc<Suite>>,
    seed: Option<u64>,
    context: MountSlot<Context<()>>,
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("catalog", &self.catalog.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("suites", &self.suites.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("seed", &self.seed)
            .finish()
    }
}

impl Program {
    /// Create the program and install every registered extension once
    pub fn new(registry: Arc<Registry>, config: RunConfig) -> EngineResult<Self> {
        let program = Self {
            state: EntityState::new(EntityKind::Program, RunnableId::new(PROGRAM_ID)),
            registry,
            config,
            catalog: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            setup: None,
            teardown: None,
            layers: Vec::new(),
            launcher: None,
            suites: Vec::new(),
            seed: None,
            context: MountSlot::new(),
        };
        program.registry.install(&program)?;
        Ok(program)
    }

    pub fn suite(mut self, suite: Suite) -> Self {
        self.add_suite(suite);
        self
    }

    pub fn add_suite(&mut self, suite: Suite) {
        self.catalog.push(suite);
    }

    pub fn before(mut self, script: Script) -> Self {
        self.before.push(script);
        self
    }

    pub fn after(mut self, script: Script) -> Self {
        self.after.push(script);
        self
    }

    /// Runs before the scripts and suites. A signal here keeps them from running.
    pub fn setup<F>(mut self, f: F) -> Self
    where
        F: Fn() -> TestReturn + Send + Sync + 'static,
    {
        self.setup = Some(Arc::new(move |_: &mut ()| f()));
        self
    }

    /// Runs after the after scripts, unless setup signalled
    pub fn teardown<F>(mut self, f: F) -> Self
    where
        F: Fn() -> TestReturn + Send + Sync + 'static,
    {
        self.teardown = Some(Arc::new(move |_: &mut ()| f()));
        self
    }

    pub fn layer(mut self, layer: LayerHandle) -> Self {
        self.layers.push(layer);
        self
    }

    /// Replace how process-pool workers are started
    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Shuffle seed used for this run, once prepared with `random`
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    fn is_prepared(&self) -> bool {
        self.context.is_set()
    }

    fn with_launcher(&self, group: GroupConfig) -> GroupConfig {
        match &self.launcher {
            Some(launcher) => group.with_launcher(launcher.clone()),
            None => group,
        }
    }

    /// Select, build and mount the suites, then apply the ordering policy
    pub fn prepare(&mut self) -> EngineResult<()> {
        if self.is_prepared() {
            return Ok(());
        }
        let mut rules = self
            .config
            .rules()
            .map_err(|err| EngineError::misuse(err.to_string()))?;
        if let Some(dir) = &self.config.discover_dir {
            let found = discover(dir).map_err(|source| EngineError::Framework {
                point: "discover",
                entity: dir.display().to_string(),
                source,
            })?;
            info!("Discovered {} selectors under {}", found.len(), dir.display());
            rules.extend(found);
        }
        for rule in &rules {
            if !self.catalog.iter().any(|suite| rule.applies_to(suite.name())) {
                return Err(EngineError::misuse(format!("no suite named '{}' (selector {rule})", rule.suite)));
            }
        }

        let case_group = self.with_launcher(self.config.case_group());
        for mut suite in std::mem::take(&mut self.catalog) {
            let own: Vec<_> = rules.iter().filter(|rule| rule.applies_to(suite.name())).cloned().collect();
            if !rules.is_empty() && own.is_empty() {
                debug!("Suite {} not selected", suite.name());
                continue;
            }
            for rule in own {
                suite.add_rule(rule);
            }
            suite.set_options(self.config.suite_options());
            suite.build(None, None)?;
            suite.mount(self.registry.clone(), case_group.clone())?;
            self.suites.push(Arc::new(suite));
        }

        if self.config.random {
            let seed = self.config.random_seed.unwrap_or_else(|| rand::rng().random());
            info!("Shuffling suites with seed {}", seed);
            self.suites.shuffle(&mut StdRng::seed_from_u64(seed));
            self.seed = Some(seed);
        }

        let context = Context::mount(&self.state, &self.layers, self.registry.layers())
            .with_own(self.setup.clone(), self.teardown.clone());
        self.context.set(self.state.id(), context)?;
        self.context.get(self.state.id())?.on_init(&self.state)
    }

    /// Prepared suites in run order
    pub fn suites(&self) -> &[Arc<Suite>] {
        &self.suites
    }

    /// Look up a suite or case by id
    pub fn find(&self, id: &RunnableId) -> Option<RunnableRef> {
        self.suites.iter().find_map(|suite| suite.find(id))
    }

    /// Render the prepared tree without running it
    pub fn list(&mut self) -> EngineResult<String> {
        self.prepare()?;
        let mut output = String::new();
        let mut total = 0;
        for suite in &self.suites {
            writeln!(output, "{}", suite.name()).unwrap_or_default();
            for case in suite.cases() {
                writeln!(output, "  {}.{}", case.class_name(), case.method_name()).unwrap_or_default();
                total += 1;
            }
        }
        writeln!(output, "{total} tests in {} suites", self.suites.len()).unwrap_or_default();
        Ok(output)
    }

    /// Root result configured for this run
    pub fn new_result(&self) -> RunResult {
        RunResult::with_console(Console::new(self.config.color)).failfast(self.config.stop_on_failure)
    }

    /// Prepare, run and finalize. A fatal error is returned after the report is written.
    pub fn execute(&mut self) -> anyhow::Result<RunResult> {
        self.prepare()?;
        let result = self.new_result();
        let timer = Timer::start(PROGRAM_ID);
        let ran = self.run(&result);
        let elapsed = timer.stop();
        self.finalize(&result, elapsed)?;
        ran?;
        Ok(result)
    }

    /// Console summary, reason dump and optional XUnit report
    pub fn finalize(&self, result: &RunResult, elapsed: Duration) -> anyhow::Result<()> {
        let console = result.console();
        let buckets = result.buckets();
        console.line(&console.format_summary(&buckets, elapsed));
        if !buckets.was_success() {
            console.line(&console.format_details(&buckets));
        }
        if let Some(path) = &self.config.xunit_report {
            write_xunit(result, path)
                .with_context(|| format!("Failed to write XUnit report {}", path.display()))?;
        }
        Ok(())
    }

    /// Process exit code for a finished run
    pub fn exit_code(result: &RunResult) -> i32 {
        if result.was_success() {
            0
        } else {
            EXIT_FAILED
        }
    }

    /// Run as a worker when started by a process pool, else run normally.
    ///
    /// The registry is cleared before returning.
    pub fn main(mut self) -> i32 {
        let code = match WorkerMode::from_env() {
            Some(mode) => match self.prepare() {
                Ok(()) => run_worker(&mode, self.find(&mode.id), self.config.stop_on_failure),
                Err(err) => {
                    error!("Worker could not prepare the program: {}", err);
                    FATAL_EXIT_CODE
                }
            },
            None => match self.execute() {
                Ok(result) => Self::exit_code(&result),
                Err(err) => {
                    error!("Run aborted: {:#}", err);
                    EXIT_ABORTED
                }
            },
        };
        self.registry.clear();
        code
    }

    fn run_scripts(scripts: &[Script], result: &RunResult) -> EngineResult<()> {
        for script in scripts {
            script.run(result)?;
        }
        Ok(())
    }

    fn run_inner(&self, context: &Context<()>, result: &RunResult) -> EngineResult<()> {
        context.on_run(&self.state)?;
        if let Err(signal) = context.start_context(&self.state, &mut ())? {
            return self.record_signal(context, result, "setup", signal);
        }

        let mut ran = Ok(());
        if !self.config.no_scripts && !result.should_stop() {
            ran = Self::run_scripts(&self.before, result);
        }
        if ran.is_ok() {
            let collection: Vec<RunnableRef> = self.suites.iter().map(|s| s.clone() as RunnableRef).collect();
            let group = self.with_launcher(self.config.suite_group()).select(collection.len());
            info!("Running {} suites on {}", collection.len(), group.name());
            ran = group.run(&collection, result);
        }
        if !self.config.no_scripts {
            let after = Self::run_scripts(&self.after, result);
            ran = ran.and(after);
        }

        let teardown = context.stop_context(&self.state, &mut ());
        ran?;
        if let Err(signal) = teardown? {
            self.record_signal(context, result, "teardown", signal)?;
        }
        Ok(())
    }

    /// Program-level outcome of a setup or teardown signal
    fn record_signal(&self, context: &Context<()>, result: &RunResult, point: &str, signal: Signal) -> EngineResult<()> {
        match signal {
            Signal::Fatal(message) => {
                self.state.set_stopped_on(point);
                Err(EngineError::fatal(PROGRAM_ID, message))
            }
            Signal::Skip(reason) if point == "setup" => {
                info!("Program skipped in setup: {}", reason);
                for suite in &self.suites {
                    for case in suite.cases() {
                        let data = XUnitData::skip(&case.class_name(), case.method_name(), 0.0, &reason);
                        context.on_skip(&self.state, &data, &reason)?;
                        result.add_skip(case.id(), data);
                    }
                }
                Ok(())
            }
            Signal::Skip(reason) => {
                debug!("Program teardown skipped: {}", reason);
                Ok(())
            }
            Signal::Fail(mut failure) | Signal::Error(mut failure) => {
                warn!("Program {} failed: {}", point, failure.message);
                failure.annotate(&self.state.render_reasons());
                let data = XUnitData::error(PROGRAM_ID, point, 0.0, failure);
                context.on_error(&self.state, &data)?;
                result.add_error(self.state.id(), data);
                Ok(())
            }
        }
    }
}

impl Runnable for Program {
    fn id(&self) -> &RunnableId {
        self.state.id()
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Program
    }

    fn run(&self, result: &RunResult) -> EngineResult<()> {
        let context = self.context.get(self.state.id())?;
        if result.should_stop() {
            return Ok(());
        }
        self.state.mark_run();
        let ret = self.run_inner(context, result);
        if let Err(err) = &ret {
            error!("Program aborted: {}", err);
            if self.state.stopped_on().is_none() {
                self.state.set_stopped_on("run");
            }
            result.stop();
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

#[cfg(test)]
mod tests;
