//! testrig - test suite orchestration engine
//!
//! A [`Program`] owns a catalog of [`Suite`]s, each a collection of
//! [`CaseClass`] declarations materialized into runnable [`Case`]s. Suites
//! and cases are scheduled through pluggable execution groups (sequential,
//! OS threads, cooperative tasks or worker processes) and their outcomes
//! are aggregated into a [`RunResult`] rendered on the console and as an
//! XUnit report.
//!
//! ```no_run
//! use testrig::{ensure_eq, CaseClass, Program, Registry, RunConfig, Suite};
//!
//! let program = Program::new(Registry::shared(), RunConfig::default())
//!     .unwrap()
//!     .suite(Suite::new("math").case(CaseClass::from_fn("Add", |_| ensure_eq(1 + 1, 2))));
//! std::process::exit(program.main());
//! ```

pub mod case;
pub mod cli;
pub mod config;
pub mod context;
pub mod demo;
pub mod error;
pub mod executor;
pub mod extension;
pub mod models;
pub mod program;
pub mod results;
pub mod runnable;
pub mod suite;
pub mod utils;

pub use case::{Case, CaseClass, CaseContext, StepPlan};
pub use config::RunConfig;
pub use context::{HookEvent, HookPoint, Layer, LayerHandle};
pub use error::{EngineError, EngineResult};
pub use executor::{GroupConfig, GroupKind};
pub use extension::{Extension, Registry};
pub use models::{ensure, ensure_eq, Failure, Signal, TestReturn, XUnitData};
pub use program::{Program, Script};
pub use results::RunResult;
pub use runnable::{Runnable, RunnableId};
pub use suite::{BuildRule, Suite, SuiteContext};
