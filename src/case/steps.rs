//! Step/flow controller
//!
//! A test can be declared as an ordered list of numbered steps instead of a
//! single body. The driver runs `begin`, every step in ascending weight
//! order, then `finish`, keeping a running history that ends up in the
//! failure reason when something goes wrong.

use std::fmt;
use std::sync::Arc;

use super::CaseContext;
use crate::models::{Signal, TestReturn};

/// Step function
pub type StepFn = Arc<dyn Fn(&mut CaseContext) -> TestReturn + Send + Sync>;

/// One registered step
#[derive(Clone)]
pub struct Step {
    pub weight: u32,
    pub description: String,
    func: StepFn,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Step({}, {:?})", self.weight, self.description)
    }
}

/// Ordered steps with optional begin/finish
#[derive(Clone, Default)]
pub struct StepPlan {
    begin: Option<StepFn>,
    steps: Vec<Step>,
    finish: Option<StepFn>,
}

impl fmt::Debug for StepPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepPlan")
            .field("begin", &self.begin.is_some())
            .field("steps", &self.steps)
            .field("finish", &self.finish.is_some())
            .finish()
    }
}

impl StepPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CaseContext) -> TestReturn + Send + Sync + 'static,
    {
        self.begin = Some(Arc::new(f));
        self
    }

    /// Register a step; equal weights keep registration order
    pub fn step<F>(mut self, weight: u32, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut CaseContext) -> TestReturn + Send + Sync + 'static,
    {
        let step = Step {
            weight,
            description: description.into(),
            func: Arc::new(f),
        };
        let at = self.steps.partition_point(|s| s.weight <= weight);
        self.steps.insert(at, step);
        self
    }

    pub fn finish<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CaseContext) -> TestReturn + Send + Sync + 'static,
    {
        self.finish = Some(Arc::new(f));
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Drive begin, steps, finish once
    pub fn run(&self, ctx: &mut CaseContext) -> TestReturn {
        if let Some(begin) = &self.begin {
            ctx.push_history("begin");
            begin(ctx).map_err(|signal| with_history(signal, ctx))?;
        }
        for step in &self.steps {
            ctx.push_history(format!("Step {}: {}", step.weight, step.description));
            (step.func)(ctx).map_err(|signal| with_history(signal, ctx))?;
        }
        if let Some(finish) = &self.finish {
            ctx.push_history("finish");
            finish(ctx).map_err(|signal| with_history(signal, ctx))?;
        }
        Ok(())
    }
}

fn with_history(signal: Signal, ctx: &CaseContext) -> Signal {
    let history = format!("History:\n  {}", ctx.history().join("\n  "));
    match signal {
        Signal::Fail(mut failure) => {
            failure.annotate(&history);
            Signal::Fail(failure)
        }
        Signal::Error(mut failure) => {
            failure.annotate(&history);
            Signal::Error(failure)
        }
        other => other,
    }
}
