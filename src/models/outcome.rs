//! Outcome models for a single case run
//!
//! Test bodies report through [`Signal`]; the engine classifies every
//! signal into one [`Outcome`] or lets a fatal one escape.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Details captured for a failure or an error
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Kind of the raised condition (type name for Rust errors)
    pub kind: String,
    pub message: String,
    /// Human-readable reason, including the error chain and annotations
    pub reason: String,
}

impl Failure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: kind.into(),
            reason: message.clone(),
            message,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Build from any std error, walking its source chain into the reason
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let mut reason = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            reason.push_str(&format!("\n  caused by: {cause}"));
            source = cause.source();
        }
        Self {
            kind: short_type_name(std::any::type_name_of_val(err)).to_string(),
            message: err.to_string(),
            reason,
        }
    }

    /// Build from an anyhow error, keeping its context chain
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let reason = err
            .chain()
            .map(|cause| cause.to_string())
            .collect::<Vec<_>>()
            .join("\n  caused by: ");
        Self {
            kind: "Error".to_string(),
            message: err.to_string(),
            reason,
        }
    }

    /// Append a line to the reason text
    pub fn annotate(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }
        self.reason.push('\n');
        self.reason.push_str(line);
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

fn short_type_name(name: &str) -> &str {
    let head = name.split('<').next().unwrap_or(name);
    head.rsplit("::").next().unwrap_or(head)
}

/// Signal raised by a test body, setup/teardown callback or step
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    /// Expected non-execution
    Skip(String),
    /// Assertion did not hold
    Fail(Failure),
    /// Anything else went wrong
    Error(Failure),
    /// Abort the whole run
    Fatal(String),
}

impl Signal {
    pub fn skip(reason: impl Into<String>) -> Self {
        Signal::Skip(reason.into())
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Signal::Fail(Failure::new("AssertionError", message))
    }

    pub fn error(message: impl fmt::Display) -> Self {
        Signal::Error(Failure::new("Error", message.to_string()))
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Signal::Fatal(message.into())
    }

    pub fn from_anyhow(err: anyhow::Error) -> Self {
        Signal::Error(Failure::from_anyhow(&err))
    }
}

impl<E> From<E> for Signal
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Signal::Error(Failure::from_error(&err))
    }
}

/// Return type of test bodies and lifecycle callbacks
pub type TestReturn = Result<(), Signal>;

/// Fail unless `cond` holds
pub fn ensure(cond: bool, message: impl Into<String>) -> TestReturn {
    if cond {
        Ok(())
    } else {
        Err(Signal::fail(message))
    }
}

/// Fail unless both values are equal
pub fn ensure_eq<T>(left: T, right: T) -> TestReturn
where
    T: PartialEq + fmt::Debug,
{
    if left == right {
        Ok(())
    } else {
        Err(Signal::fail(format!("{left:?} != {right:?}")))
    }
}

/// Outcome bucket a case run lands in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Skip,
    Fail,
    Error,
}

impl Status {
    /// Console progress marker
    pub fn marker(&self) -> &'static str {
        match self {
            Status::Success => ".",
            Status::Fail => "F",
            Status::Skip => "s",
            Status::Error => "E",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => write!(f, "OK"),
            Status::Fail => write!(f, "FAIL"),
            Status::Skip => write!(f, "SKIP"),
            Status::Error => write!(f, "ERROR"),
        }
    }
}

/// Classified result of one case run invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Skip(String),
    Fail(Failure),
    Error(Failure),
}

impl Outcome {
    pub fn status(&self) -> Status {
        match self {
            Outcome::Success => Status::Success,
            Outcome::Skip(_) => Status::Skip,
            Outcome::Fail(_) => Status::Fail,
            Outcome::Error(_) => Status::Error,
        }
    }

    /// Split a body return into an outcome, or the fatal message that escapes
    pub fn classify(ret: TestReturn) -> Result<Outcome, String> {
        match ret {
            Ok(()) => Ok(Outcome::Success),
            Err(Signal::Skip(reason)) => Ok(Outcome::Skip(reason)),
            Err(Signal::Fail(failure)) => Ok(Outcome::Fail(failure)),
            Err(Signal::Error(failure)) => Ok(Outcome::Error(failure)),
            Err(Signal::Fatal(message)) => Err(message),
        }
    }
}
