//! XUnit outcome snapshot
//!
//! One record per case run invocation. Records are immutable once built and
//! serialize through serde so they survive the trip out of a worker process.

use serde::{Deserialize, Serialize};

use super::outcome::{Failure, Outcome, Status};

/// Decimal places kept when reading back a runtime
pub const RUNTIME_PRECISION: i32 = 3;

/// Outcome snapshot for one test run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct XUnitData {
    class_name: String,
    method_name: String,
    runtime: f64,
    status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure: Option<Failure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    skip_reason: Option<String>,
}

impl XUnitData {
    fn base(class_name: &str, method_name: &str, runtime: f64, status: Status) -> Self {
        Self {
            class_name: class_name.to_string(),
            method_name: method_name.to_string(),
            runtime,
            status,
            failure: None,
            skip_reason: None,
        }
    }

    pub fn success(class_name: &str, method_name: &str, runtime: f64) -> Self {
        Self::base(class_name, method_name, runtime, Status::Success)
    }

    pub fn skip(class_name: &str, method_name: &str, runtime: f64, reason: &str) -> Self {
        let mut data = Self::base(class_name, method_name, runtime, Status::Skip);
        data.skip_reason = Some(reason.to_string());
        data
    }

    pub fn failure(class_name: &str, method_name: &str, runtime: f64, failure: Failure) -> Self {
        let mut data = Self::base(class_name, method_name, runtime, Status::Fail);
        data.failure = Some(failure);
        data
    }

    pub fn error(class_name: &str, method_name: &str, runtime: f64, failure: Failure) -> Self {
        let mut data = Self::base(class_name, method_name, runtime, Status::Error);
        data.failure = Some(failure);
        data
    }

    /// Snapshot a classified outcome
    pub fn from_outcome(class_name: &str, method_name: &str, runtime: f64, outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Success => Self::success(class_name, method_name, runtime),
            Outcome::Skip(reason) => Self::skip(class_name, method_name, runtime, reason),
            Outcome::Fail(failure) => Self::failure(class_name, method_name, runtime, failure.clone()),
            Outcome::Error(failure) => Self::error(class_name, method_name, runtime, failure.clone()),
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// Runtime in seconds, rounded to [`RUNTIME_PRECISION`] places
    pub fn runtime(&self) -> f64 {
        let scale = 10f64.powi(RUNTIME_PRECISION);
        (self.runtime * scale).round() / scale
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn failure_info(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    pub fn kind(&self) -> Option<&str> {
        self.failure.as_ref().map(|f| f.kind.as_str())
    }

    pub fn message(&self) -> Option<&str> {
        self.failure.as_ref().map(|f| f.message.as_str())
    }

    pub fn reason(&self) -> Option<&str> {
        self.failure
            .as_ref()
            .map(|f| f.reason.as_str())
            .or(self.skip_reason.as_deref())
    }

    pub fn skip_reason(&self) -> Option<&str> {
        self.skip_reason.as_deref()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}
