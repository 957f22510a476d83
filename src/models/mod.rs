//! Data models for test outcomes
//!
//! This module contains the outcome signals and the XUnit snapshot record.

mod outcome;
mod xunit;

pub use outcome::{ensure, ensure_eq, Failure, Outcome, Signal, Status, TestReturn};
pub use xunit::{XUnitData, RUNTIME_PRECISION};
