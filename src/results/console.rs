//! Console output for a run
//!
//! Progress markers while tests complete, then a summary line and a
//! detailed reason dump for failures and errors.

use std::fmt::Write as _;
use std::io::Write;
use std::time::Duration;

use super::{Buckets, Entry};
use crate::models::Status;

/// Console sink; silent consoles swallow everything
#[derive(Clone, Debug)]
pub struct Console {
    enabled: bool,
    colorize: bool,
}

impl Console {
    pub fn new(colorize: bool) -> Self {
        Self {
            enabled: true,
            colorize,
        }
    }

    pub fn silent() -> Self {
        Self {
            enabled: false,
            colorize: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Write raw text, colouring single progress markers
    pub fn write(&self, text: &str) {
        if !self.enabled || text.is_empty() {
            return;
        }
        let mut out = std::io::stdout().lock();
        let _ = if self.colorize {
            write!(out, "{}", colorize_markers(text))
        } else {
            write!(out, "{text}")
        };
        let _ = out.flush();
    }

    pub fn line(&self, text: &str) {
        if self.enabled {
            println!("{text}");
        }
    }

    /// `Ran N tests in Xs` followed by `OK` or `FAILED (...)`
    pub fn format_summary(&self, buckets: &Buckets, elapsed: Duration) -> String {
        let mut output = String::new();
        let tests = buckets.tests();
        let plural = if tests == 1 { "" } else { "s" };

        writeln!(output).unwrap_or_default();
        writeln!(output, "{:-<70}", "").unwrap_or_default();
        writeln!(
            output,
            "Ran {tests} test{plural} in {:.3}s",
            elapsed.as_secs_f64()
        )
        .unwrap_or_default();
        writeln!(output).unwrap_or_default();

        let mut parts = Vec::new();
        if !buckets.failures.is_empty() {
            parts.push(format!("failures={}", buckets.failures.len()));
        }
        if !buckets.errors.is_empty() {
            parts.push(format!("errors={}", buckets.errors.len()));
        }
        if !buckets.skipped.is_empty() {
            parts.push(format!("skipped={}", buckets.skipped.len()));
        }

        let verdict = if buckets.was_success() { "OK" } else { "FAILED" };
        let verdict = self.paint(verdict, buckets.was_success());
        if parts.is_empty() {
            writeln!(output, "{verdict}").unwrap_or_default();
        } else {
            writeln!(output, "{verdict} ({})", parts.join(", ")).unwrap_or_default();
        }
        output
    }

    /// Reason dump for every failure and error
    pub fn format_details(&self, buckets: &Buckets) -> String {
        let mut output = String::new();
        for (label, entries) in [("ERROR", &buckets.errors), ("FAIL", &buckets.failures)] {
            for entry in entries {
                write_detail(&mut output, label, entry);
            }
        }
        output
    }

    fn paint(&self, text: &str, good: bool) -> String {
        if !self.colorize {
            return text.to_string();
        }
        let code = if good { "32" } else { "31" };
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

fn write_detail(output: &mut String, label: &str, entry: &Entry) {
    writeln!(output, "{:=<70}", "").unwrap_or_default();
    writeln!(
        output,
        "{label}: {} ({}.{})",
        entry.id,
        entry.data.class_name(),
        entry.data.method_name()
    )
    .unwrap_or_default();
    writeln!(output, "{:-<70}", "").unwrap_or_default();
    if let Some(failure) = entry.data.failure_info() {
        writeln!(output, "{}: {}", failure.kind, failure.message).unwrap_or_default();
        if failure.reason != failure.message {
            writeln!(output, "{}", failure.reason).unwrap_or_default();
        }
    }
    writeln!(output).unwrap_or_default();
}

fn colorize_markers(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        let status = match ch {
            '.' => Some(Status::Success),
            'F' => Some(Status::Fail),
            'E' => Some(Status::Error),
            's' => Some(Status::Skip),
            _ => None,
        };
        match status {
            Some(Status::Success) => out.push_str("\x1b[32m.\x1b[0m"),
            Some(Status::Fail) => out.push_str("\x1b[31mF\x1b[0m"),
            Some(Status::Error) => out.push_str("\x1b[31mE\x1b[0m"),
            Some(Status::Skip) => out.push_str("\x1b[33ms\x1b[0m"),
            None => out.push(ch),
        }
    }
    out
}
