//! XUnit XML report rendering
//!
//! One `<testsuite>` per top-level proxy under a `<testsuites>` root. Entries
//! recorded straight into the root (scripts, program setup) land in an extra
//! root suite.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use std::fmt::Write;
use std::path::Path;
use tracing::info;

use super::{Buckets, Entry, ProxyRecord, RunResult};
use crate::models::Status;

/// Name of the suite element holding entries no proxy recorded
const ROOT_SUITE: &str = "testrig";

/// Root entries not accounted for by any proxy snapshot
fn unclaimed(buckets: &Buckets, suites: &[ProxyRecord]) -> Buckets {
    let mut claimed: Vec<&Entry> = suites.iter().flat_map(|suite| suite.buckets.iter()).collect();
    let mut rest = Buckets::default();
    for entry in buckets.iter() {
        match claimed.iter().position(|other| *other == entry) {
            Some(index) => {
                claimed.swap_remove(index);
            }
            None => rest.push(entry.clone()),
        }
    }
    rest
}

/// Render the whole result tree as an XUnit document
pub fn render_xunit(result: &RunResult) -> String {
    let buckets = result.buckets();
    let mut suites = result.children();
    let rest = unclaimed(&buckets, &suites);
    if suites.is_empty() || !rest.is_empty() {
        suites.push(ProxyRecord {
            name: ROOT_SUITE.to_string(),
            runtime: rest.runtime(),
            started_at: Utc::now(),
            buckets: rest,
            children: Vec::new(),
        });
    }

    let mut out = String::new();
    writeln!(out, r#"<?xml version="1.0" encoding="UTF-8"?>"#).unwrap_or_default();
    writeln!(
        out,
        r#"<testsuites tests="{}" failures="{}" errors="{}" skipped="{}" time="{:.3}">"#,
        buckets.tests(),
        buckets.failures.len(),
        buckets.errors.len(),
        buckets.skipped.len(),
        suites.iter().map(|s| s.runtime).sum::<f64>()
    )
    .unwrap_or_default();

    for suite in &suites {
        write_suite(&mut out, suite);
    }

    writeln!(out, "</testsuites>").unwrap_or_default();
    out
}

/// Render and write the report as UTF-8
pub fn write_xunit(result: &RunResult, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(path, render_xunit(result))
        .with_context(|| format!("Failed to write XUnit report: {}", path.display()))?;
    info!("XUnit report written to {}", path.display());
    Ok(())
}

fn write_suite(out: &mut String, suite: &ProxyRecord) {
    let buckets: &Buckets = &suite.buckets;
    writeln!(
        out,
        r#"  <testsuite name="{}" tests="{}" failures="{}" errors="{}" skipped="{}" time="{:.3}" timestamp="{}">"#,
        xml_escape(&suite.name),
        buckets.tests(),
        buckets.failures.len(),
        buckets.errors.len(),
        buckets.skipped.len(),
        suite.runtime,
        suite.started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
    .unwrap_or_default();

    for entry in buckets.iter() {
        write_case(out, entry);
    }

    writeln!(out, "  </testsuite>").unwrap_or_default();
}

fn write_case(out: &mut String, entry: &Entry) {
    let data = &entry.data;
    let open = format!(
        r#"    <testcase name="{}" classname="{}" time="{:.3}""#,
        xml_escape(data.method_name()),
        xml_escape(data.class_name()),
        data.runtime()
    );

    match data.status() {
        Status::Success => {
            writeln!(out, "{open}/>").unwrap_or_default();
        }
        Status::Skip => {
            writeln!(out, "{open}>").unwrap_or_default();
            writeln!(
                out,
                r#"      <skipped message="{}"/>"#,
                xml_escape(data.skip_reason().unwrap_or_default())
            )
            .unwrap_or_default();
            writeln!(out, "    </testcase>").unwrap_or_default();
        }
        Status::Fail | Status::Error => {
            let tag = if data.status() == Status::Fail {
                "failure"
            } else {
                "error"
            };
            writeln!(out, "{open}>").unwrap_or_default();
            writeln!(
                out,
                r#"      <{tag} type="{}" message="{}"><![CDATA[{}]]></{tag}>"#,
                xml_escape(data.kind().unwrap_or_default()),
                xml_escape(data.message().unwrap_or_default()),
                xml_escape(data.reason().unwrap_or_default())
            )
            .unwrap_or_default();
            writeln!(out, "    </testcase>").unwrap_or_default();
        }
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
