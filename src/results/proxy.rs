//! Scoped result proxy
//!
//! The guard merges on drop, so the merge happens on every exit path:
//! normal return, `?` propagation and unwinding alike.

use chrono::Utc;
use std::ops::Deref;

use super::{ProxyRecord, RunResult};
use crate::utils::timer::Timer;

/// Scoped sub-collector; derefs to the proxy [`RunResult`]
pub struct ProxyGuard<'a> {
    parent: &'a RunResult,
    proxy: Option<RunResult>,
    timer: Option<Timer>,
    started_at: chrono::DateTime<Utc>,
}

impl<'a> ProxyGuard<'a> {
    pub(super) fn new(parent: &'a RunResult, proxy: RunResult) -> Self {
        let label = proxy.name().unwrap_or("proxy").to_string();
        Self {
            parent,
            proxy: Some(proxy),
            timer: Some(Timer::start(label)),
            started_at: Utc::now(),
        }
    }

    fn finish(&mut self) {
        let Some(proxy) = self.proxy.take() else {
            return;
        };
        let runtime = self
            .timer
            .take()
            .map(|timer| timer.stop().as_secs_f64())
            .unwrap_or_default();

        let buckets = proxy.buckets();
        let record = ProxyRecord {
            name: proxy.name().unwrap_or_default().to_string(),
            runtime,
            started_at: self.started_at,
            buckets: buckets.clone(),
            children: proxy.children(),
        };

        self.parent.merge(buckets, Vec::new());
        self.parent.push_child(record);

        let output = proxy.take_output();
        if !output.is_empty() {
            self.parent.emit(&output);
        }
    }
}

impl Deref for ProxyGuard<'_> {
    type Target = RunResult;

    fn deref(&self) -> &RunResult {
        // Only `finish` takes the proxy, and it runs from `drop`.
        self.proxy
            .as_ref()
            .expect("proxy accessed after its scope ended")
    }
}

impl Drop for ProxyGuard<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}
