//! Configuration module
//!
//! A [`RunConfig`] is assembled from defaults, a config file, `TESTRIG_*`
//! environment variables and the command line, in that order of precedence.

pub mod env;
pub mod file;

pub use env::EnvConfig;
pub use file::ConfigFile;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::case::CaseOptions;
use crate::executor::{GroupConfig, GroupKind};
use crate::suite::{parse_rules, BuildRule, RuleError, SuiteOptions};

/// Run configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Stop after the first failure or error
    pub stop_on_failure: bool,

    /// Repeat count for repeatable case classes
    pub repeat: u32,

    /// Shuffle suite order
    pub random: bool,

    /// Seed for the shuffle; a random one is drawn when absent
    pub random_seed: Option<u64>,

    /// Concurrency strategy for both levels
    pub group: GroupKind,

    /// Suite-level pool size; absent runs suites sequentially
    pub async_suites: Option<i64>,

    /// Case-level pool size; absent runs cases sequentially
    pub async_tests: Option<i64>,

    /// Release timeout for worker processes, in seconds
    pub mp_timeout_secs: u64,

    /// Where to write the XUnit report
    pub xunit_report: Option<PathBuf>,

    /// Run tests even when marked skipped
    pub no_skip: bool,

    /// Do not run before/after scripts
    pub no_scripts: bool,

    /// Schedule every flow of a case as its own unit
    pub split_flows: bool,

    /// Exit the process with the run status
    pub exit_on_completion: bool,

    /// Colorize console markers
    pub color: bool,

    /// Test selectors (`suite[:case[.test]]`)
    pub tests: Vec<String>,

    /// Directory searched for `*.testrig.yaml` manifests
    pub discover_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            stop_on_failure: false,
            repeat: 1,
            random: false,
            random_seed: None,
            group: GroupKind::default(),
            async_suites: None,
            async_tests: None,
            mp_timeout_secs: 30,
            xunit_report: None,
            no_skip: false,
            no_scripts: false,
            split_flows: false,
            exit_on_completion: true,
            color: true,
            tests: Vec::new(),
            discover_dir: None,
        }
    }
}

impl RunConfig {
    /// Load a bare run configuration from YAML or JSON
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = if file::is_yaml_file(path) {
            serde_yaml::from_str(&content).context("Failed to parse YAML config")?
        } else {
            serde_json::from_str(&content).context("Failed to parse JSON config")?
        };

        Ok(config)
    }

    /// Apply environment overrides on top of this configuration
    pub fn apply_env(&mut self, env: &EnvConfig) {
        if let Some(stop) = env.stop {
            self.stop_on_failure = stop;
        }
        if let Some(repeat) = env.repeat {
            self.repeat = repeat;
        }
        if let Some(seed) = env.random_seed {
            self.random = true;
            self.random_seed = Some(seed);
        }
        if let Some(group) = env.group {
            self.group = group;
        }
        if env.async_suites.is_some() {
            self.async_suites = env.async_suites;
        }
        if env.async_tests.is_some() {
            self.async_tests = env.async_tests;
        }
        if let Some(timeout) = env.mp_timeout {
            self.mp_timeout_secs = timeout;
        }
        if let Some(report) = &env.xunit_report {
            self.xunit_report = Some(PathBuf::from(report));
        }
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_secs(self.mp_timeout_secs)
    }

    /// Group running the program's suites
    pub fn suite_group(&self) -> GroupConfig {
        GroupConfig::new(self.group, self.async_suites).with_release_timeout(self.release_timeout())
    }

    /// Group running each suite's cases
    pub fn case_group(&self) -> GroupConfig {
        GroupConfig::new(self.group, self.async_tests).with_release_timeout(self.release_timeout())
    }

    pub fn suite_options(&self) -> SuiteOptions {
        SuiteOptions {
            case: CaseOptions {
                no_skip: self.no_skip,
                repeat: self.repeat.max(1),
            },
            split_flows: self.split_flows,
        }
    }

    pub fn rules(&self) -> std::result::Result<Vec<BuildRule>, RuleError> {
        parse_rules(&self.tests)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.repeat == 0 {
            anyhow::bail!("Repeat count must be at least 1");
        }
        if self.mp_timeout_secs == 0 {
            anyhow::bail!("Process release timeout must be at least one second");
        }
        self.rules().context("Invalid test selector")?;
        Ok(())
    }
}
