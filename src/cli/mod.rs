//! CLI argument parsing
//!
//! Defines command-line interface using clap and folds the parsed flags
//! into a [`RunConfig`] on top of the config file and environment layers.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};

use crate::config::{ConfigFile, EnvConfig, RunConfig};
use crate::executor::GroupKind;

/// Test suite orchestration engine
#[derive(Parser, Debug, Default)]
#[command(name = "testrig")]
#[command(version)]
#[command(about = "Run test suites sequentially, on threads, cooperatively or in worker processes")]
#[command(long_about = None)]
pub struct Args {
    /// Test selector `suite[:case[.test]]` (repeatable)
    #[arg(short = 't', long = "test", value_name = "SELECTOR")]
    pub tests: Vec<String>,

    /// Stop after the first failure or error
    #[arg(short = 'x', long = "stop")]
    pub stop: bool,

    /// Repeat count for repeatable cases
    #[arg(short = 'r', long)]
    pub repeat: Option<u32>,

    /// Shuffle suite order
    #[arg(long)]
    pub random: bool,

    /// Shuffle suite order with this seed
    #[arg(long, value_name = "SEED")]
    pub random_seed: Option<u64>,

    /// Run pools on OS threads
    #[arg(long, conflicts_with_all = ["cooperative", "multiprocessing"])]
    pub threading: bool,

    /// Run pools as cooperative tasks
    #[arg(long, alias = "gevent", conflicts_with = "multiprocessing")]
    pub cooperative: bool,

    /// Run pools in worker processes
    #[arg(long)]
    pub multiprocessing: bool,

    /// Suite-level pool size (<= 0: core count)
    #[arg(long, value_name = "N", allow_negative_numbers = true)]
    pub async_suites: Option<i64>,

    /// Case-level pool size (<= 0: core count)
    #[arg(long, value_name = "N", allow_negative_numbers = true)]
    pub async_tests: Option<i64>,

    /// Worker release timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub mp_timeout: Option<u64>,

    /// Write an XUnit report to this path
    #[arg(long, value_name = "PATH")]
    pub xunit_report: Option<PathBuf>,

    /// Run tests even when marked skipped
    #[arg(long)]
    pub no_skip: bool,

    /// Do not run before/after scripts
    #[arg(long)]
    pub no_scripts: bool,

    /// Schedule every flow of a case as its own test
    #[arg(long)]
    pub split_flows: bool,

    /// Configuration file (YAML or JSON)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Write the resolved configuration to this file and exit
    #[arg(long, value_name = "FILE")]
    pub save_config: Option<PathBuf>,

    /// Overwrite an existing file with --save-config
    #[arg(long, requires = "save_config")]
    pub force: bool,

    /// Search this directory for `*.testrig.yaml` manifests
    #[arg(long, value_name = "DIR")]
    pub discover: Option<PathBuf>,

    /// List the selected tests and exit
    #[arg(long)]
    pub list: bool,

    /// Disable colored markers
    #[arg(long)]
    pub no_color: bool,

    /// Return instead of exiting the process when the run completes
    #[arg(long)]
    pub no_exit: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Print the supported environment variables and exit
    #[arg(long)]
    pub env_help: bool,
}

impl Args {
    /// Group requested on the command line, if any
    pub fn group(&self) -> Option<GroupKind> {
        if self.multiprocessing {
            Some(GroupKind::Multiprocessing)
        } else if self.cooperative {
            Some(GroupKind::Cooperative)
        } else if self.threading {
            Some(GroupKind::Threading)
        } else {
            None
        }
    }

    /// Defaults, then the config file, then `TESTRIG_*` variables, then these flags
    pub fn resolve(&self, env: &EnvConfig) -> Result<RunConfig> {
        let path = self
            .config
            .clone()
            .or_else(|| env.config_file.as_ref().map(PathBuf::from));
        let file = match path {
            Some(path) => ConfigFile::load(&path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
            None => ConfigFile::load_default()?,
        };

        let mut config = file.run;
        config.apply_env(env);
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Save `config` so that `--config` loads it back
    pub fn save_config(&self, path: &Path, config: &RunConfig) -> Result<()> {
        if path.exists() && !self.force {
            anyhow::bail!("Configuration file already exists: {}. Use --force to overwrite.", path.display());
        }
        let file = ConfigFile {
            run: config.clone(),
            ..Default::default()
        };
        file.save(path)
    }

    /// Apply the flags that were given on top of `config`
    pub fn apply(&self, config: &mut RunConfig) {
        if !self.tests.is_empty() {
            config.tests = self.tests.clone();
        }
        if self.stop {
            config.stop_on_failure = true;
        }
        if let Some(repeat) = self.repeat {
            config.repeat = repeat;
        }
        if self.random {
            config.random = true;
        }
        if let Some(seed) = self.random_seed {
            config.random = true;
            config.random_seed = Some(seed);
        }
        if let Some(group) = self.group() {
            config.group = group;
        }
        if self.async_suites.is_some() {
            config.async_suites = self.async_suites;
        }
        if self.async_tests.is_some() {
            config.async_tests = self.async_tests;
        }
        if let Some(timeout) = self.mp_timeout {
            config.mp_timeout_secs = timeout;
        }
        if let Some(report) = &self.xunit_report {
            config.xunit_report = Some(report.clone());
        }
        if self.no_skip {
            config.no_skip = true;
        }
        if self.no_scripts {
            config.no_scripts = true;
        }
        if self.split_flows {
            config.split_flows = true;
        }
        if let Some(dir) = &self.discover {
            config.discover_dir = Some(dir.clone());
        }
        if self.no_color {
            config.color = false;
        }
        if self.no_exit {
            config.exit_on_completion = false;
        }
    }
}
