//! Environment variable configuration
//!
//! Provides `TESTRIG_*` overrides for the run configuration.

use std::env;

use crate::executor::GroupKind;

/// Environment variable prefix
const ENV_PREFIX: &str = "TESTRIG";

/// Overrides read from environment variables
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvConfig {
    /// TESTRIG_STOP
    pub stop: Option<bool>,
    /// TESTRIG_REPEAT
    pub repeat: Option<u32>,
    /// TESTRIG_RANDOM_SEED
    pub random_seed: Option<u64>,
    /// TESTRIG_GROUP
    pub group: Option<GroupKind>,
    /// TESTRIG_ASYNC_SUITES
    pub async_suites: Option<i64>,
    /// TESTRIG_ASYNC_TESTS
    pub async_tests: Option<i64>,
    /// TESTRIG_MP_TIMEOUT
    pub mp_timeout: Option<u64>,
    /// TESTRIG_XUNIT_REPORT
    pub xunit_report: Option<String>,
    /// TESTRIG_CONFIG
    pub config_file: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            stop: get_env_bool("STOP"),
            repeat: get_env_parse("REPEAT"),
            random_seed: get_env_parse("RANDOM_SEED"),
            group: get_env("GROUP").and_then(|v| GroupKind::parse(&v)),
            async_suites: get_env_parse("ASYNC_SUITES"),
            async_tests: get_env_parse("ASYNC_TESTS"),
            mp_timeout: get_env_parse("MP_TIMEOUT"),
            xunit_report: get_env("XUNIT_REPORT"),
            config_file: get_env("CONFIG"),
        }
    }

    /// Check if any environment variables are set
    pub fn has_any(&self) -> bool {
        *self != Self::default()
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}"))
        .ok()
        .filter(|v| !v.is_empty())
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.trim().parse().ok())
}

/// Get environment variable as boolean
fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

/// Builder for setting environment variables (useful for testing)
#[derive(Default)]
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `TESTRIG_<name>`
    pub fn var(mut self, name: &str, value: impl ToString) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_{name}"), value.to_string()));
        self
    }

    /// Apply and return guard that restores on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        for (key, value) in self.vars {
            env::set_var(key, value);
        }

        EnvGuard { previous }
    }
}

/// Guard that restores environment variables on drop
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}

/// Print all TESTRIG environment variables
pub fn print_env_help() {
    println!("Environment Variables:");
    println!();
    println!("  {ENV_PREFIX}_STOP          Stop after the first failure (true/false)");
    println!("  {ENV_PREFIX}_REPEAT        Repeat count for repeatable cases");
    println!("  {ENV_PREFIX}_RANDOM_SEED   Shuffle suites with this seed");
    println!("  {ENV_PREFIX}_GROUP         threading, cooperative or multiprocessing");
    println!("  {ENV_PREFIX}_ASYNC_SUITES  Suite-level pool size (<= 0: core count)");
    println!("  {ENV_PREFIX}_ASYNC_TESTS   Case-level pool size (<= 0: core count)");
    println!("  {ENV_PREFIX}_MP_TIMEOUT    Worker release timeout in seconds");
    println!("  {ENV_PREFIX}_XUNIT_REPORT  Path of the XUnit report");
    println!("  {ENV_PREFIX}_CONFIG        Path to configuration file");
}

#[cfg(test)]
mod tests {
    use super::*;

    // Every variable set here is unique to its test so parallel tests do not race.

    #[test]
    fn test_env_config_default() {
        let config = EnvConfig::default();
        assert!(config.repeat.is_none());
        assert!(!config.has_any());
    }

    #[test]
    fn test_env_builder() {
        let _guard = EnvBuilder::new()
            .var("ASYNC_TESTS", -1)
            .var("GROUP", "gevent")
            .var("MP_TIMEOUT", 12)
            .apply_scoped();

        let config = EnvConfig::load();
        assert_eq!(config.async_tests, Some(-1));
        assert_eq!(config.group, Some(GroupKind::Cooperative));
        assert_eq!(config.mp_timeout, Some(12));
        assert!(config.has_any());
    }

    #[test]
    fn test_env_bool_parsing() {
        let _guard = EnvBuilder::new().var("STOP", "yes").apply_scoped();
        assert_eq!(EnvConfig::load().stop, Some(true));
    }
}
