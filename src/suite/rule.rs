//! Build rules
//!
//! A rule narrows what a suite materializes: `suite`, `suite:Case` or
//! `suite:Case.test_name`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("Empty test selector")]
    Empty,
    #[error("Invalid test selector '{0}': expected suite[:case[.test]]")]
    Malformed(String),
}

/// `(suite, case?, test?)` selector
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildRule {
    pub suite: String,
    pub case: Option<String>,
    pub test: Option<String>,
}

impl BuildRule {
    pub fn suite(name: impl Into<String>) -> Self {
        Self {
            suite: name.into(),
            case: None,
            test: None,
        }
    }

    pub fn case(mut self, name: impl Into<String>) -> Self {
        self.case = Some(name.into());
        self
    }

    pub fn test(mut self, name: impl Into<String>) -> Self {
        self.test = Some(name.into());
        self
    }

    pub fn applies_to(&self, suite: &str) -> bool {
        self.suite == suite
    }

    /// Whether the rule keeps `test` of class `case`
    pub fn selects(&self, case: &str, test: &str) -> bool {
        self.case.as_deref().map_or(true, |c| c == case) && self.test.as_deref().map_or(true, |t| t == test)
    }
}

impl FromStr for BuildRule {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RuleError::Empty);
        }
        let malformed = || RuleError::Malformed(s.to_string());
        let (suite, rest) = match s.split_once(':') {
            Some((suite, rest)) => (suite, Some(rest)),
            None => (s, None),
        };
        if suite.is_empty() {
            return Err(malformed());
        }
        let mut rule = BuildRule::suite(suite);
        if let Some(rest) = rest {
            let (case, test) = match rest.split_once('.') {
                Some((case, test)) => (case, Some(test)),
                None => (rest, None),
            };
            if case.is_empty() || test.is_some_and(|t| t.is_empty() || t.contains(['.', ':'])) {
                return Err(malformed());
            }
            rule.case = Some(case.to_string());
            rule.test = test.map(str::to_string);
        }
        Ok(rule)
    }
}

impl fmt::Display for BuildRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.suite)?;
        if let Some(case) = &self.case {
            write!(f, ":{case}")?;
            if let Some(test) = &self.test {
                write!(f, ".{test}")?;
            }
        }
        Ok(())
    }
}

/// Parse every selector, stopping at the first malformed one
pub fn parse_rules<I, S>(selectors: I) -> Result<Vec<BuildRule>, RuleError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    selectors.into_iter().map(|s| s.as_ref().parse()).collect()
}
