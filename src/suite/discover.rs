//! Filesystem discovery
//!
//! Manifest files named `*.testrig.yaml` select suites from the program's
//! catalog. Each manifest lists selectors in the same syntax as `--test`:
//!
//! ```yaml
//! suites:
//!   - auth
//!   - billing:Invoice.test_total
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::rule::BuildRule;

/// File name suffix of discovery manifests
pub const MANIFEST_SUFFIX: &str = ".testrig.yaml";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub suites: Vec<String>,
}

impl Manifest {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse manifest {}", path.display()))
    }

    pub fn rules(&self) -> Result<Vec<BuildRule>> {
        self.suites
            .iter()
            .map(|s| s.parse::<BuildRule>().map_err(anyhow::Error::from))
            .collect()
    }
}

/// Every manifest under `dir`, sorted by path
pub fn find_manifests(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.as_ref().to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read directory {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(MANIFEST_SUFFIX))
            {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Build rules from every manifest under `dir`, duplicates removed
pub fn discover(dir: impl AsRef<Path>) -> Result<Vec<BuildRule>> {
    let mut rules: Vec<BuildRule> = Vec::new();
    for path in find_manifests(dir)? {
        debug!("Loading manifest {}", path.display());
        for rule in Manifest::load(&path)?.rules()? {
            if !rules.contains(&rule) {
                rules.push(rule);
            }
        }
    }
    Ok(rules)
}
