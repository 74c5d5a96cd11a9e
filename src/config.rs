//! Target configuration: which hooked entry points are of interest and
//! which call instances within them are targeted
//!
//! The configuration is produced by the wizard stage of the pipeline and
//! consumed read-only here. A call instance is targeted either by its call
//! index (the n-th invocation of the entry point) or by the hash of its
//! argument identity; an entry with neither filter targets every call.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::path::Path;

/// Errors while loading the target configuration
#[derive(Error, Debug)]
pub enum Error {
    /// The configuration file could not be read
    #[error("Failed to read target configuration {0}")]
    Unreadable(String),

    /// The configuration file is not valid JSON for [`TargetConfig`]
    #[error("Failed to parse target configuration: {0}")]
    Invalid(#[from] serde_json::Error),

    /// The configuration selects no entry point at all
    #[error("Target configuration selects no entry point")]
    NothingSelected,
}

/// One entry point the wizard recorded for this target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetFunction {
    /// Unified entry point name (`ReadFile`, `fread`, `RegQueryValueEx`, ...)
    pub function: String,

    /// Whether the user selected this entry point for the run
    #[serde(default)]
    pub selected: bool,

    /// Call indices within this entry point that are targeted. Empty means
    /// no index filter.
    #[serde(default)]
    pub call_indices: Vec<u64>,

    /// Argument-identity hashes that are targeted. Empty means no hash
    /// filter.
    #[serde(default)]
    pub arg_hashes: Vec<String>,
}

impl TargetFunction {
    /// Whether a call instance with the given index and argument hash is
    /// targeted by this entry
    fn matches(&self, call_index: u64, arg_hash: Option<&str>) -> bool {
        if self.call_indices.is_empty() && self.arg_hashes.is_empty() {
            return true;
        }

        if self.call_indices.contains(&call_index) {
            return true;
        }

        match arg_hash {
            Some(hash) => self.arg_hashes.iter().any(|h| h == hash),
            None => false,
        }
    }
}

/// The parsed target configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Entry points the wizard recorded, selected or not
    #[serde(default)]
    pub functions: Vec<TargetFunction>,
}

impl TargetConfig {
    /// Load and validate the configuration from `path`
    ///
    /// # Errors
    ///
    /// * The file cannot be read or parsed
    /// * No entry point is selected
    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = std::fs::read_to_string(path)
            .map_err(|_| Error::Unreadable(path.display().to_string()))?;

        let config: TargetConfig = serde_json::from_str(&data)?;

        if !config.functions.iter().any(|f| f.selected) {
            return Err(Error::NothingSelected);
        }

        Ok(config)
    }

    /// Whether any selected entry uses the given unified entry point name.
    /// Used to decide which hooks to install at module load.
    #[must_use]
    pub fn selects_function(&self, function: &str) -> bool {
        self.functions
            .iter()
            .any(|f| f.selected && f.function == function)
    }

    /// Whether the call instance is targeted: some selected entry for
    /// `function` matches the call index or the argument-identity hash
    #[must_use]
    pub fn is_targeted(&self, function: &str, call_index: u64, arg_hash: Option<&str>) -> bool {
        self.functions
            .iter()
            .filter(|f| f.selected && f.function == function)
            .any(|f| f.matches(call_index, arg_hash))
    }
}
