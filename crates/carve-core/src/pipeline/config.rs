use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Configuration for which simplification passes to run.
///
/// All passes are enabled by default. Disable individual passes by setting
/// their fields to `false`, or use `from_skip_list` with pass name strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PassConfig {
    pub branch_folding: bool,
    pub constant_folding: bool,
    pub copy_propagation: bool,
    pub dead_code_elimination: bool,
    pub nonzero_mask: bool,
    /// When enabled, the pipeline repeats all passes until none report changes.
    pub fixpoint: bool,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            branch_folding: true,
            constant_folding: true,
            copy_propagation: true,
            dead_code_elimination: true,
            nonzero_mask: true,
            fixpoint: true,
        }
    }
}

impl PassConfig {
    /// Create a config with all passes enabled except those in the skip list.
    ///
    /// Pass names correspond to `Transform::name()` values:
    /// - `"branch-folding"`
    /// - `"constant-folding"`
    /// - `"copy-propagation"`
    /// - `"dead-code-elimination"`
    /// - `"nonzero-mask"`
    /// - `"fixpoint"`: disables pipeline fixpoint iteration
    pub fn from_skip_list(skip: &[&str]) -> Self {
        let mut config = Self::default();
        for name in skip {
            match *name {
                "branch-folding" => config.branch_folding = false,
                "constant-folding" => config.constant_folding = false,
                "copy-propagation" => config.copy_propagation = false,
                "dead-code-elimination" => config.dead_code_elimination = false,
                "nonzero-mask" => config.nonzero_mask = false,
                "fixpoint" => config.fixpoint = false,
                other => tracing::debug!(pass = other, "ignoring unknown pass in skip list"),
            }
        }
        config
    }
}

/// Tunables for jump-table recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JumpTableConfig {
    pub enabled: bool,
    /// Ops inspected by the backward scan that rejects tables computed by
    /// opaque calls.
    pub early_fail_lookahead: usize,
    /// Largest number of entries read from a table.
    pub max_table_size: usize,
    /// Immediate dominators climbed while looking for a bounding guard.
    pub guard_depth: usize,
    /// Pass limit for the simplification pipeline run on the partial clone.
    pub max_simplify_passes: usize,
}

impl Default for JumpTableConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            early_fail_lookahead: 8,
            max_table_size: 1024,
            guard_depth: 4,
            max_simplify_passes: 16,
        }
    }
}

/// Top-level analysis settings, loadable from JSON. Missing fields take
/// their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub passes: PassConfig,
    pub jumptable: JumpTableConfig,
}

impl AnalysisConfig {
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| CoreError::Config {
            file: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_enables_all() {
        let config = PassConfig::default();
        assert!(config.branch_folding);
        assert!(config.constant_folding);
        assert!(config.copy_propagation);
        assert!(config.dead_code_elimination);
        assert!(config.nonzero_mask);
        assert!(config.fixpoint);
    }

    #[test]
    fn skip_list_disables_passes() {
        let config = PassConfig::from_skip_list(&["constant-folding", "fixpoint"]);
        assert!(config.branch_folding);
        assert!(!config.constant_folding);
        assert!(config.copy_propagation);
        assert!(!config.fixpoint);
    }

    #[test]
    fn skip_list_unknown_ignored() {
        let config = PassConfig::from_skip_list(&["nonexistent"]);
        assert!(config.constant_folding);
        assert!(config.dead_code_elimination);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            AnalysisConfig::from_json(r#"{"jumptable": {"early_fail_lookahead": 3}}"#).unwrap();
        assert_eq!(config.jumptable.early_fail_lookahead, 3);
        assert_eq!(config.jumptable.max_table_size, 1024);
        assert!(config.jumptable.enabled);
        assert!(config.passes.copy_propagation);
    }

    #[test]
    fn bad_json_is_an_error() {
        assert!(AnalysisConfig::from_json("{\"passes\": 3}").is_err());
    }
}
