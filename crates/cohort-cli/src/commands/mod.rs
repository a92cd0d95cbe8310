//! Subcommand implementations

pub mod config;
pub mod simulate;

use anyhow::{Context, Result};
use cohort_core::CohortConfig;
use std::path::Path;

/// Load the configuration file; a missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<CohortConfig> {
    CohortConfig::load(path).with_context(|| format!("loading {}", path.display()))
}
