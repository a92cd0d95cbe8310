//! `cohort config`

use anyhow::Result;
use clap::Args;
use cohort_core::CohortConfig;

/// Print the configuration after defaults are applied.
#[derive(Args)]
pub struct ConfigCommand {
    /// Print JSON instead of TOML
    #[arg(long)]
    pub json: bool,
}

/// Handle config command execution
pub fn handle_config_command(cmd: &ConfigCommand, config: &CohortConfig) -> Result<()> {
    println!("{}", render(cmd, config)?);
    Ok(())
}

fn render(cmd: &ConfigCommand, config: &CohortConfig) -> Result<String> {
    if cmd.json {
        Ok(serde_json::to_string_pretty(config)?)
    } else {
        Ok(config.to_toml_string()?)
    }
}
