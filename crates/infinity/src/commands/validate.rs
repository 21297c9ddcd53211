//! Validate command implementation

use anyhow::Result;
use infinity_core::config::RunnerConfig;
use infinity_core::engine::Runner;

/// Read the manifest and report warnings and errors
pub fn execute_validate(config: RunnerConfig) -> Result<()> {
    Runner::new(config).validate()?;
    Ok(())
}
