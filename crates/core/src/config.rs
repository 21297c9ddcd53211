//! Runner configuration
//!
//! Settings for one invocation, assembled by the command line from flags and environment.

use crate::runtime::RuntimeKind;
use std::path::PathBuf;
use tracing::warn;

/// Default manifest file name, looked up in the build directory
pub const DEFAULT_MANIFEST_FILENAME: &str = ".infinity.yaml";

/// Seconds the engine waits for a container to stop before killing it
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Directory stages run in and mount into containers
    pub build_directory: PathBuf,
    /// Manifest file name relative to the build directory
    pub manifest_filename: String,
    /// Pull images even when they are present locally
    pub force_pull: bool,
    /// Echo every engine and host command before running it
    pub verbose: bool,
    pub runtime: RuntimeKind,
    pub stop_timeout_secs: u64,
    /// Upper bound on concurrently running stages of one parallel group
    pub max_parallel: Option<usize>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            build_directory: PathBuf::from("."),
            manifest_filename: DEFAULT_MANIFEST_FILENAME.to_string(),
            force_pull: false,
            verbose: false,
            runtime: RuntimeKind::Docker,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            max_parallel: None,
        }
    }
}

impl RunnerConfig {
    /// Full path of the manifest
    pub fn manifest_path(&self) -> PathBuf {
        self.build_directory.join(&self.manifest_filename)
    }

    /// Parallelism bound from INFINITY_MAX_PARALLEL, ignoring unusable values
    pub fn max_parallel_from_env() -> Option<usize> {
        let raw = std::env::var("INFINITY_MAX_PARALLEL").ok()?;
        parse_max_parallel(&raw)
    }
}

fn parse_max_parallel(raw: &str) -> Option<usize> {
    match raw.trim().parse::<usize>() {
        Ok(0) => None,
        Ok(n) => Some(n),
        Err(_) => {
            warn!(
                "Invalid INFINITY_MAX_PARALLEL value '{}', running groups unbounded",
                raw
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();

        assert_eq!(config.manifest_path(), PathBuf::from("./.infinity.yaml"));
        assert_eq!(config.stop_timeout_secs, 30);
        assert_eq!(config.runtime, RuntimeKind::Docker);
        assert!(config.max_parallel.is_none());
    }

    #[test]
    fn test_parse_max_parallel() {
        assert_eq!(parse_max_parallel("4"), Some(4));
        assert_eq!(parse_max_parallel(" 2 "), Some(2));
        assert_eq!(parse_max_parallel("0"), None);
        assert_eq!(parse_max_parallel("many"), None);
    }
}
