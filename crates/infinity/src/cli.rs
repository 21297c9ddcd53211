use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use infinity_core::config::{RunnerConfig, DEFAULT_MANIFEST_FILENAME, DEFAULT_STOP_TIMEOUT_SECS};
use infinity_core::runtime::RuntimeKind;
use std::path::PathBuf;

/// Default target of `infinity run`
pub const DEFAULT_TARGET: &str = "build/local";

/// Runtime selection options
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum RuntimeOption {
    /// Docker runtime
    Docker,
    /// Podman runtime
    Podman,
}

impl From<RuntimeOption> for RuntimeKind {
    fn from(runtime: RuntimeOption) -> Self {
        match runtime {
            RuntimeOption::Docker => RuntimeKind::Docker,
            RuntimeOption::Podman => RuntimeKind::Podman,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Log level options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    /// Error messages only
    Error,
    /// Warning and error messages
    Warn,
    /// Informational messages and above
    Info,
    /// Debug messages and above
    Debug,
    /// All messages including trace
    Trace,
}

/// Infinity subcommands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a target to build or release your application using the manifest
    Run {
        /// Target to run
        #[arg(default_value = DEFAULT_TARGET)]
        target: String,

        /// Force pulling images
        #[arg(short = 'p', long)]
        pull: bool,

        /// Maximum number of stages of a parallel group running at once (INFINITY_MAX_PARALLEL)
        #[arg(long)]
        max_parallel: Option<usize>,
    },

    /// Validate the manifest
    Validate,

    /// Print the version number of infinity
    Version,
}

/// Infinity is a CLI to easily build your applications using a pipeline as code
#[derive(Debug, Parser)]
#[command(name = "infinity")]
#[command(about = "Infinity is a CLI to easily build your applications using a pipeline as code")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Directory path containing manifest file
    #[arg(short = 'd', long, global = true)]
    pub directory: Option<PathBuf>,

    /// Manifest file name
    #[arg(short = 'm', long, global = true, default_value = DEFAULT_MANIFEST_FILENAME)]
    pub manifest: String,

    /// Log format
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Log level
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Container runtime to use (INFINITY_RUNTIME)
    #[arg(long, global = true, value_enum)]
    pub runtime: Option<RuntimeOption>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Build the runner configuration from global and command options
    pub fn config(&self, force_pull: bool, max_parallel: Option<usize>) -> RunnerConfig {
        RunnerConfig {
            build_directory: self
                .directory
                .clone()
                .unwrap_or_else(|| PathBuf::from(".")),
            manifest_filename: self.manifest.clone(),
            force_pull,
            verbose: self.verbose,
            runtime: RuntimeKind::detect(self.runtime.map(Into::into)),
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            max_parallel: max_parallel
                .filter(|n| *n > 0)
                .or_else(RunnerConfig::max_parallel_from_env),
        }
    }

    pub async fn dispatch(self) -> Result<()> {
        let log_format = match self.log_format {
            Some(LogFormat::Text) => Some("text"),
            Some(LogFormat::Json) => Some("json"),
            None => None, // Let logging module check environment variable
        };

        let log_level = match self.log_level {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };

        let default_directives = format!("infinity={},infinity_core={}", log_level, log_level);
        infinity_core::logging::init(log_format, &default_directives)?;

        tracing::debug!("CLI initialized with log level: {}", log_level);

        match &self.command {
            Commands::Run {
                target,
                pull,
                max_parallel,
            } => {
                let config = self.config(*pull, *max_parallel);
                crate::commands::run::execute_run(config, target).await
            }
            Commands::Validate => {
                let config = self.config(false, None);
                crate::commands::validate::execute_validate(config)
            }
            Commands::Version => {
                crate::commands::version::execute_version();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_defaults() {
        let cli = Cli::parse_from(["infinity", "run"]);

        match &cli.command {
            Commands::Run {
                target,
                pull,
                max_parallel,
            } => {
                assert_eq!(target, "build/local");
                assert!(!pull);
                assert!(max_parallel.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.manifest, ".infinity.yaml");
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "infinity",
            "run",
            "release",
            "-p",
            "-v",
            "-d",
            "/src",
            "--runtime",
            "podman",
            "--max-parallel",
            "2",
        ]);

        let config = cli.config(true, Some(2));
        assert_eq!(config.build_directory, PathBuf::from("/src"));
        assert_eq!(config.runtime, RuntimeKind::Podman);
        assert_eq!(config.max_parallel, Some(2));
        assert!(config.verbose);
        assert!(config.force_pull);
    }
}
