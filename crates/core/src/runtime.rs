//! Container engine selection
//!
//! Stages are run through the CLI of an external container engine. Docker and Podman accept
//! the same subcommands for everything the driver issues, so selecting one only changes the
//! binary name.

use crate::errors::InfinityError;

/// Supported container engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeKind {
    #[default]
    Docker,
    Podman,
}

impl RuntimeKind {
    /// Binary name of the engine CLI
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }

    /// Resolve the engine to use
    ///
    /// Precedence: CLI flag > INFINITY_RUNTIME env var > default (docker)
    pub fn detect(cli_runtime: Option<RuntimeKind>) -> RuntimeKind {
        if let Some(runtime) = cli_runtime {
            return runtime;
        }

        if let Ok(env_runtime) = std::env::var("INFINITY_RUNTIME") {
            match env_runtime.parse() {
                Ok(runtime) => return runtime,
                Err(err) => tracing::warn!("Ignoring INFINITY_RUNTIME: {}", err),
            }
        }

        RuntimeKind::Docker
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = InfinityError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "podman" => Ok(Self::Podman),
            _ => Err(InfinityError::Config(format!(
                "Unknown runtime: {}. Supported runtimes: docker, podman",
                s
            ))),
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
