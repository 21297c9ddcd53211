//! Error types and handling
//!
//! The error taxonomy is split per domain (manifest, process, container, stage) and
//! wrapped in the main [`InfinityError`] enum for unified handling. Cancellation is a
//! dedicated variant so callers can tell a cooperative shutdown apart from a real failure.

use thiserror::Error;

/// Manifest loading and validation errors
#[derive(Error, Debug)]
pub enum ManifestError {
    /// Manifest file does not exist
    #[error("manifest {path} does not exist, cannot continue")]
    NotFound { path: String },

    /// Manifest file could not be read
    #[error("failed to read manifest {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Manifest content is not valid YAML for the manifest schema
    #[error("manifest {path} is invalid: {message}")]
    Parsing { path: String, message: String },

    /// Manifest parsed but failed validation
    #[error("manifest failed validation")]
    Validation { errors: Vec<String> },

    /// Requested target is missing from the manifest
    #[error("target {target} is not defined in manifest")]
    UnknownTarget { target: String },
}

/// Errors raised by the process runner
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The program could not be started
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Reading output or waiting for the process failed
    #[error("failed to read output of {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program exited unsuccessfully
    #[error("{program} exited with {status}{detail}")]
    Exit {
        program: String,
        code: Option<i32>,
        status: String,
        detail: String,
    },

    /// The process was terminated because its cancellation token fired
    #[error("process {program} was canceled")]
    Canceled { program: String },
}

impl ProcessError {
    /// Whether this error is a cancellation rather than a failure
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }
}

/// Container engine errors
#[derive(Error, Debug)]
pub enum ContainerError {
    /// Checking for a local image failed
    #[error("checking image {image} for stage {stage} failed: {source}")]
    ImageCheck {
        image: String,
        stage: String,
        #[source]
        source: ProcessError,
    },

    /// Pulling an image failed
    #[error("pulling image {image} for stage {stage} failed: {source}")]
    Pull {
        image: String,
        stage: String,
        #[source]
        source: ProcessError,
    },

    /// Starting the stage container failed
    #[error("starting container for stage {stage} failed: {source}")]
    Start {
        stage: String,
        #[source]
        source: ProcessError,
    },

    /// The engine returned no container id for a started container
    #[error("starting container for stage {stage} returned no container id")]
    MissingContainerId { stage: String },

    /// Resolving the directory mounted into the container failed
    #[error("resolving working directory for stage {stage} failed: {source}")]
    WorkingDirectory {
        stage: String,
        #[source]
        source: std::io::Error,
    },

    /// Following container logs failed
    #[error("stage {stage} failed: {source}")]
    Logs {
        stage: String,
        #[source]
        source: ProcessError,
    },

    /// Inspecting the container state failed
    #[error("inspecting container {container_id} failed: {source}")]
    Inspect {
        container_id: String,
        #[source]
        source: ProcessError,
    },

    /// The exit code reported by the engine is not an integer
    #[error("container {container_id} reported an invalid exit code {output:?}")]
    ExitCodeParse {
        container_id: String,
        output: String,
    },

    /// Stopping a container failed
    #[error("stopping container {container_id} failed: {source}")]
    Stop {
        container_id: String,
        #[source]
        source: ProcessError,
    },

    /// Killing a container failed
    #[error("killing container {container_id} failed: {source}")]
    Kill {
        container_id: String,
        #[source]
        source: ProcessError,
    },

    /// Removing a container failed
    #[error("removing container {container_id} failed: {source}")]
    Remove {
        container_id: String,
        #[source]
        source: ProcessError,
    },

    /// Creating the run network failed
    #[error("creating network {network} failed: {source}")]
    NetworkCreate {
        network: String,
        #[source]
        source: ProcessError,
    },

    /// Removing the run network failed
    #[error("removing network {network} failed: {source}")]
    NetworkRemove {
        network: String,
        #[source]
        source: ProcessError,
    },
}

/// Stage execution errors
#[derive(Error, Debug)]
pub enum StageError {
    /// A stage finished with a non-zero exit code
    #[error("stage {stage} failed with exit code {code}")]
    ExitCode { stage: String, code: i32 },

    /// A host command of the stage failed
    #[error("stage {stage} failed: {source}")]
    Command {
        stage: String,
        #[source]
        source: ProcessError,
    },

    /// The stage names a runner this build does not support
    #[error("runner {runner} is not supported")]
    UnsupportedRunner { runner: String },

    /// A container stage without an image
    #[error("stage {stage} has no image")]
    MissingImage { stage: String },
}

/// Main error enum wrapping all domain-specific errors
#[derive(Error, Debug)]
pub enum InfinityError {
    /// Manifest-related errors
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Container engine errors
    #[error(transparent)]
    Container(#[from] ContainerError),

    /// Stage execution errors
    #[error(transparent)]
    Stage(#[from] StageError),

    /// Configuration errors (unknown runtime, invalid settings)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operation was canceled before it could finish
    #[error("This operation got canceled")]
    Canceled,

    /// Internal/generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl InfinityError {
    /// Whether this error is the cancellation sentinel
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// Convenience type alias for Results with InfinityError
pub type Result<T> = std::result::Result<T, InfinityError>;
