//! Core library for the infinity stage orchestrator
//!
//! This crate contains the manifest model, the stage execution engine and the container and
//! host drivers it dispatches to, together with logging, stage output and error handling.

pub mod config;
pub mod docker;
pub mod engine;
pub mod env;
pub mod errors;
pub mod host;
pub mod keyed_mutex;
pub mod logging;
pub mod manifest;
pub mod output;
pub mod process;
pub mod runtime;
pub mod store;
pub mod task_group;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
