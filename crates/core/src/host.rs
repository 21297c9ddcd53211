//! Host lifecycle driver
//!
//! Runs a stage's commands directly on the host, one after the other, in the build directory.
//! Commands are split on whitespace into program and arguments; no shell is involved.

use crate::env;
use crate::errors::{InfinityError, Result, StageError};
use crate::manifest::ManifestStage;
use crate::output::StageLogger;
use crate::process::{Invocation, ProcessRunner};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[derive(Debug, Clone)]
pub struct HostRunner {
    process: Arc<dyn ProcessRunner>,
    build_directory: PathBuf,
}

impl HostRunner {
    pub fn new(process: Arc<dyn ProcessRunner>, build_directory: impl Into<PathBuf>) -> Self {
        Self {
            process,
            build_directory: build_directory.into(),
        }
    }

    /// Run every command of `stage`, stopping at the first failure
    #[instrument(skip_all, fields(stage = %stage.name))]
    pub async fn run_stage(
        &self,
        stage: &ManifestStage,
        env: &BTreeMap<String, String>,
        logger: &StageLogger,
        cancel: &CancellationToken,
    ) -> Result<()> {
        logger.info("Starting stage on host");

        let env = env::to_entries(env);

        for command in &stage.commands {
            let mut words = command.split_whitespace();
            let Some(program) = words.next() else {
                continue;
            };

            logger.info(&format!("> {}", command));

            let invocation = Invocation::new(program, words)
                .with_dir(&self.build_directory)
                .with_env(env.clone());

            self.process
                .run(&invocation, logger, cancel)
                .await
                .map_err(|source| {
                    if source.is_canceled() {
                        InfinityError::Canceled
                    } else {
                        StageError::Command {
                            stage: stage.name.clone(),
                            source,
                        }
                        .into()
                    }
                })?;
        }

        Ok(())
    }
}
