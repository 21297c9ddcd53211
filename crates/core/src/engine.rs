//! Stage execution engine
//!
//! Walks a target's stage tree: top-level stages run one after the other, the children of a
//! group run concurrently in a [`TaskGroup`]. Leaves are dispatched to the container or host
//! driver. A run network brackets the walk whenever a background stage exists, and teardown
//! (stopping tracked containers, removing the network) always follows a started walk.
//!
//! Cancellation is cooperative and travels through [`CancellationToken`]s; at the outermost
//! boundary a canceled run is not an error.

use crate::config::RunnerConfig;
use crate::docker::{self, DockerRunner};
use crate::errors::{InfinityError, ManifestError, Result, StageError};
use crate::host::HostRunner;
use crate::manifest::{read_manifest, Manifest, ManifestStage, RunnerType};
use crate::output::{stage_color, LogSink, Marker, StageLogger};
use crate::process::{CommandRunner, ProcessRunner};
use crate::task_group::TaskGroup;
use futures::future::{BoxFuture, FutureExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

type Env = Arc<BTreeMap<String, String>>;

fn marker_for(result: &Result<()>) -> Marker {
    match result {
        Ok(()) => Marker::Completed,
        Err(err) if err.is_canceled() => Marker::Canceled,
        Err(_) => Marker::Failed,
    }
}

/// Runs manifest targets
///
/// Cheap to clone; clones share the drivers and therefore the per-run container store.
#[derive(Debug, Clone)]
pub struct Runner {
    config: Arc<RunnerConfig>,
    docker: Arc<DockerRunner>,
    host: Arc<HostRunner>,
    sink: LogSink,
}

impl Runner {
    /// Runner spawning real processes
    pub fn new(config: RunnerConfig) -> Self {
        let process = Arc::new(CommandRunner::new(config.verbose));
        Self::with_process_runner(config, process)
    }

    /// Runner issuing every external command through `process`
    pub fn with_process_runner(config: RunnerConfig, process: Arc<dyn ProcessRunner>) -> Self {
        let docker = DockerRunner::new(
            process.clone(),
            config.runtime,
            config.build_directory.clone(),
            config.stop_timeout_secs,
        );
        let host = HostRunner::new(process, config.build_directory.clone());
        Self::from_parts(config, docker, host)
    }

    pub fn from_parts(config: RunnerConfig, docker: DockerRunner, host: HostRunner) -> Self {
        Self {
            config: Arc::new(config),
            docker: Arc::new(docker),
            host: Arc::new(host),
            sink: LogSink::default(),
        }
    }

    /// Send stage output to `sink` instead of stdout
    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn docker(&self) -> &DockerRunner {
        &self.docker
    }

    /// Read the manifest and report its warnings and errors
    pub fn validate(&self) -> Result<Manifest> {
        let path = self.config.manifest_path();
        info!("Validating manifest {}", path.display());

        let manifest = read_manifest(&path)?;
        let (warnings, errors) = manifest.validate();

        if !warnings.is_empty() {
            warn!("Manifest has warnings:");
            for warning in &warnings {
                warn!("{}", warning);
            }
        }

        if !errors.is_empty() {
            error!("Manifest has errors:");
            for err in &errors {
                error!("{}", err);
            }
            return Err(ManifestError::Validation { errors }.into());
        }

        info!("Manifest is valid!");
        Ok(manifest)
    }

    /// Validate the manifest and run `target`
    ///
    /// A run ended by `cancel` returns `Ok`.
    pub async fn run(&self, target: &str, cancel: &CancellationToken) -> Result<()> {
        let manifest = self.validate()?;

        info!(
            "Running manifest {} target {}",
            self.config.manifest_filename, target
        );

        match self.run_manifest(&manifest, target, cancel).await {
            Err(err) if err.is_canceled() => {
                info!("Run canceled");
                Ok(())
            }
            other => other,
        }
    }

    /// Run `target` of an already validated manifest
    #[instrument(skip_all, fields(target = %target))]
    pub async fn run_manifest(
        &self,
        manifest: &Manifest,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let manifest_target = manifest.target(target)?;
        let env = manifest.target_env(manifest_target);
        self.run_stages(&manifest_target.stages, env, cancel).await
    }

    /// Run top-level stages in order, bracketed by the network lifecycle and teardown
    pub async fn run_stages(
        &self,
        stages: &[ManifestStage],
        env: BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let needs_network = docker::needs_network(stages);
        let root = StageLogger::root(self.sink.clone());

        if needs_network {
            let start = Instant::now();
            let created = self.docker.network_create(&root, cancel).await;
            root.outcome(marker_for(&created), start.elapsed());
            created?;
        }

        let env: Env = Arc::new(env);
        let walked = self.walk(stages, &env, needs_network, cancel).await;

        let mut teardown = self.docker.stop_running_containers().await;

        if needs_network {
            let start = Instant::now();
            let removed = self.docker.network_remove(&root).await;
            root.outcome(marker_for(&removed), start.elapsed());
            if teardown.is_ok() {
                teardown = removed;
            }
        }

        match walked {
            Ok(()) => teardown,
            Err(err) if err.is_canceled() => teardown.and(Err(err)),
            Err(err) => {
                if let Err(teardown_err) = teardown {
                    warn!("Teardown failed after stage failure: {}", teardown_err);
                }
                Err(err)
            }
        }
    }

    async fn walk(
        &self,
        stages: &[ManifestStage],
        env: &Env,
        needs_network: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for (index, stage) in stages.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(InfinityError::Canceled);
            }
            let logger = StageLogger::for_stage(self.sink.clone(), &stage.name, stage_color(index));
            self.run_stage(
                stage.clone(),
                env.clone(),
                logger,
                needs_network,
                cancel.clone(),
            )
            .await?;
        }
        Ok(())
    }

    /// Run one node of the stage tree, logging its start and outcome
    fn run_stage(
        &self,
        stage: ManifestStage,
        env: Env,
        logger: StageLogger,
        needs_network: bool,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<()>> {
        let runner = self.clone();

        async move {
            let start = Instant::now();
            logger.info("Starting stage");

            let result = if stage.is_group() {
                runner
                    .run_parallel_stages(&stage, &env, &logger, needs_network, &cancel)
                    .await
            } else {
                runner
                    .run_leaf(&stage, &env, &logger, needs_network, &cancel)
                    .await
            };

            logger.outcome(marker_for(&result), start.elapsed());
            result
        }
        .boxed()
    }

    async fn run_parallel_stages(
        &self,
        group: &ManifestStage,
        env: &Env,
        logger: &StageLogger,
        needs_network: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut tasks = TaskGroup::new(cancel, self.config.max_parallel);

        for (index, child) in group.stages.iter().enumerate() {
            let runner = self.clone();
            let child = child.clone();
            let env = env.clone();
            let logger = logger.child(&child.name, stage_color(index));
            tasks.spawn(move |token| runner.run_stage(child, env, logger, needs_network, token));
        }

        tasks.join().await
    }

    async fn run_leaf(
        &self,
        stage: &ManifestStage,
        env: &Env,
        logger: &StageLogger,
        needs_network: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let env = stage.environment(env);

        match stage.runner_type() {
            RunnerType::Container => {
                if stage.image().is_empty() {
                    return Err(StageError::MissingImage {
                        stage: stage.name.clone(),
                    }
                    .into());
                }

                let pulled = if self.config.force_pull {
                    false
                } else {
                    self.docker.image_is_pulled(stage, logger, cancel).await?
                };

                if !pulled {
                    self.docker.pull(stage, logger, cancel).await?;
                }

                self.docker
                    .start(stage, &env, needs_network, logger, cancel)
                    .await
            }
            RunnerType::Host => self.host.run_stage(stage, &env, logger, cancel).await,
            RunnerType::Unknown(runner) => Err(StageError::UnsupportedRunner { runner }.into()),
        }
    }
}
