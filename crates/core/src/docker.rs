//! Container lifecycle driver
//!
//! Drives an external container engine (docker or podman) through its command line to pull
//! images, start stage containers, follow their logs and tear them down. Running containers
//! and pulled images are tracked in a per-run [`ContainerStore`].

use crate::errors::{ContainerError, InfinityError, ProcessError, Result, StageError};
use crate::manifest::ManifestStage;
use crate::output::{Marker, StageLogger};
use crate::process::{Invocation, ProcessRunner};
use crate::runtime::RuntimeKind;
use crate::store::{ContainerStore, RunningContainer};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Exit codes of a container ended by `stop`: SIGTERM honoured, or SIGKILL after the timeout
const STOPPED_EXIT_CODES: [i32; 2] = [143, 137];

/// Length of the random suffix of the run network name
const NETWORK_SUFFIX_LEN: usize = 10;

/// Generate a fresh `infinity-<suffix>` network name
pub fn generate_network_name() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let suffix: String = (0..NETWORK_SUFFIX_LEN)
        .map(|_| ALPHABET[fastrand::usize(..ALPHABET.len())] as char)
        .collect();
    format!("infinity-{}", suffix)
}

/// Whether any stage in the tree runs in the background
pub fn needs_network(stages: &[ManifestStage]) -> bool {
    stages.iter().any(ManifestStage::has_background)
}

/// Image reference as listed by `images`, with the implicit `latest` tag made explicit
fn normalize_image(image: &str) -> String {
    let name = image.rsplit('/').next().unwrap_or(image);
    if name.contains(':') || name.contains('@') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

/// Shell script run by the container entrypoint; echoes each command before running it
pub fn command_script(commands: &[String]) -> String {
    let mut parts = vec!["set -e".to_string()];
    for command in commands {
        parts.push(format!(
            r"printf '\033[38;5;244m> %s\033[0m\n' {}",
            shell_words::quote(command)
        ));
        parts.push(command.clone());
    }
    parts.join(" ; ")
}

fn trim_output(output: &[u8]) -> String {
    String::from_utf8_lossy(output)
        .trim()
        .trim_matches('\'')
        .to_string()
}

#[derive(Debug)]
pub struct DockerRunner {
    process: Arc<dyn ProcessRunner>,
    runtime: RuntimeKind,
    build_directory: PathBuf,
    network_name: String,
    stop_timeout_secs: u64,
    store: ContainerStore,
}

impl DockerRunner {
    pub fn new(
        process: Arc<dyn ProcessRunner>,
        runtime: RuntimeKind,
        build_directory: impl Into<PathBuf>,
        stop_timeout_secs: u64,
    ) -> Self {
        Self {
            process,
            runtime,
            build_directory: build_directory.into(),
            network_name: generate_network_name(),
            stop_timeout_secs,
            store: ContainerStore::new(),
        }
    }

    /// Use a fixed network name instead of a generated one
    pub fn with_network_name(mut self, name: impl Into<String>) -> Self {
        self.network_name = name.into();
        self
    }

    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    pub fn store(&self) -> &ContainerStore {
        &self.store
    }

    fn invocation<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation::new(self.runtime.as_str(), args)
    }

    /// Whether the stage image is available locally
    ///
    /// Images pulled earlier in this run are answered from the store.
    #[instrument(skip_all, fields(image = %stage.image()))]
    pub async fn image_is_pulled(
        &self,
        stage: &ManifestStage,
        logger: &StageLogger,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let image = stage.image();
        let _guard = self.store.lock_image(image, cancel).await?;

        if self.store.is_pulled(image) {
            logger.info(&format!("Already pulled image {}", image));
            return Ok(true);
        }

        let invocation = self.invocation(["images", "--format={{.Repository}}:{{.Tag}}", image]);
        let output = self
            .process
            .capture(&invocation, logger, cancel)
            .await
            .map_err(|source| match source {
                ProcessError::Canceled { .. } => InfinityError::Canceled,
                source => ContainerError::ImageCheck {
                    image: image.to_string(),
                    stage: stage.name.clone(),
                    source,
                }
                .into(),
            })?;

        let wanted = normalize_image(image);
        let listed = String::from_utf8_lossy(&output);
        let found = listed
            .lines()
            .map(|line| line.trim().trim_matches('\''))
            .any(|line| line == wanted);

        debug!(found, "Checked local image");
        Ok(found)
    }

    /// Pull the stage image unless it was already pulled in this run
    #[instrument(skip_all, fields(image = %stage.image()))]
    pub async fn pull(
        &self,
        stage: &ManifestStage,
        logger: &StageLogger,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let image = stage.image();
        let _guard = self.store.lock_image(image, cancel).await?;

        if self.store.is_pulled(image) {
            logger.info(&format!("Already pulled image {}", image));
            return Ok(());
        }

        logger.info(&format!("Pulling image {}", image));
        let start = Instant::now();

        match self
            .process
            .run(&self.invocation(["pull", image]), logger, cancel)
            .await
        {
            Ok(()) => {
                logger.timed("Pulled", Marker::Completed, start.elapsed());
                self.store.mark_pulled(image);
                Ok(())
            }
            Err(err) if err.is_canceled() => Err(InfinityError::Canceled),
            Err(source) => {
                logger.timed("Failed pulling", Marker::Failed, start.elapsed());
                Err(ContainerError::Pull {
                    image: image.to_string(),
                    stage: stage.name.clone(),
                    source,
                }
                .into())
            }
        }
    }

    /// Arguments of the `run` invocation starting `stage`
    pub fn run_args(
        &self,
        stage: &ManifestStage,
        env: &BTreeMap<String, String>,
        needs_network: bool,
        build_directory: &Path,
    ) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--detach".to_string()];

        if stage.background {
            args.push(format!("--name={}", stage.name));
        }
        if needs_network {
            args.push(format!("--network={}", self.network_name));
        }
        if stage.mounts_working_directory() {
            let work = stage.working_directory();
            args.push(format!("--volume={}:{}", build_directory.display(), work));
            args.push(format!("--workdir={}", work));
        }
        args.extend(stage.volumes.iter().map(|v| format!("--volume={}", v)));
        args.extend(stage.devices.iter().map(|d| format!("--device={}", d)));
        args.extend(env.iter().map(|(k, v)| format!("--env={}={}", k, v)));
        if stage.privileged {
            args.push("--privileged".to_string());
        }
        if !stage.commands.is_empty() {
            args.push(format!("--entrypoint={}", stage.shell()));
        }

        args.push(stage.image().to_string());

        if !stage.commands.is_empty() {
            args.push("-c".to_string());
            args.push(command_script(&stage.commands));
        }

        args
    }

    fn absolute_build_directory(&self, stage: &ManifestStage) -> Result<PathBuf> {
        if self.build_directory.is_absolute() {
            return Ok(self.build_directory.clone());
        }
        let cwd = std::env::current_dir().map_err(|source| ContainerError::WorkingDirectory {
            stage: stage.name.clone(),
            source,
        })?;
        Ok(cwd.join(&self.build_directory))
    }

    /// Start the stage container
    ///
    /// Background stages return once started and are torn down by
    /// [`stop_running_containers`](Self::stop_running_containers). Foreground stages are
    /// followed to completion, killed when `cancel` fires, and always removed.
    #[instrument(skip_all, fields(stage = %stage.name, image = %stage.image()))]
    pub async fn start(
        &self,
        stage: &ManifestStage,
        env: &BTreeMap<String, String>,
        needs_network: bool,
        logger: &StageLogger,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let build_directory = self.absolute_build_directory(stage)?;
        let args = self.run_args(stage, env, needs_network, &build_directory);

        if stage.background {
            logger.info("Starting stage in background");
        } else {
            logger.info("Executing commands");
        }

        let start = Instant::now();
        let output = match self
            .process
            .capture(&self.invocation(args), logger, cancel)
            .await
        {
            Ok(output) => output,
            Err(err) if err.is_canceled() => return Err(InfinityError::Canceled),
            Err(source) => {
                logger.timed("Failed starting container", Marker::Failed, start.elapsed());
                return Err(ContainerError::Start {
                    stage: stage.name.clone(),
                    source,
                }
                .into());
            }
        };

        let container_id = String::from_utf8_lossy(&output)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ContainerError::MissingContainerId {
                stage: stage.name.clone(),
            })?;

        debug!(%container_id, "Container started");
        self.store.track(RunningContainer {
            id: container_id.clone(),
            stage_name: stage.name.clone(),
            logger: logger.clone(),
        });

        if stage.background {
            logger.timed("Started", Marker::Completed, start.elapsed());
            return Ok(());
        }

        let result = tokio::select! {
            result = self.await_completion(&container_id, stage, logger) => result,
            _ = cancel.cancelled() => {
                debug!(%container_id, "Cancellation requested, killing container");
                if let Err(err) = self.kill(&container_id, logger).await {
                    warn!("{}", err);
                }
                Err(InfinityError::Canceled)
            }
        };

        let removed = self.remove(&container_id, logger).await;
        self.store.untrack(&container_id);

        result?;
        removed
    }

    /// Follow logs to the end and check the exit code
    async fn await_completion(
        &self,
        container_id: &str,
        stage: &ManifestStage,
        logger: &StageLogger,
    ) -> Result<()> {
        let detached = CancellationToken::new();
        self.logs(container_id, &stage.name, logger, &detached).await?;

        let code = self.exit_code(container_id, logger, &detached).await?;
        if code > 0 {
            return Err(StageError::ExitCode {
                stage: stage.name.clone(),
                code,
            }
            .into());
        }
        Ok(())
    }

    /// Stream container output until the container exits
    pub async fn logs(
        &self,
        container_id: &str,
        stage_name: &str,
        logger: &StageLogger,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.process
            .run(
                &self.invocation(["logs", "--follow", container_id]),
                logger,
                cancel,
            )
            .await
            .map_err(|source| match source {
                ProcessError::Canceled { .. } => InfinityError::Canceled,
                source => ContainerError::Logs {
                    stage: stage_name.to_string(),
                    source,
                }
                .into(),
            })
    }

    /// Exit code of a finished container
    pub async fn exit_code(
        &self,
        container_id: &str,
        logger: &StageLogger,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        let output = self
            .process
            .capture(
                &self.invocation(["inspect", "--format={{.State.ExitCode}}", container_id]),
                logger,
                cancel,
            )
            .await
            .map_err(|source| ContainerError::Inspect {
                container_id: container_id.to_string(),
                source,
            })?;

        let output = trim_output(&output);
        output.parse::<i32>().map_err(|_| {
            ContainerError::ExitCodeParse {
                container_id: container_id.to_string(),
                output,
            }
            .into()
        })
    }

    /// Stop a container, giving it the configured grace period
    pub async fn stop(&self, container_id: &str, logger: &StageLogger) -> Result<()> {
        let timeout = format!("--time={}", self.stop_timeout_secs);
        self.process
            .capture(
                &self.invocation(["stop", timeout.as_str(), container_id]),
                logger,
                &CancellationToken::new(),
            )
            .await
            .map(|_| ())
            .map_err(|source| {
                ContainerError::Stop {
                    container_id: container_id.to_string(),
                    source,
                }
                .into()
            })
    }

    pub async fn kill(&self, container_id: &str, logger: &StageLogger) -> Result<()> {
        self.process
            .capture(
                &self.invocation(["kill", container_id]),
                logger,
                &CancellationToken::new(),
            )
            .await
            .map(|_| ())
            .map_err(|source| {
                ContainerError::Kill {
                    container_id: container_id.to_string(),
                    source,
                }
                .into()
            })
    }

    /// Remove a container along with its anonymous volumes
    pub async fn remove(&self, container_id: &str, logger: &StageLogger) -> Result<()> {
        self.process
            .capture(
                &self.invocation(["rm", "--volumes", container_id]),
                logger,
                &CancellationToken::new(),
            )
            .await
            .map(|_| ())
            .map_err(|source| {
                ContainerError::Remove {
                    container_id: container_id.to_string(),
                    source,
                }
                .into()
            })
    }

    #[instrument(skip_all, fields(network = %self.network_name))]
    pub async fn network_create(
        &self,
        logger: &StageLogger,
        cancel: &CancellationToken,
    ) -> Result<()> {
        logger.info(&format!("Creating network {}", self.network_name));
        self.process
            .capture(
                &self.invocation(["network", "create", self.network_name.as_str()]),
                logger,
                cancel,
            )
            .await
            .map(|_| ())
            .map_err(|source| match source {
                ProcessError::Canceled { .. } => InfinityError::Canceled,
                source => ContainerError::NetworkCreate {
                    network: self.network_name.clone(),
                    source,
                }
                .into(),
            })
    }

    /// Remove the run network; runs to completion regardless of cancellation
    #[instrument(skip_all, fields(network = %self.network_name))]
    pub async fn network_remove(&self, logger: &StageLogger) -> Result<()> {
        logger.info(&format!("Removing network {}", self.network_name));
        self.process
            .capture(
                &self.invocation(["network", "rm", self.network_name.as_str()]),
                logger,
                &CancellationToken::new(),
            )
            .await
            .map(|_| ())
            .map_err(|source| {
                ContainerError::NetworkRemove {
                    network: self.network_name.clone(),
                    source,
                }
                .into()
            })
    }

    /// Stop, drain and remove every tracked container
    ///
    /// Containers are handled concurrently and all of them are attempted; the first error is
    /// returned afterwards.
    pub async fn stop_running_containers(&self) -> Result<()> {
        let running = self.store.running();
        if running.is_empty() {
            return Ok(());
        }

        info!("Stopping {} running stage containers", running.len());

        let results = join_all(running.iter().map(|c| self.shutdown(c))).await;
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    async fn shutdown(&self, container: &RunningContainer) -> Result<()> {
        let logger = &container.logger;
        let start = Instant::now();

        let drain = async {
            let detached = CancellationToken::new();
            self.logs(&container.id, &container.stage_name, logger, &detached)
                .await?;
            self.exit_code(&container.id, logger, &detached).await
        };

        let (stopped, drained) = tokio::join!(self.stop(&container.id, logger), drain);

        let result = match drained {
            Ok(code) if code > 0 && !STOPPED_EXIT_CODES.contains(&code) => {
                Err(StageError::ExitCode {
                    stage: container.stage_name.clone(),
                    code,
                }
                .into())
            }
            Ok(_) => stopped,
            Err(err) => Err(err),
        };

        let removed = self.remove(&container.id, logger).await;
        self.store.untrack(&container.id);

        match &result {
            Ok(()) => logger.timed("Stopped", Marker::Completed, start.elapsed()),
            Err(_) => logger.timed("Failed stopping", Marker::Failed, start.elapsed()),
        }

        result?;
        removed
    }
}
