//! Process runner
//!
//! Thin wrapper around `tokio::process` used for every external program the engine drives:
//! the container engine CLI as well as host stage commands. Output is either streamed line by
//! line to a [`StageLogger`] or captured. A fired [`CancellationToken`] terminates the child.

use crate::env;
use crate::errors::ProcessError;
use crate::output::StageLogger;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// A program invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    /// Program to run, resolved through `PATH`
    pub program: String,
    /// Arguments passed verbatim, without shell interpretation
    pub args: Vec<String>,
    /// Working directory; `None` inherits the current directory
    pub dir: Option<PathBuf>,
    /// Extra `KEY=VALUE` entries overriding the inherited environment
    pub env: Vec<String>,
}

impl Invocation {
    /// Create an invocation of `program` with `args`
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            dir: None,
            env: Vec::new(),
        }
    }

    /// Run in `dir`; an empty path keeps the current directory
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.dir = if dir.as_os_str().is_empty() {
            None
        } else {
            Some(dir)
        };
        self
    }

    /// Add environment overrides
    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    /// First argument, usually the engine subcommand
    pub fn subcommand(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    /// Human-readable command line
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Spawns external programs
#[async_trait]
pub trait ProcessRunner: Send + Sync + std::fmt::Debug {
    /// Run to completion, streaming stdout and stderr lines to `logger`
    async fn run(
        &self,
        invocation: &Invocation,
        logger: &StageLogger,
        cancel: &CancellationToken,
    ) -> Result<(), ProcessError>;

    /// Run to completion and return stdout followed by stderr
    async fn capture(
        &self,
        invocation: &Invocation,
        logger: &StageLogger,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ProcessError>;
}

/// [`ProcessRunner`] backed by real child processes
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    verbose: bool,
}

impl CommandRunner {
    /// Create a runner; `verbose` echoes every command line to the stage logger
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    fn command(&self, invocation: &Invocation, logger: &StageLogger) -> Command {
        if self.verbose {
            logger.info(&format!("> {}", invocation.command_line()));
        }

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = &invocation.dir {
            command.current_dir(dir);
        }

        if !invocation.env.is_empty() {
            let inherited: Vec<String> = std::env::vars()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            command
                .env_clear()
                .envs(env::to_map(&env::overlay(&inherited, &invocation.env)));
        }

        command
    }
}

fn exit_error(invocation: &Invocation, status: ExitStatus, stderr: &[u8]) -> ProcessError {
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    ProcessError::Exit {
        program: invocation.program.clone(),
        code: status.code(),
        status: status.to_string(),
        detail: if stderr.is_empty() {
            String::new()
        } else {
            format!(": {}", stderr)
        },
    }
}

async fn forward_lines<R>(reader: R, logger: &StageLogger) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf);
        logger.line(line.trim_end_matches(['\r', '\n']));
    }
}

async fn stream_child(child: &mut Child, logger: &StageLogger) -> std::io::Result<ExitStatus> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let forward_stdout = async {
        match stdout {
            Some(out) => forward_lines(out, logger).await,
            None => Ok(()),
        }
    };
    let forward_stderr = async {
        match stderr {
            Some(err) => forward_lines(err, logger).await,
            None => Ok(()),
        }
    };

    let (out, err) = tokio::join!(forward_stdout, forward_stderr);
    out?;
    err?;
    child.wait().await
}

#[async_trait]
impl ProcessRunner for CommandRunner {
    #[instrument(skip(self, logger, cancel), fields(command = %invocation.command_line()))]
    async fn run(
        &self,
        invocation: &Invocation,
        logger: &StageLogger,
        cancel: &CancellationToken,
    ) -> Result<(), ProcessError> {
        let mut child = self
            .command(invocation, logger)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        let status = tokio::select! {
            status = stream_child(&mut child, logger) => status.map_err(|source| ProcessError::Io {
                program: invocation.program.clone(),
                source,
            })?,
            _ = cancel.cancelled() => {
                debug!("Cancellation requested, terminating {}", invocation.program);
                return Err(ProcessError::Canceled {
                    program: invocation.program.clone(),
                });
            }
        };

        if status.success() {
            Ok(())
        } else {
            Err(exit_error(invocation, status, &[]))
        }
    }

    #[instrument(skip(self, logger, cancel), fields(command = %invocation.command_line()))]
    async fn capture(
        &self,
        invocation: &Invocation,
        logger: &StageLogger,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ProcessError> {
        let mut command = self.command(invocation, logger);

        let output = tokio::select! {
            output = command.output() => output.map_err(|source| ProcessError::Spawn {
                program: invocation.program.clone(),
                source,
            })?,
            _ = cancel.cancelled() => {
                debug!("Cancellation requested, terminating {}", invocation.program);
                return Err(ProcessError::Canceled {
                    program: invocation.program.clone(),
                });
            }
        };

        if !output.status.success() {
            return Err(exit_error(invocation, output.status, &output.stderr));
        }

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        Ok(combined)
    }
}

pub mod mock {
    //! Scripted process runner for exercising the engine without a container engine
    //!
    //! Every invocation is recorded; a handler decides the response per invocation.

    use super::{Invocation, ProcessRunner};
    use crate::errors::ProcessError;
    use crate::output::StageLogger;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    /// Scripted reaction to one invocation
    #[derive(Debug, Clone, Default)]
    pub struct MockResponse {
        /// Output returned by `capture` and streamed line by line by `run`
        pub output: String,
        /// Simulated runtime; cancellation interrupts it
        pub delay: Option<Duration>,
        /// Exit code; non-zero produces [`ProcessError::Exit`]
        pub exit_code: i32,
    }

    impl MockResponse {
        /// Successful, silent response
        pub fn ok() -> Self {
            Self::default()
        }

        /// Successful response with output
        pub fn output(output: impl Into<String>) -> Self {
            Self {
                output: output.into(),
                ..Self::default()
            }
        }

        /// Failing response
        pub fn failure(exit_code: i32, output: impl Into<String>) -> Self {
            Self {
                output: output.into(),
                exit_code,
                delay: None,
            }
        }

        /// Simulate a command that takes `delay` to finish
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }
    }

    /// How an invocation was issued
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum CallKind {
        Run,
        Capture,
    }

    /// Record of one invocation
    #[derive(Debug, Clone)]
    pub struct MockCall {
        pub invocation: Invocation,
        pub kind: CallKind,
        pub started: Instant,
        pub canceled: bool,
    }

    type Handler = dyn Fn(&Invocation) -> MockResponse + Send + Sync;

    /// Recording, scripted [`ProcessRunner`]
    #[derive(Clone)]
    pub struct MockProcessRunner {
        handler: Arc<Handler>,
        calls: Arc<Mutex<Vec<MockCall>>>,
    }

    impl std::fmt::Debug for MockProcessRunner {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockProcessRunner")
                .field("calls", &self.calls().len())
                .finish()
        }
    }

    impl Default for MockProcessRunner {
        fn default() -> Self {
            Self::with_handler(|_| MockResponse::ok())
        }
    }

    impl MockProcessRunner {
        /// Runner answering every invocation through `handler`
        pub fn with_handler<F>(handler: F) -> Self
        where
            F: Fn(&Invocation) -> MockResponse + Send + Sync + 'static,
        {
            Self {
                handler: Arc::new(handler),
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Every invocation issued so far, in issue order
        pub fn calls(&self) -> Vec<MockCall> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Invocations whose first argument is `subcommand`
        pub fn calls_to(&self, subcommand: &str) -> Vec<Invocation> {
            self.calls()
                .into_iter()
                .filter(|call| call.invocation.subcommand() == Some(subcommand))
                .map(|call| call.invocation)
                .collect()
        }

        /// Number of invocations whose first argument is `subcommand`
        pub fn count(&self, subcommand: &str) -> usize {
            self.calls_to(subcommand).len()
        }

        /// Index in the history of the first invocation matching `predicate`
        pub fn position<P>(&self, predicate: P) -> Option<usize>
        where
            P: Fn(&Invocation) -> bool,
        {
            self.calls()
                .iter()
                .position(|call| predicate(&call.invocation))
        }

        fn record(&self, invocation: &Invocation, kind: CallKind) -> usize {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            calls.push(MockCall {
                invocation: invocation.clone(),
                kind,
                started: Instant::now(),
                canceled: false,
            });
            calls.len() - 1
        }

        fn mark_canceled(&self, index: usize) {
            if let Some(call) = self
                .calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_mut(index)
            {
                call.canceled = true;
            }
        }

        async fn respond(
            &self,
            invocation: &Invocation,
            kind: CallKind,
            cancel: &CancellationToken,
        ) -> Result<MockResponse, ProcessError> {
            let index = self.record(invocation, kind);
            let response = (self.handler)(invocation);

            if let Some(delay) = response.delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        self.mark_canceled(index);
                        return Err(ProcessError::Canceled {
                            program: invocation.program.clone(),
                        });
                    }
                }
            } else if cancel.is_cancelled() {
                self.mark_canceled(index);
                return Err(ProcessError::Canceled {
                    program: invocation.program.clone(),
                });
            }

            if response.exit_code != 0 {
                return Err(ProcessError::Exit {
                    program: invocation.program.clone(),
                    code: Some(response.exit_code),
                    status: format!("exit status: {}", response.exit_code),
                    detail: if response.output.trim().is_empty() {
                        String::new()
                    } else {
                        format!(": {}", response.output.trim())
                    },
                });
            }

            Ok(response)
        }
    }

    #[async_trait]
    impl ProcessRunner for MockProcessRunner {
        async fn run(
            &self,
            invocation: &Invocation,
            logger: &StageLogger,
            cancel: &CancellationToken,
        ) -> Result<(), ProcessError> {
            let response = self.respond(invocation, CallKind::Run, cancel).await?;
            for line in response.output.lines() {
                logger.line(line);
            }
            Ok(())
        }

        async fn capture(
            &self,
            invocation: &Invocation,
            _logger: &StageLogger,
            cancel: &CancellationToken,
        ) -> Result<Vec<u8>, ProcessError> {
            let response = self.respond(invocation, CallKind::Capture, cancel).await?;
            Ok(response.output.into_bytes())
        }
    }
}
