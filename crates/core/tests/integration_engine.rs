//! Engine behavior against a scripted container engine
//!
//! Every external command goes through a `MockProcessRunner`, so these tests exercise the
//! full stage walk, the container lifecycle and teardown without docker being installed.

use infinity_core::config::RunnerConfig;
use infinity_core::docker::DockerRunner;
use infinity_core::engine::Runner;
use infinity_core::host::HostRunner;
use infinity_core::manifest::{Manifest, ManifestStage};
use infinity_core::output::LogSink;
use infinity_core::process::mock::{CallKind, MockProcessRunner, MockResponse};
use infinity_core::process::{Invocation, ProcessRunner};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::fs;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const NETWORK: &str = "infinity-testnet";

fn config() -> RunnerConfig {
    RunnerConfig {
        build_directory: PathBuf::from("/src"),
        ..RunnerConfig::default()
    }
}

fn runner(mock: &MockProcessRunner, config: RunnerConfig, sink: &LogSink) -> Runner {
    let process: Arc<dyn ProcessRunner> = Arc::new(mock.clone());
    let docker = DockerRunner::new(
        process.clone(),
        config.runtime,
        config.build_directory.clone(),
        config.stop_timeout_secs,
    )
    .with_network_name(NETWORK);
    let host = HostRunner::new(process, config.build_directory.clone());
    Runner::from_parts(config, docker, host).with_log_sink(sink.clone())
}

fn stages(yaml: &str) -> Vec<ManifestStage> {
    let manifest = Manifest::from_yaml(yaml, ".infinity.yaml").unwrap();
    manifest.targets[0].stages.clone()
}

/// Script argument of a `run` invocation
fn script(invocation: &Invocation) -> &str {
    invocation.args.last().map(String::as_str).unwrap_or_default()
}

/// Engine where images are missing locally and every container succeeds
///
/// Containers get ids `c1`, `c2`, ... in start order.
fn counting_engine(pull_delay: Duration) -> MockProcessRunner {
    let started = Arc::new(AtomicUsize::new(0));
    MockProcessRunner::with_handler(move |invocation| match invocation.subcommand() {
        Some("pull") => MockResponse::ok().with_delay(pull_delay),
        Some("run") => {
            let n = started.fetch_add(1, Ordering::SeqCst) + 1;
            MockResponse::output(format!("c{}\n", n))
        }
        Some("inspect") => MockResponse::output("0\n"),
        _ => MockResponse::ok(),
    })
}

#[tokio::test]
async fn test_parallel_stages_pull_shared_image_once() {
    let mock = counting_engine(Duration::from_millis(100));
    let stages = stages(
        r#"
targets:
  - name: build/local
    stages:
      - name: checks
        stages:
          - name: lint
            image: alpine:3.13
            commands: [lint]
          - name: unit
            image: alpine:3.13
            commands: [test]
          - name: audit
            image: alpine:3.13
            commands: [audit]
"#,
    );

    runner(&mock, config(), &LogSink::memory())
        .run_stages(&stages, BTreeMap::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(mock.count("pull"), 1);
    assert_eq!(mock.count("run"), 3);
    assert_eq!(mock.count("rm"), 3);

    let calls = mock.calls();
    let pull = calls
        .iter()
        .find(|c| c.invocation.subcommand() == Some("pull"))
        .unwrap();
    assert_eq!(pull.kind, CallKind::Run);
    for started in calls
        .iter()
        .filter(|c| c.invocation.subcommand() == Some("run"))
    {
        assert_eq!(started.kind, CallKind::Capture);
        assert!(started.started.duration_since(pull.started) >= Duration::from_millis(100));
    }
}

#[tokio::test]
async fn test_sequential_stages_share_pull_and_run_in_order() {
    let mock = counting_engine(Duration::ZERO);
    let stages = stages(
        r#"
targets:
  - name: build/local
    stages:
      - name: stage-1
        image: alpine:3.13
        commands: [first]
      - name: stage-2
        image: alpine:3.13
        commands: [second]
"#,
    );

    runner(&mock, config(), &LogSink::memory())
        .run_stages(&stages, BTreeMap::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(mock.count("pull"), 1);
    assert_eq!(mock.count("run"), 2);

    let first_removed = mock
        .position(|i| i.args == ["rm", "--volumes", "c1"])
        .unwrap();
    let second_started = mock
        .position(|i| i.subcommand() == Some("run") && script(i).contains("second"))
        .unwrap();
    assert!(first_removed < second_started);
}

#[tokio::test]
async fn test_force_pull_skips_image_check() {
    let mock = counting_engine(Duration::ZERO);
    let stages = stages(
        "targets:\n  - name: t\n    stages:\n      - name: build\n        image: alpine:3.13\n        commands: [make]\n",
    );
    let config = RunnerConfig {
        force_pull: true,
        ..config()
    };

    runner(&mock, config, &LogSink::memory())
        .run_stages(&stages, BTreeMap::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(mock.count("images"), 0);
    assert_eq!(mock.count("pull"), 1);
}

#[tokio::test]
async fn test_locally_present_image_is_not_pulled() {
    let mock = MockProcessRunner::with_handler(|invocation| match invocation.subcommand() {
        Some("images") => MockResponse::output("'alpine:3.13'\n"),
        Some("run") => MockResponse::output("c1\n"),
        Some("inspect") => MockResponse::output("0\n"),
        _ => MockResponse::ok(),
    });
    let stages = stages(
        "targets:\n  - name: t\n    stages:\n      - name: build\n        image: alpine:3.13\n        commands: [make]\n",
    );

    runner(&mock, config(), &LogSink::memory())
        .run_stages(&stages, BTreeMap::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(mock.count("pull"), 0);
    assert_eq!(mock.count("run"), 1);
}

#[tokio::test]
async fn test_non_zero_exit_code_fails_stage() {
    let mock = MockProcessRunner::with_handler(|invocation| match invocation.subcommand() {
        Some("run") => MockResponse::output("c1\n"),
        Some("inspect") => MockResponse::output("3\n"),
        _ => MockResponse::ok(),
    });
    let stages = stages(
        "targets:\n  - name: t\n    stages:\n      - name: build\n        image: alpine:3.13\n        commands: [make]\n      - name: never\n        image: alpine:3.13\n        commands: [make]\n",
    );
    let sink = LogSink::memory();

    let err = runner(&mock, config(), &sink)
        .run_stages(&stages, BTreeMap::new(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "stage build failed with exit code 3");
    assert_eq!(mock.count("run"), 1);
    assert_eq!(mock.calls_to("rm")[0].args, ["rm", "--volumes", "c1"]);
    assert!(sink
        .lines()
        .iter()
        .any(|l| l.starts_with("[build] Failed in ")));
}

#[tokio::test]
async fn test_first_failure_cancels_parallel_siblings() {
    let mock = MockProcessRunner::with_handler(|invocation| {
        let container = invocation.args.last().cloned().unwrap_or_default();
        match invocation.subcommand() {
            Some("images") => MockResponse::output("alpine:3.13\n"),
            Some("run") if script(invocation).contains("exit 1") => MockResponse::output("fails\n"),
            Some("run") => MockResponse::output("slow\n"),
            Some("logs") if container == "slow" => {
                MockResponse::ok().with_delay(Duration::from_secs(30))
            }
            Some("logs") => MockResponse::ok().with_delay(Duration::from_millis(100)),
            Some("inspect") if container == "fails" => MockResponse::output("1\n"),
            Some("inspect") => MockResponse::output("0\n"),
            _ => MockResponse::ok(),
        }
    });
    let stages = stages(
        r#"
targets:
  - name: build/local
    stages:
      - name: group
        stages:
          - name: fails
            image: alpine:3.13
            commands: [exit 1]
          - name: slow
            image: alpine:3.13
            commands: [sleep 30]
"#,
    );
    let sink = LogSink::memory();

    let start = Instant::now();
    let err = runner(&mock, config(), &sink)
        .run_stages(&stages, BTreeMap::new(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(err.to_string().contains("stage fails failed"), "{}", err);
    assert_eq!(mock.calls_to("kill")[0].args, ["kill", "slow"]);
    assert_eq!(mock.count("rm"), 2);

    let lines = sink.lines();
    assert!(lines.iter().any(|l| l.starts_with("[group] [slow] Canceled in ")));
    assert!(lines.iter().any(|l| l.starts_with("[group] [fails] Failed in ")));
}

const BACKGROUND_MANIFEST: &str = r#"
targets:
  - name: build/local
    stages:
      - name: db
        image: postgres:16
        background: true
      - name: test
        image: alpine:3.13
        commands: [run-tests]
"#;

fn background_engine(test_exit_code: &'static str) -> MockProcessRunner {
    MockProcessRunner::with_handler(move |invocation| {
        let last = invocation.args.last().cloned().unwrap_or_default();
        match invocation.subcommand() {
            Some("run") if invocation.args.iter().any(|a| a == "--name=db") => {
                MockResponse::output("db-id\n")
            }
            Some("run") => MockResponse::output("test-id\n"),
            Some("inspect") if last == "db-id" => MockResponse::output("143\n"),
            Some("inspect") => MockResponse::output(test_exit_code),
            _ => MockResponse::ok(),
        }
    })
}

#[tokio::test]
async fn test_background_stage_brackets_run_with_network() {
    let mock = background_engine("0\n");
    let sink = LogSink::memory();
    let runner = runner(&mock, config(), &sink);

    runner
        .run_stages(
            &stages(BACKGROUND_MANIFEST),
            BTreeMap::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let networks = mock.calls_to("network");
    assert_eq!(networks.len(), 2);
    assert_eq!(networks[0].args, ["network", "create", NETWORK]);
    assert_eq!(networks[1].args, ["network", "rm", NETWORK]);

    let runs = mock.calls_to("run");
    assert_eq!(runs.len(), 2);
    assert!(runs[0].args.contains(&"--name=db".to_string()));
    assert!(runs
        .iter()
        .all(|r| r.args.contains(&format!("--network={}", NETWORK))));

    assert_eq!(mock.calls_to("stop")[0].args, ["stop", "--time=30", "db-id"]);
    let removed: Vec<String> = mock
        .calls_to("rm")
        .into_iter()
        .filter_map(|i| i.args.last().cloned())
        .collect();
    assert!(removed.contains(&"db-id".to_string()));
    assert!(removed.contains(&"test-id".to_string()));
    assert_eq!(runner.docker().store().running_count(), 0);

    let last_network_call = mock
        .position(|i| i.args == ["network", "rm", NETWORK])
        .unwrap();
    let db_removed = mock
        .position(|i| i.args == ["rm", "--volumes", "db-id"])
        .unwrap();
    assert!(db_removed < last_network_call);

    assert!(sink
        .lines()
        .contains(&format!("[infinity] Creating network {}", NETWORK)));
}

#[tokio::test]
async fn test_network_removed_when_run_fails() {
    let mock = background_engine("2\n");
    let runner = runner(&mock, config(), &LogSink::memory());

    let err = runner
        .run_stages(
            &stages(BACKGROUND_MANIFEST),
            BTreeMap::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "stage test failed with exit code 2");
    assert_eq!(mock.count("network"), 2);
    assert_eq!(mock.count("stop"), 1);
    assert_eq!(runner.docker().store().running_count(), 0);
}

#[tokio::test]
async fn test_background_failure_surfaces_from_teardown() {
    let mock = MockProcessRunner::with_handler(|invocation| match invocation.subcommand() {
        Some("run") => MockResponse::output("db-id\n"),
        Some("inspect") => MockResponse::output("1\n"),
        _ => MockResponse::ok(),
    });
    let stages = stages(
        "targets:\n  - name: t\n    stages:\n      - name: db\n        image: postgres:16\n        background: true\n",
    );

    let err = runner(&mock, config(), &LogSink::memory())
        .run_stages(&stages, BTreeMap::new(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "stage db failed with exit code 1");
    assert_eq!(mock.count("rm"), 1);
    assert_eq!(mock.count("network"), 2);
}

#[tokio::test]
async fn test_no_network_without_background_stage() {
    let mock = counting_engine(Duration::ZERO);
    let stages = stages(
        "targets:\n  - name: t\n    stages:\n      - name: build\n        image: alpine:3.13\n        commands: [make]\n",
    );

    runner(&mock, config(), &LogSink::memory())
        .run_stages(&stages, BTreeMap::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(mock.count("network"), 0);
    assert!(!mock.calls_to("run")[0]
        .args
        .iter()
        .any(|a| a.starts_with("--network=")));
}

#[tokio::test]
async fn test_parameters_become_environment_variables() {
    let mock = counting_engine(Duration::ZERO);
    let manifest = Manifest::from_yaml(
        r#"
metadata:
  name: scanner
  type: cli
  language: go
env:
  GLOBAL: one
targets:
  - name: build/local
    stages:
      - name: scan
        image: aquasec/trivy:latest
        commands: [trivy image app]
        threshold: HIGH
        containerName: extensions/docker
"#,
        ".infinity.yaml",
    )
    .unwrap();

    runner(&mock, config(), &LogSink::memory())
        .run_manifest(&manifest, "build/local", &CancellationToken::new())
        .await
        .unwrap();

    let args = mock.calls_to("run")[0].args.clone();
    assert!(args.contains(&"--env=INFINITY_PARAMETER_THRESHOLD=HIGH".to_string()));
    assert!(args.contains(&"--env=INFINITY_PARAMETER_CONTAINER_NAME=extensions/docker".to_string()));
    assert!(args.contains(&"--env=INFINITY_METADATA_NAME=scanner".to_string()));
    assert!(args.contains(&"--env=GLOBAL=one".to_string()));

    let envs: Vec<&String> = args.iter().filter(|a| a.starts_with("--env=")).collect();
    let mut sorted = envs.clone();
    sorted.sort();
    assert_eq!(envs, sorted);
}

#[tokio::test]
async fn test_pull_failure_names_image_and_stage() {
    let mock = MockProcessRunner::with_handler(|invocation| match invocation.subcommand() {
        Some("pull") => MockResponse::failure(1, "manifest unknown"),
        _ => MockResponse::ok(),
    });
    let stages = stages(
        "targets:\n  - name: t\n    stages:\n      - name: build\n        image: nope:1\n        commands: [make]\n",
    );

    let err = runner(&mock, config(), &LogSink::memory())
        .run_stages(&stages, BTreeMap::new(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err
        .to_string()
        .starts_with("pulling image nope:1 for stage build failed: "));
    assert_eq!(mock.count("run"), 0);
}

#[tokio::test]
async fn test_external_cancellation_tears_down_and_is_canceled() {
    let mock = MockProcessRunner::with_handler(|invocation| match invocation.subcommand() {
        Some("run") => MockResponse::output("c1\n"),
        Some("logs") => MockResponse::ok().with_delay(Duration::from_secs(30)),
        _ => MockResponse::ok(),
    });
    let stages = stages(
        "targets:\n  - name: t\n    stages:\n      - name: build\n        image: alpine:3.13\n        commands: [make]\n      - name: never\n        image: alpine:3.13\n        commands: [make]\n",
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let err = runner(&mock, config(), &LogSink::memory())
        .run_stages(&stages, BTreeMap::new(), &cancel)
        .await
        .unwrap_err();

    assert!(err.is_canceled());
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(mock.count("kill"), 1);
    assert_eq!(mock.count("rm"), 1);
    assert_eq!(mock.count("run"), 1);
}

#[tokio::test]
async fn test_host_stage_runs_in_build_directory() {
    let mock = MockProcessRunner::default();
    let stages = stages(
        "targets:\n  - name: t\n    stages:\n      - name: local\n        runner: host\n        commands: [make build]\n        env: {MODE: fast}\n",
    );

    runner(&mock, config(), &LogSink::memory())
        .run_stages(&stages, BTreeMap::new(), &CancellationToken::new())
        .await
        .unwrap();

    let calls = mock.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].invocation.program, "make");
    assert_eq!(calls[0].invocation.dir, Some(PathBuf::from("/src")));
    assert!(calls[0].invocation.env.contains(&"MODE=fast".to_string()));
}

#[tokio::test]
async fn test_failure_interrupts_stage_waiting_on_shared_pull() {
    let mock = MockProcessRunner::with_handler(|invocation| {
        if invocation.program == "false" {
            return MockResponse::failure(1, "").with_delay(Duration::from_millis(200));
        }
        match invocation.subcommand() {
            Some("pull") => MockResponse::ok().with_delay(Duration::from_secs(30)),
            _ => MockResponse::ok(),
        }
    });
    let stages = stages(
        r#"
targets:
  - name: build/local
    stages:
      - name: outer
        stages:
          - name: inner
            stages:
              - name: fails
                runner: host
                commands: ["false"]
              - name: waits
                image: alpine:3.13
                commands: [make]
          - name: pulls
            image: alpine:3.13
            commands: [make]
"#,
    );

    let start = Instant::now();
    let err = runner(&mock, config(), &LogSink::memory())
        .run_stages(&stages, BTreeMap::new(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(err.to_string().contains("stage fails failed"), "{}", err);

    let pulls: Vec<_> = mock
        .calls()
        .into_iter()
        .filter(|c| c.invocation.subcommand() == Some("pull"))
        .collect();
    assert!(!pulls.is_empty());
    assert!(pulls.iter().all(|c| c.canceled));
    assert_eq!(mock.count("run"), 0);
}

const RUNNABLE_MANIFEST: &str = r#"
metadata:
  name: my-app
  type: api
  language: go
targets:
  - name: build/local
    stages:
      - name: build
        image: alpine:3.13
        commands: [make]
      - name: never
        image: alpine:3.13
        commands: [make]
"#;

#[tokio::test]
async fn test_run_treats_external_cancellation_as_success() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join(".infinity.yaml"), RUNNABLE_MANIFEST).unwrap();
    let config = RunnerConfig {
        build_directory: dir.path().to_path_buf(),
        ..RunnerConfig::default()
    };

    let mock = MockProcessRunner::with_handler(|invocation| match invocation.subcommand() {
        Some("run") => MockResponse::output("c1\n"),
        Some("logs") => MockResponse::ok().with_delay(Duration::from_secs(30)),
        _ => MockResponse::ok(),
    });
    let sink = LogSink::memory();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    runner(&mock, config, &sink)
        .run("build/local", &cancel)
        .await
        .unwrap();

    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(mock.count("run"), 1);
    assert_eq!(mock.calls_to("kill")[0].args, ["kill", "c1"]);
    assert_eq!(mock.calls_to("rm")[0].args, ["rm", "--volumes", "c1"]);
    assert!(sink
        .lines()
        .iter()
        .any(|l| l.starts_with("[build] Canceled in ")));
}

#[tokio::test]
async fn test_run_returns_real_failures() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join(".infinity.yaml"), RUNNABLE_MANIFEST).unwrap();
    let config = RunnerConfig {
        build_directory: dir.path().to_path_buf(),
        ..RunnerConfig::default()
    };
    let mock = MockProcessRunner::with_handler(|invocation| match invocation.subcommand() {
        Some("run") => MockResponse::output("c1\n"),
        Some("inspect") => MockResponse::output("4\n"),
        _ => MockResponse::ok(),
    });

    let err = runner(&mock, config, &LogSink::memory())
        .run("build/local", &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "stage build failed with exit code 4");
    assert_eq!(mock.count("run"), 1);
}
