//! # Launcher Life Cycle Integration Tests
//!
//! Exercise the launcher against real shell processes: readiness detection,
//! startup timeouts, termination of everything the command started, and the
//! cleanup calls issued to the container runtime.

use std::fs;
use std::time::{Duration, Instant};

use sandbox_harness::settings::{EnvironmentConfig, ExternalEnvironment};
use sandbox_harness::{Environment, HarnessError, LaunchState};

use crate::integration::{
    launch_spec, quiet_launcher, recorded_calls, recording_runtime, wait_for_exit,
};

fn read_pid(path: &std::path::Path) -> u32 {
    fs::read_to_string(path).unwrap().trim().parse().unwrap()
}

#[tokio::test]
async fn test_marker_before_timeout_is_ready() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = quiet_launcher(dir.path());
    let spec = launch_spec("sleep 1 && echo READY", "READY", Duration::from_secs(5));

    let started = Instant::now();
    let mut handle = launcher.launch(&spec).await.unwrap();

    assert!(handle.is_ready());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(handle.ready_after() >= Duration::from_millis(900));
    assert_eq!(handle.container_name(), spec.container_name);

    handle.terminate().await;
    assert_eq!(handle.state(), LaunchState::Stopped);
}

#[tokio::test]
async fn test_missing_marker_times_out_and_kills_process() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = quiet_launcher(dir.path());
    let pid_file = dir.path().join("sleep.pid");
    let spec = launch_spec(
        &format!("sleep 10 & echo $! > '{}'; wait", pid_file.display()),
        "READY",
        Duration::from_secs(2),
    );

    let started = Instant::now();
    let err = launcher.launch(&spec).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(
        matches!(err, HarnessError::Timeout { ref container, timeout }
            if container == &spec.container_name && timeout == Duration::from_secs(2)),
        "unexpected error: {err:?}"
    );
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(10));

    let sleep_pid = read_pid(&pid_file);
    assert!(
        wait_for_exit(sleep_pid, Duration::from_secs(3)).await,
        "sleep process {sleep_pid} survived the timeout"
    );
}

#[tokio::test]
async fn test_plain_sleep_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = quiet_launcher(dir.path());
    let spec = launch_spec("sleep 10", "READY", Duration::from_secs(2));

    let started = Instant::now();
    let err = launcher.launch(&spec).await.unwrap_err();

    assert!(matches!(err, HarnessError::Timeout { .. }));
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_output_order_is_preserved() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = quiet_launcher(dir.path());
    let spec = launch_spec(
        "for i in 1 2 3 4 5; do echo step $i; done; echo READY; echo serving; sleep 30",
        "READY",
        Duration::from_secs(10),
    );

    let mut handle = launcher.launch(&spec).await.unwrap();
    handle.terminate().await;

    assert_eq!(
        handle.output(),
        vec!["step 1", "step 2", "step 3", "step 4", "step 5", "READY", "serving"]
    );
}

#[tokio::test]
async fn test_terminate_kills_background_children() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = quiet_launcher(dir.path());
    let pid_file = dir.path().join("child.pid");
    let spec = launch_spec(
        &format!(
            "sleep 30 & echo $! > '{}'; echo READY; wait",
            pid_file.display()
        ),
        "READY",
        Duration::from_secs(10),
    );

    let mut handle = launcher.launch(&spec).await.unwrap();
    let child_pid = read_pid(&pid_file);

    handle.terminate().await;
    assert!(wait_for_exit(child_pid, Duration::from_secs(3)).await);

    // A second terminate is a no-op.
    handle.terminate().await;
    assert_eq!(handle.state(), LaunchState::Stopped);
}

#[tokio::test]
async fn test_dropping_handle_kills_process() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = quiet_launcher(dir.path());
    let spec = launch_spec("echo READY; sleep 30", "READY", Duration::from_secs(10));

    let handle = launcher.launch(&spec).await.unwrap();
    let pid = handle.pid().unwrap();
    drop(handle);

    assert!(wait_for_exit(pid, Duration::from_secs(3)).await);
}

#[tokio::test]
async fn test_launch_cleans_up_previous_instance_first() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("runtime.log");
    let runtime = recording_runtime(dir.path(), &log);
    let launcher = quiet_launcher(dir.path()).with_container_runtime(runtime.to_string_lossy());

    let stale = launcher.layout().pg_dir("stale_env").join("PG_VERSION");
    fs::create_dir_all(stale.parent().unwrap()).unwrap();
    fs::write(&stale, "16").unwrap();

    let mut spec = launch_spec("echo READY", "READY", Duration::from_secs(10));
    spec.container_name = "stale_env".to_string();

    let mut handle = launcher.launch(&spec).await.unwrap();
    handle.terminate().await;

    assert_eq!(recorded_calls(&log), vec!["stop stale_env", "rm -f stale_env"]);
    assert!(!stale.exists());
    assert!(launcher.layout().pg_dir("stale_env").is_dir());
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("runtime.log");
    let runtime = recording_runtime(dir.path(), &log);
    let launcher = quiet_launcher(dir.path()).with_container_runtime(runtime.to_string_lossy());

    launcher.cleanup_container("never_started").await;
    launcher.cleanup_container("never_started").await;

    assert_eq!(
        recorded_calls(&log),
        vec![
            "stop never_started",
            "rm -f never_started",
            "stop never_started",
            "rm -f never_started",
        ]
    );
}

#[tokio::test]
async fn test_external_environment_spawns_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("runtime.log");
    let runtime = recording_runtime(dir.path(), &log);
    let launcher = quiet_launcher(dir.path()).with_container_runtime(runtime.to_string_lossy());
    let env = Environment::new(
        "waii_local",
        EnvironmentConfig::External(ExternalEnvironment {
            base_url: "http://localhost:9859/api/".to_string(),
            api_key: None,
        }),
    );

    let started = Instant::now();
    assert!(launcher.start(&env).await.unwrap().is_none());
    launcher.cleanup(&env).await;
    launcher.stop(&env).await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(recorded_calls(&log).is_empty());
    assert!(!launcher.layout().pg_dir("waii_local").exists());
}
