//! # Sandbox Fixture Integration Tests
//!
//! Bring environments up from a settings file the way a test class setup
//! would, then tear them down.

use std::fs;
use std::path::Path;

use sandbox_harness::{HarnessError, HarnessSettings, Sandbox};

use crate::integration::{recorded_calls, recording_runtime};

fn write_settings(dir: &Path, runtime: &str) -> HarnessSettings {
    let root = dir.join("sandbox");
    let path = dir.join("environments.toml");
    fs::write(
        &path,
        format!(
            r#"
sandbox_root = "{root}"
container_runtime = "{runtime}"
progress_interval_secs = 1
echo_output = false

[poll]
max_retries = 3
interval_secs = 1

[environments.it_managed]
kind = "managed"
run_command = "echo 'starting {{{{container_name}}}} on {{{{port}}}}'; echo 'Service is ready!'; sleep 30"
ready_message = "Service is ready!"
startup_timeout_secs = 10
api_port = 19871
base_url = "http://localhost:{{{{port}}}}/api/"
api_key = "it-key"

[environments.it_slow]
kind = "managed"
run_command = "sleep 30"
ready_message = "never printed"
startup_timeout_secs = 1
api_port = 19872

[environments.it_local]
kind = "external"
base_url = "http://localhost:9859/api/"
"#,
            root = root.display(),
        ),
    )
    .unwrap();

    HarnessSettings::load(&path).unwrap()
}

#[tokio::test]
async fn test_managed_sandbox_from_settings_file() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("runtime.log");
    let runtime = recording_runtime(dir.path(), &log);
    let settings = write_settings(dir.path(), &runtime.to_string_lossy());
    let layout = settings.layout();

    let mut sandbox = Sandbox::start(&settings, "it_managed").await.unwrap();

    let handle = sandbox.handle().unwrap();
    assert!(handle.is_ready());
    assert_eq!(
        handle.output().first().map(String::as_str),
        Some("starting it_managed on 19871")
    );
    assert_eq!(sandbox.poller().max_retries, 3);

    let endpoint = sandbox.endpoint().unwrap();
    assert_eq!(endpoint.base_url, "http://localhost:19871/api/");
    assert_eq!(endpoint.api_key, "it-key");
    assert!(layout.pg_dir("it_managed").is_dir());
    assert!(layout.log_dir("it_managed").is_dir());

    sandbox.shutdown().await;

    assert!(!layout.pg_dir("it_managed").exists());
    assert!(!layout.log_dir("it_managed").exists());
    assert_eq!(
        recorded_calls(&log),
        vec!["stop it_managed", "rm -f it_managed", "stop it_managed"]
    );
}

#[tokio::test]
async fn test_slow_environment_fails_setup() {
    let dir = tempfile::tempdir().unwrap();
    let settings = write_settings(dir.path(), "true");

    let err = Sandbox::start(&settings, "it_slow").await.err().unwrap();

    assert!(matches!(err, HarnessError::Timeout { ref container, .. } if container == "it_slow"));
    assert!(!settings.layout().pg_dir("it_slow").exists());
}

#[tokio::test]
async fn test_external_sandbox_launches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("runtime.log");
    let runtime = recording_runtime(dir.path(), &log);
    let settings = write_settings(dir.path(), &runtime.to_string_lossy());

    let mut sandbox = Sandbox::start(&settings, "it_local").await.unwrap();

    assert!(sandbox.handle().is_none());
    assert!(!sandbox.environment().is_managed());
    assert_eq!(
        sandbox.base_url().as_deref(),
        Some("http://localhost:9859/api/")
    );
    assert_eq!(sandbox.api_key(), "");

    sandbox.shutdown().await;
    assert!(recorded_calls(&log).is_empty());
    assert!(!settings.layout().root().exists());
}

#[tokio::test]
async fn test_unknown_environment_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let settings = write_settings(dir.path(), "true");

    let err = Sandbox::start(&settings, "it_missing").await.err().unwrap();

    assert!(matches!(err, HarnessError::UnknownEnvironment(ref key) if key == "it_missing"));
    assert!(!settings.layout().root().exists());
}
