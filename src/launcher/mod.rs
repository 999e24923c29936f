pub mod handle;
pub mod output;

use chrono::Utc;
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::oneshot;

use crate::error::{HarnessError, Result};
use crate::settings::{Environment, HarnessSettings, SandboxLayout};

pub use handle::{LaunchHandle, LaunchState};
pub use output::OutputTail;

// Shell exit codes for "found but not executable" and "not found".
const SHELL_CANNOT_EXECUTE: i32 = 126;
const SHELL_COMMAND_NOT_FOUND: i32 = 127;
const MIN_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);
// Output lines quoted in a spawn failure.
const FAILURE_CONTEXT_LINES: usize = 5;

enum WaitOutcome {
    Ready,
    TimedOut,
    Failed(ExitStatus),
}

/// A fully rendered launch request.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub container_name: String,
    pub command: String,
    pub ready_marker: String,
    pub startup_timeout: Duration,
}

/// Starts environments from shell commands and tears them down by name.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    layout: SandboxLayout,
    container_runtime: String,
    progress_interval: Duration,
    echo_output: bool,
}

impl ProcessLauncher {
    pub fn new(layout: SandboxLayout) -> Self {
        Self {
            layout,
            container_runtime: "docker".to_string(),
            progress_interval: Duration::from_secs(2),
            echo_output: true,
        }
    }

    pub fn from_settings(settings: &HarnessSettings) -> Self {
        Self {
            layout: settings.layout(),
            container_runtime: settings.container_runtime.clone(),
            progress_interval: settings.progress_interval(),
            echo_output: settings.echo_output,
        }
    }

    pub fn with_container_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.container_runtime = runtime.into();
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_echo_output(mut self, echo: bool) -> Self {
        self.echo_output = echo;
        self
    }

    pub fn layout(&self) -> &SandboxLayout {
        &self.layout
    }

    /// Bring up `env`. External environments are left alone and yield `None`.
    pub async fn start(&self, env: &Environment) -> Result<Option<LaunchHandle>> {
        match env.launch_spec(&self.layout) {
            Some(spec) => self.launch(&spec).await.map(Some),
            None => {
                log::info!("'{}' is an external environment, not launching", env.name);
                Ok(None)
            }
        }
    }

    pub async fn cleanup(&self, env: &Environment) {
        if env.is_managed() {
            self.cleanup_container(&env.name).await;
        } else {
            log::info!("'{}' is an external environment, nothing to clean up", env.name);
        }
    }

    pub async fn stop(&self, env: &Environment) {
        if env.is_managed() {
            self.stop_container(&env.name).await;
        } else {
            log::info!("'{}' is an external environment, not stopping", env.name);
        }
    }

    /// Clean up any previous instance of `spec.container_name`, run the command
    /// and wait until its output contains the readiness marker.
    pub async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchHandle> {
        let name = spec.container_name.as_str();
        if spec.ready_marker.is_empty() {
            return Err(HarnessError::InvalidConfig(format!(
                "{name}: ready marker must not be empty"
            )));
        }
        let mut state = LaunchState::Created;

        self.cleanup_container(name).await;
        if let Err(e) = self.layout.create(name) {
            log::warn!("Failed to create state directories for '{name}': {e}");
        }

        log::info!("Starting '{name}': {}", spec.command);
        let mut command = std::process::Command::new("sh");
        command
            .arg("-c")
            .arg(&spec.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so termination reaches everything the shell starts.
        #[cfg(unix)]
        command.process_group(0);
        let mut command = Command::from(command);
        command.kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                transition(name, &mut state, LaunchState::SpawnFailed);
                return Err(HarnessError::Spawn {
                    container: name.to_string(),
                    source,
                });
            }
        };
        transition(name, &mut state, LaunchState::Starting);

        let started_at = Utc::now();
        let start = Instant::now();

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            handle::terminate_child(name, &mut child).await;
            transition(name, &mut state, LaunchState::SpawnFailed);
            return Err(HarnessError::Spawn {
                container: name.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "output was not captured",
                ),
            });
        };
        let tail = OutputTail::default();
        let (ready_tx, mut ready_rx) = oneshot::channel();
        let reader = output::spawn_output_reader(
            name.to_string(),
            stdout,
            stderr,
            spec.ready_marker.clone(),
            self.echo_output,
            tail.clone(),
            ready_tx,
        );

        let deadline = tokio::time::sleep(spec.startup_timeout);
        tokio::pin!(deadline);
        let mut progress =
            tokio::time::interval(self.progress_interval.max(MIN_PROGRESS_INTERVAL));
        progress.tick().await;

        let mut output_closed = false;
        let mut exited = false;
        let mut exit_status: Option<ExitStatus> = None;

        // Without the marker, a clean exit waits for the deadline; a failed one ends the wait.
        let outcome = loop {
            if output_closed {
                if let Some(status) = exit_status.filter(|status| !status.success()) {
                    break WaitOutcome::Failed(status);
                }
            }

            tokio::select! {
                biased;

                received = &mut ready_rx, if !output_closed => {
                    match received {
                        Ok(()) => break WaitOutcome::Ready,
                        Err(_) => {
                            log::debug!("Output of '{name}' ended before the readiness marker");
                            output_closed = true;
                        }
                    }
                }

                status = child.wait(), if !exited => {
                    exited = true;
                    match status {
                        Ok(status) => {
                            log::info!("Process for '{name}' exited with {status}");
                            exit_status = Some(status);
                        }
                        Err(e) => log::warn!("Failed to wait for process of '{name}': {e}"),
                    }
                }

                _ = &mut deadline => break WaitOutcome::TimedOut,

                _ = progress.tick() => {
                    log::info!(
                        "Waiting for '{name}' to be ready... {:.2}s elapsed",
                        start.elapsed().as_secs_f64()
                    );
                }
            }
        };

        match outcome {
            WaitOutcome::Ready => {
                transition(name, &mut state, LaunchState::Ready);
                log::info!(
                    "Ready message detected for '{name}' after {:.2}s",
                    start.elapsed().as_secs_f64()
                );
                Ok(LaunchHandle::new(
                    name.to_string(),
                    child,
                    reader,
                    tail,
                    started_at,
                    start.elapsed(),
                ))
            }
            WaitOutcome::TimedOut => {
                transition(name, &mut state, LaunchState::TimedOut);
                log::warn!(
                    "'{name}' did not become ready within {:?}, terminating",
                    spec.startup_timeout
                );
                handle::terminate_child(name, &mut child).await;
                reader.abort();
                self.cleanup_container(name).await;
                Err(HarnessError::Timeout {
                    container: name.to_string(),
                    timeout: spec.startup_timeout,
                })
            }
            WaitOutcome::Failed(status) => {
                transition(name, &mut state, LaunchState::SpawnFailed);
                log::error!("Command for '{name}' failed with {status} before becoming ready");
                reader.abort();
                handle::terminate_child(name, &mut child).await;
                self.layout.remove(name);
                Err(HarnessError::Spawn {
                    container: name.to_string(),
                    source: shell_failure(status, &tail),
                })
            }
        }
    }

    /// Best-effort stop and removal of any container named `name`, then
    /// removal of its state directories. Never fails.
    pub async fn cleanup_container(&self, name: &str) {
        log::info!("Cleaning up any existing container '{name}'...");
        self.run_runtime(&["stop", name]).await;
        self.run_runtime(&["rm", "-f", name]).await;

        log::info!(
            "Cleaning up directories: pg: {}, log: {}",
            self.layout.pg_dir(name).display(),
            self.layout.log_dir(name).display()
        );
        self.layout.remove(name);
    }

    /// Graceful stop of the container named `name`. Failures are logged only.
    pub async fn stop_container(&self, name: &str) {
        if self.run_runtime(&["stop", name]).await {
            log::info!("Container '{name}' stopped");
        } else {
            log::warn!("Container '{name}' could not be stopped");
        }
    }

    async fn run_runtime(&self, args: &[&str]) -> bool {
        let result = Command::new(&self.container_runtime)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match result {
            Ok(status) if status.success() => true,
            Ok(status) => {
                log::debug!(
                    "{} {} exited with {status}",
                    self.container_runtime,
                    args.join(" ")
                );
                false
            }
            Err(e) => {
                log::debug!(
                    "Could not run {} {}: {e}",
                    self.container_runtime,
                    args.join(" ")
                );
                false
            }
        }
    }
}

fn shell_failure(status: ExitStatus, tail: &OutputTail) -> std::io::Error {
    let kind = match status.code() {
        Some(SHELL_COMMAND_NOT_FOUND) => std::io::ErrorKind::NotFound,
        Some(SHELL_CANNOT_EXECUTE) => std::io::ErrorKind::PermissionDenied,
        _ => std::io::ErrorKind::Other,
    };

    let lines = tail.snapshot();
    let recent = &lines[lines.len().saturating_sub(FAILURE_CONTEXT_LINES)..];
    let message = if recent.is_empty() {
        format!("shell exited with {status} without output")
    } else {
        format!("shell exited with {status}: {}", recent.join(" | "))
    };
    std::io::Error::new(kind, message)
}

fn transition(name: &str, state: &mut LaunchState, next: LaunchState) {
    debug_assert!(
        state.can_transition_to(next),
        "invalid launch transition {state:?} -> {next:?}"
    );
    log::debug!("'{name}' launch state {state:?} -> {next:?}");
    *state = next;
}
