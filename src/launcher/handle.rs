use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::process::Child;
use tokio::task::JoinHandle;

use super::output::OutputTail;

const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Created,
    Starting,
    Ready,
    TimedOut,
    SpawnFailed,
    Stopped,
}

impl LaunchState {
    pub fn can_transition_to(self, next: LaunchState) -> bool {
        use LaunchState::*;
        matches!(
            (self, next),
            (Created, Starting)
                | (Created, SpawnFailed)
                | (Starting, Ready)
                | (Starting, TimedOut)
                | (Starting, SpawnFailed)
                | (Ready, Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LaunchState::TimedOut | LaunchState::SpawnFailed | LaunchState::Stopped
        )
    }
}

/// A process that reached its readiness marker. The caller owns it from here
/// on and is responsible for [`LaunchHandle::terminate`].
#[derive(Debug)]
pub struct LaunchHandle {
    container_name: String,
    child: Child,
    reader: Option<JoinHandle<()>>,
    output: OutputTail,
    state: LaunchState,
    started_at: DateTime<Utc>,
    ready_after: Duration,
}

impl LaunchHandle {
    pub(crate) fn new(
        container_name: String,
        child: Child,
        reader: JoinHandle<()>,
        output: OutputTail,
        started_at: DateTime<Utc>,
        ready_after: Duration,
    ) -> Self {
        Self {
            container_name,
            child,
            reader: Some(reader),
            output,
            state: LaunchState::Ready,
            started_at,
            ready_after,
        }
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn state(&self) -> LaunchState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == LaunchState::Ready
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Time between spawning the command and seeing the readiness marker.
    pub fn ready_after(&self) -> Duration {
        self.ready_after
    }

    /// OS process id of the shell, `None` once it has been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn output(&self) -> Vec<String> {
        self.output.snapshot()
    }

    /// Kill the process and everything it spawned, then wait for the output
    /// reader to finish. Calling this on a stopped handle does nothing.
    pub async fn terminate(&mut self) {
        if self.state == LaunchState::Stopped {
            return;
        }

        log::info!("Terminating process for '{}'", self.container_name);
        terminate_child(&self.container_name, &mut self.child).await;

        if let Some(reader) = self.reader.take() {
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
                log::warn!(
                    "Output of '{}' still open after {OUTPUT_DRAIN_TIMEOUT:?}",
                    self.container_name
                );
            }
        }

        self.state = LaunchState::Stopped;
    }
}

impl Drop for LaunchHandle {
    fn drop(&mut self) {
        if self.state != LaunchState::Stopped {
            log::info!("Launch handle for '{}' dropped, killing process", self.container_name);
            if let Some(pid) = self.child.id() {
                kill_process_group(pid);
            }
            let _ = self.child.start_kill();
        }
    }
}

/// Kill the process group led by `pid`. The command runs in its own group, so
/// this also takes down anything the shell started.
pub(crate) fn kill_process_group(pid: u32) {
    #[cfg(unix)]
    {
        let _ = std::process::Command::new("kill")
            .args(["-KILL", "--", &format!("-{pid}")])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
    }
    #[cfg(not(unix))]
    let _ = pid;
}

pub(crate) async fn terminate_child(container: &str, child: &mut Child) {
    if let Some(pid) = child.id() {
        kill_process_group(pid);
    }
    if let Err(e) = child.kill().await {
        log::debug!("Kill of '{container}' reported: {e}");
    }
}
