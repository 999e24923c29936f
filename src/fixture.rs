use crate::error::Result;
use crate::launcher::{LaunchHandle, ProcessLauncher};
use crate::poller::StatusPoller;
use crate::settings::{Environment, HarnessSettings};

/// Where a client should send its requests for a running sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEndpoint {
    pub base_url: String,
    pub api_key: String,
}

/// One environment brought up for a test class.
///
/// Built from an explicitly resolved [`Environment`] and handed to the test
/// body; nothing is kept in process-wide state. Call [`Sandbox::shutdown`] in
/// teardown. Dropping a sandbox that was not shut down kills its process.
pub struct Sandbox {
    environment: Environment,
    launcher: ProcessLauncher,
    poller: StatusPoller,
    handle: Option<LaunchHandle>,
    shut_down: bool,
}

impl Sandbox {
    /// Resolve `key` from `settings` and bring the environment up.
    ///
    /// Unknown keys fail before anything is spawned.
    pub async fn start(settings: &HarnessSettings, key: &str) -> Result<Self> {
        let environment = settings.environment(key)?;
        let launcher = ProcessLauncher::from_settings(settings);
        let poller = StatusPoller::from_settings(&settings.poll);
        Self::start_with(launcher, poller, environment).await
    }

    pub async fn start_with(
        launcher: ProcessLauncher,
        poller: StatusPoller,
        environment: Environment,
    ) -> Result<Self> {
        log::info!("Setting up sandbox '{}'", environment.name);
        let handle = launcher.start(&environment).await?;
        log::info!("Sandbox '{}' is up", environment.name);

        Ok(Self {
            environment,
            launcher,
            poller,
            handle,
            shut_down: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.environment.name
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn handle(&self) -> Option<&LaunchHandle> {
        self.handle.as_ref()
    }

    pub fn poller(&self) -> &StatusPoller {
        &self.poller
    }

    pub fn base_url(&self) -> Option<String> {
        self.environment.base_url()
    }

    pub fn api_key(&self) -> &str {
        self.environment.api_key().unwrap_or_default()
    }

    /// Endpoint for client initialisation, `None` when no base URL is configured.
    pub fn endpoint(&self) -> Option<ClientEndpoint> {
        self.base_url().map(|base_url| ClientEndpoint {
            base_url,
            api_key: self.api_key().to_string(),
        })
    }

    /// Stop the container by name, terminate the launched process and remove
    /// the state directories. Never fails, so teardown cannot mask a test result.
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        log::info!("Tearing down sandbox '{}'", self.environment.name);

        self.launcher.stop(&self.environment).await;
        if let Some(mut handle) = self.handle.take() {
            handle.terminate().await;
        }
        if self.environment.is_managed() {
            self.launcher.layout().remove(&self.environment.name);
        }

        self.shut_down = true;
        log::info!("Sandbox '{}' teardown complete", self.environment.name);
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if !self.shut_down && self.handle.is_some() {
            log::warn!(
                "Sandbox '{}' dropped without shutdown",
                self.environment.name
            );
        }
    }
}
