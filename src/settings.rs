use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HarnessError, Result};
use crate::launcher::LaunchSpec;

pub const DEFAULT_CONFIG_PATH: &str = "config/environments.toml";
pub const ENV_PREFIX: &str = "SANDBOX_HARNESS";

const DEFAULT_API_PORT: u16 = 9859;
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 120;
const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 2;
const DEFAULT_POLL_MAX_RETRIES: u32 = 10;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_CONTAINER_RUNTIME: &str = "docker";
const SANDBOX_DIR_NAME: &str = "waii-sandbox-test-integ";

// Printed by the sandbox image itself; must match byte for byte.
const SANDBOX_READY_MESSAGE: &str =
    "Waii is ready! Please visit http://localhost:3000 to start using it!";

const PORT_PLACEHOLDER: &str = "{{port}}";
const NAME_PLACEHOLDER: &str = "{{container_name}}";
const PG_DIR_PLACEHOLDER: &str = "{{pg_dir_container_name}}";
const LOG_DIR_PLACEHOLDER: &str = "{{log_dir_container_name}}";

/// One launchable environment as written in the settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvironmentConfig {
    /// A container the harness starts, watches and tears down.
    Managed(ManagedEnvironment),
    /// An instance somebody else is already running; never started or stopped.
    External(ExternalEnvironment),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedEnvironment {
    pub run_command: String,
    pub ready_message: String,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default)]
    pub api_port: Option<u16>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalEnvironment {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_startup_timeout_secs() -> u64 {
    DEFAULT_STARTUP_TIMEOUT_SECS
}

impl ManagedEnvironment {
    pub fn api_port(&self) -> u16 {
        self.api_port.unwrap_or(DEFAULT_API_PORT)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Substitute every placeholder of the command template for `name`.
    pub fn render_command(&self, name: &str, layout: &SandboxLayout) -> String {
        self.run_command
            .replace(PG_DIR_PLACEHOLDER, &layout.pg_dir(name).to_string_lossy())
            .replace(LOG_DIR_PLACEHOLDER, &layout.log_dir(name).to_string_lossy())
            .replace(PORT_PLACEHOLDER, &self.api_port().to_string())
            .replace(NAME_PLACEHOLDER, name)
    }

    pub fn render_base_url(&self) -> Option<String> {
        self.base_url
            .as_ref()
            .map(|template| template.replace(PORT_PLACEHOLDER, &self.api_port().to_string()))
    }
}

/// A resolved environment: the settings entry together with its key.
#[derive(Debug, Clone, PartialEq)]
pub struct Environment {
    pub name: String,
    pub config: EnvironmentConfig,
}

impl Environment {
    pub fn new(name: impl Into<String>, config: EnvironmentConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn is_managed(&self) -> bool {
        matches!(self.config, EnvironmentConfig::Managed(_))
    }

    pub fn base_url(&self) -> Option<String> {
        match &self.config {
            EnvironmentConfig::Managed(managed) => managed.render_base_url(),
            EnvironmentConfig::External(external) => Some(external.base_url.clone()),
        }
    }

    pub fn api_key(&self) -> Option<&str> {
        match &self.config {
            EnvironmentConfig::Managed(managed) => managed.api_key.as_deref(),
            EnvironmentConfig::External(external) => external.api_key.as_deref(),
        }
    }

    /// The concrete launch request, or `None` for external environments.
    pub fn launch_spec(&self, layout: &SandboxLayout) -> Option<LaunchSpec> {
        match &self.config {
            EnvironmentConfig::Managed(managed) => Some(LaunchSpec {
                container_name: self.name.clone(),
                command: managed.render_command(&self.name, layout),
                ready_marker: managed.ready_message.clone(),
                startup_timeout: managed.startup_timeout(),
            }),
            EnvironmentConfig::External(_) => None,
        }
    }
}

/// On-disk layout: `<root>/pg/<name>` for data mounts, `<root>/log/<name>` for logs.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxLayout {
    root: PathBuf,
}

impl SandboxLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pg_dir(&self, name: &str) -> PathBuf {
        self.root.join("pg").join(name)
    }

    pub fn log_dir(&self, name: &str) -> PathBuf {
        self.root.join("log").join(name)
    }

    pub fn state_dirs(&self, name: &str) -> [PathBuf; 2] {
        [self.pg_dir(name), self.log_dir(name)]
    }

    pub fn create(&self, name: &str) -> std::io::Result<()> {
        for dir in self.state_dirs(name) {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Remove both state directories. Missing directories are not an error;
    /// anything else is logged and swallowed.
    pub fn remove(&self, name: &str) {
        for dir in self.state_dirs(name) {
            match fs::remove_dir_all(&dir) {
                Ok(()) => log::info!("Removed state directory {}", dir.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("Failed to remove state directory {}: {e}", dir.display()),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub max_retries: u32,
    pub interval_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_POLL_MAX_RETRIES,
            interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

impl PollSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessSettings {
    pub sandbox_root: PathBuf,
    pub container_runtime: String,
    pub progress_interval_secs: u64,
    pub echo_output: bool,
    pub poll: PollSettings,
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            sandbox_root: default_sandbox_root(),
            container_runtime: DEFAULT_CONTAINER_RUNTIME.to_string(),
            progress_interval_secs: DEFAULT_PROGRESS_INTERVAL_SECS,
            echo_output: true,
            poll: PollSettings::default(),
            environments: default_environments(),
        }
    }
}

fn default_sandbox_root() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(SANDBOX_DIR_NAME)
}

impl HarnessSettings {
    /// Load from [`DEFAULT_CONFIG_PATH`] (if present) and `SANDBOX_HARNESS_*` variables.
    pub fn new() -> Result<Self> {
        Self::load(Path::new(DEFAULT_CONFIG_PATH))
    }

    /// Load settings: environment variables > config file > defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        Self::finish(builder.build()?.try_deserialize()?)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::from_str(contents, config::FileFormat::Toml))
            .build()?;
        Self::finish(cfg.try_deserialize()?)
    }

    fn finish(mut settings: HarnessSettings) -> Result<Self> {
        if settings.environments.is_empty() {
            log::info!("No environments configured, using built-in sandbox environments");
            settings.environments = default_environments();
        }
        settings.validate()?;
        log::debug!("Final settings: {settings:?}");
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.container_runtime.trim().is_empty() {
            return Err(invalid("container_runtime must not be empty"));
        }
        if self.progress_interval_secs == 0 {
            return Err(invalid("progress_interval_secs must be greater than 0"));
        }

        let mut ports: HashMap<u16, &str> = HashMap::new();
        for (name, env) in &self.environments {
            if name.trim().is_empty() {
                return Err(invalid("environment names must not be empty"));
            }
            match env {
                EnvironmentConfig::Managed(managed) => {
                    if managed.run_command.trim().is_empty() {
                        return Err(invalid(format!("{name}: run_command must not be empty")));
                    }
                    if managed.ready_message.is_empty() {
                        return Err(invalid(format!("{name}: ready_message must not be empty")));
                    }
                    if let Some(other) = ports.insert(managed.api_port(), name) {
                        return Err(invalid(format!(
                            "{name}: api_port {} already used by {other}",
                            managed.api_port()
                        )));
                    }
                }
                EnvironmentConfig::External(external) => {
                    if external.base_url.trim().is_empty() {
                        return Err(invalid(format!("{name}: base_url must not be empty")));
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve an environment by key. Unknown keys fail before anything is spawned.
    pub fn environment(&self, key: &str) -> Result<Environment> {
        self.environments
            .get(key)
            .map(|config| Environment::new(key, config.clone()))
            .ok_or_else(|| HarnessError::UnknownEnvironment(key.to_string()))
    }

    pub fn layout(&self) -> SandboxLayout {
        SandboxLayout::new(&self.sandbox_root)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

fn invalid(message: impl Into<String>) -> HarnessError {
    HarnessError::InvalidConfig(message.into())
}

fn sandbox_run_command(ui_port: u16) -> String {
    format!(
        "docker run --rm \
         --env OPENAI_API_KEY=$OPENAI_API_KEY \
         --env ENABLE_LOG_STREAMING_DOCKER=true \
         --env LOAD_SAMPLE_DB=false \
         -p {ui_port}:3456 \
         -p {PORT_PLACEHOLDER}:9859 \
         -v {PG_DIR_PLACEHOLDER}:/var/lib/postgresql/data:rw \
         -v {LOG_DIR_PLACEHOLDER}:/tmp/logs:rw \
         --name '{NAME_PLACEHOLDER}' \
         sandbox:latest --debug"
    )
}

/// The sandbox environments shipped with the harness. Each one reserves its own
/// UI port and API port so they can run side by side.
pub fn default_environments() -> BTreeMap<String, EnvironmentConfig> {
    let managed = [
        ("waii_default", 3000, 9859),
        ("waii_default_ex_1", 4000, 9860),
        ("waii_default_ex_2", 6000, 9861),
        ("waii_default_postgres", 6001, 9862),
    ];

    let mut environments: BTreeMap<String, EnvironmentConfig> = managed
        .into_iter()
        .map(|(name, ui_port, api_port)| {
            let env = EnvironmentConfig::Managed(ManagedEnvironment {
                run_command: sandbox_run_command(ui_port),
                ready_message: SANDBOX_READY_MESSAGE.to_string(),
                startup_timeout_secs: DEFAULT_STARTUP_TIMEOUT_SECS,
                api_port: Some(api_port),
                base_url: Some(format!("http://localhost:{PORT_PLACEHOLDER}/api/")),
                api_key: Some(String::new()),
            });
            (name.to_string(), env)
        })
        .collect();

    environments.insert(
        "waii_local".to_string(),
        EnvironmentConfig::External(ExternalEnvironment {
            base_url: format!("http://localhost:{DEFAULT_API_PORT}/api/"),
            api_key: Some(String::new()),
        }),
    );

    environments
}

/// Write the default settings to `path` as TOML.
pub fn create_sample_config(path: &Path) -> anyhow::Result<()> {
    let settings = HarnessSettings::default();
    let toml_content =
        toml::to_string_pretty(&settings).context("Failed to serialize default settings")?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    fs::write(path, toml_content)
        .with_context(|| format!("Failed to write sample config to: {}", path.display()))?;

    log::info!("Sample configuration written to: {}", path.display());
    Ok(())
}
