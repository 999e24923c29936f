//! Integration-test harness for the sandbox service.
//!
//! [`launcher`] brings containerized environments up from shell commands and
//! waits for their readiness message; [`poller`] waits for asynchronous backend
//! work (connector indexing, document ingestion) to reach a terminal status.
//! [`fixture::Sandbox`] ties both to the named environments in [`settings`].

pub mod error;
pub mod fixture;
pub mod launcher;
pub mod logging;
pub mod poller;
pub mod settings;

pub use error::{HarnessError, Result};
pub use fixture::{ClientEndpoint, Sandbox};
pub use launcher::{LaunchHandle, LaunchSpec, LaunchState, ProcessLauncher};
pub use poller::{poll_until, wait_for_status, StatusPoller, StatusSnapshot};
pub use settings::{Environment, EnvironmentConfig, HarnessSettings, SandboxLayout};
