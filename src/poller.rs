use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{HarnessError, Result};
use crate::settings::PollSettings;

/// Status values keyed by connection or job identifier, as returned by one fetch.
/// A `None` value means the key exists but has no status yet.
pub type StatusSnapshot<V> = HashMap<String, Option<V>>;

/// Status value the product reports once a connector finished indexing.
pub const CONNECTOR_COMPLETED: &str = "completed";

/// Retry budget for [`wait_for_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPoller {
    pub max_retries: u32,
    pub interval: Duration,
}

impl StatusPoller {
    pub fn new(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries,
            interval,
        }
    }

    pub fn from_settings(settings: &PollSettings) -> Self {
        Self::new(settings.max_retries, settings.interval())
    }

    pub async fn wait_for<V, F, Fut>(&self, key: &str, terminal: &V, fetch: F) -> Result<bool>
    where
        V: PartialEq + Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<StatusSnapshot<V>>>,
    {
        wait_for_status(fetch, key, terminal, self.max_retries, self.interval).await
    }
}

impl Default for StatusPoller {
    fn default() -> Self {
        Self::from_settings(&PollSettings::default())
    }
}

/// Wait until `fetch` reports `terminal` for `key`.
///
/// The first fetch happens immediately and returns `Ok(true)` without sleeping
/// when the status is already terminal. After that, up to `max_retries`
/// re-fetches are made, each preceded by a sleep of `interval`.
///
/// Returns `Ok(false)` once the budget is spent. A key missing from the first
/// snapshot is [`HarnessError::KeyNotFound`]; fetch failures surface as
/// [`HarnessError::Fetch`].
pub async fn wait_for_status<V, F, Fut>(
    mut fetch: F,
    key: &str,
    terminal: &V,
    max_retries: u32,
    interval: Duration,
) -> Result<bool>
where
    V: PartialEq + Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<StatusSnapshot<V>>>,
{
    let mut snapshot = fetch().await.map_err(HarnessError::Fetch)?;
    if !snapshot.contains_key(key) {
        return Err(HarnessError::KeyNotFound(key.to_string()));
    }
    if is_terminal(&snapshot, key, terminal) {
        log::info!("Status for {key} is already {terminal:?}");
        return Ok(true);
    }

    for attempt in 1..=max_retries {
        log::info!(
            "Status for {key} is {:?}, retry {attempt}/{max_retries} in {interval:?}",
            snapshot.get(key)
        );
        tokio::time::sleep(interval).await;

        snapshot = fetch().await.map_err(HarnessError::Fetch)?;
        if !snapshot.contains_key(key) {
            log::warn!("Status for {key} disappeared from the snapshot");
        }
        if is_terminal(&snapshot, key, terminal) {
            log::info!("Status for {key} reached {terminal:?} after {attempt} retries");
            return Ok(true);
        }
    }

    log::warn!("Status for {key} did not reach {terminal:?} after {max_retries} retries");
    Ok(false)
}

fn is_terminal<V: PartialEq>(snapshot: &StatusSnapshot<V>, key: &str, terminal: &V) -> bool {
    matches!(snapshot.get(key), Some(Some(status)) if status == terminal)
}

/// Call `check` every `interval` until it yields a value or `timeout` passes.
///
/// Used for jobs that are tracked by wall clock instead of attempt count, such
/// as document ingestion.
pub async fn poll_until<T, F, Fut>(timeout: Duration, interval: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }

        if Instant::now() >= deadline {
            return None;
        }

        tokio::time::sleep(interval).await;
    }
}

/// Decode a connector status document into a snapshot.
///
/// Accepts `{"<key>": {"<field>": "..."}}`, `{"<key>": "..."}` and
/// `{"<key>": null}` entries. Anything other than a JSON object is rejected.
pub fn status_snapshot_from_json(
    value: &serde_json::Value,
    field: &str,
) -> anyhow::Result<StatusSnapshot<String>> {
    let entries = value
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("status document must be a JSON object, got {value}"))?;

    let snapshot = entries
        .iter()
        .map(|(key, entry)| {
            let status = match entry {
                serde_json::Value::String(status) => Some(status.clone()),
                serde_json::Value::Object(record) => record
                    .get(field)
                    .and_then(|status| status.as_str())
                    .map(str::to_string),
                _ => None,
            };
            (key.clone(), status)
        })
        .collect();

    Ok(snapshot)
}
