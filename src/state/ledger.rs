//! Frequency ledger
//!
//! Persistent record of which named actions have already completed, used to
//! decide whether an action may run again:
//! - always: run on every pass, nothing is recorded
//! - once-per-instance: run once per instance ID, re-run when the ID changes
//! - once: run at most one time ever, even across instance changes
//!
//! Per-instance markers live under the instance's `sem` directory, so a new
//! instance ID naturally starts with an empty set of markers. Per-once markers
//! live in the cloud-wide `sem` directory with a `.once` suffix.

use crate::CloudInitError;
use crate::state::CloudPaths;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;
use tracing::{debug, info, warn};

/// How often a named action is permitted to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frequency {
    /// Run on every pass (no marker)
    #[serde(rename = "always")]
    Always,
    /// Run once per instance ID
    #[serde(rename = "once-per-instance", alias = "per-instance", alias = "instance")]
    PerInstance,
    /// Run once ever (even across instance changes)
    #[serde(rename = "once", alias = "per-once")]
    PerOnce,
}

impl Frequency {
    /// Parse a frequency name, accepting the short and long spellings
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "always" => Some(Self::Always),
            "once-per-instance" | "per-instance" | "instance" => Some(Self::PerInstance),
            "once" | "per-once" => Some(Self::PerOnce),
            _ => None,
        }
    }

    /// Canonical name of this frequency
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::PerInstance => "once-per-instance",
            Self::PerOnce => "once",
        }
    }
}

impl FromStr for Frequency {
    type Err = CloudInitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| CloudInitError::UnknownFrequency(s.to_string()))
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome stored in a ledger marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Marker written before the action started
    Running,
    Success,
    Failure,
}

/// Completion marker persisted for a (name, frequency) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Marker {
    pub pid: u32,
    pub timestamp: u64,
    pub frequency: Frequency,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// Ledger of completed actions for one instance
#[derive(Debug, Clone)]
pub struct FrequencyLedger {
    /// Per-instance markers (`/var/lib/cloud/instances/<id>/sem`)
    instance_sem_dir: PathBuf,
    /// Per-once markers (`/var/lib/cloud/sem`)
    once_sem_dir: PathBuf,
}

impl FrequencyLedger {
    /// Create a ledger from explicit marker directories
    pub fn new(instance_sem_dir: impl AsRef<Path>, once_sem_dir: impl AsRef<Path>) -> Self {
        Self {
            instance_sem_dir: instance_sem_dir.as_ref().to_path_buf(),
            once_sem_dir: once_sem_dir.as_ref().to_path_buf(),
        }
    }

    /// Create the ledger for the given instance ID
    pub fn for_instance(paths: &CloudPaths, instance_id: &str) -> Self {
        Self::new(paths.sem_dir(instance_id), paths.once_sem_dir())
    }

    /// Get the marker file path for a name, `None` for markerless frequencies
    fn marker_path(&self, name: &str, freq: Frequency) -> Option<PathBuf> {
        match freq {
            Frequency::Always => None,
            Frequency::PerInstance => Some(self.instance_sem_dir.join(name)),
            Frequency::PerOnce => Some(self.once_sem_dir.join(format!("{name}.once"))),
        }
    }

    /// Check whether a marker exists for the name
    pub async fn has_run(&self, name: &str, freq: Frequency) -> bool {
        match self.marker_path(name, freq) {
            Some(path) => fs::try_exists(&path).await.unwrap_or(false),
            None => false,
        }
    }

    /// Check if an action should run based on its marker
    pub async fn should_run(&self, name: &str, freq: Frequency) -> bool {
        let ran = self.has_run(name, freq).await;
        debug!(
            "Ledger check for {} ({}): {}",
            name,
            freq,
            if ran { "skip" } else { "run" }
        );
        !ran
    }

    /// Persist the outcome of an action
    pub async fn record_outcome(
        &self,
        name: &str,
        freq: Frequency,
        outcome: Outcome,
        result: Option<serde_json::Value>,
    ) -> Result<(), CloudInitError> {
        let Some(path) = self.marker_path(name, freq) else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let marker = Marker {
            pid: std::process::id(),
            timestamp: unix_timestamp(),
            frequency: freq,
            outcome,
            result,
        };
        fs::write(&path, serde_json::to_vec(&marker)?).await?;

        debug!("Recorded {:?} for {} at {}", outcome, name, path.display());
        Ok(())
    }

    /// Read the marker of a name, if any
    pub async fn marker(&self, name: &str, freq: Frequency) -> Result<Option<Marker>, CloudInitError> {
        let Some(path) = self.marker_path(name, freq) else {
            return Ok(None);
        };
        match fs::read(&path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Run an action at most as often as its frequency allows
    ///
    /// The marker is written before the action starts, so a second call for
    /// the same name within the pass sees it as already run. Returns
    /// `Ok(None)` when the action was skipped. With `clear_on_fail` a failed
    /// action leaves no marker and becomes eligible again.
    pub async fn run<F, Fut, T>(
        &self,
        name: &str,
        freq: Frequency,
        clear_on_fail: bool,
        action: F,
    ) -> Result<Option<T>, CloudInitError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CloudInitError>>,
    {
        if !self.should_run(name, freq).await {
            info!("{} already ran (freq={})", name, freq);
            return Ok(None);
        }

        self.record_outcome(name, freq, Outcome::Running, None).await?;

        match action().await {
            Ok(value) => {
                self.record_outcome(name, freq, Outcome::Success, None).await?;
                Ok(Some(value))
            }
            Err(e) => {
                let recorded = if clear_on_fail {
                    self.clear(name, freq).await
                } else {
                    let detail = serde_json::Value::String(e.to_string());
                    self.record_outcome(name, freq, Outcome::Failure, Some(detail))
                        .await
                };
                if let Err(ledger_err) = recorded {
                    warn!("Failed updating ledger for {}: {}", name, ledger_err);
                }
                Err(e)
            }
        }
    }

    /// Clear a marker (allow the action to run again)
    pub async fn clear(&self, name: &str, freq: Frequency) -> Result<(), CloudInitError> {
        if let Some(path) = self.marker_path(name, freq) {
            match fs::remove_file(&path).await {
                Ok(()) => debug!("Removed marker: {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Clear all per-instance markers
    pub async fn clear_all(&self) -> Result<(), CloudInitError> {
        if fs::try_exists(&self.instance_sem_dir).await.unwrap_or(false) {
            fs::remove_dir_all(&self.instance_sem_dir).await?;
            debug!("Cleared all markers in: {}", self.instance_sem_dir.display());
        }
        Ok(())
    }

    /// List names with a per-instance marker
    pub async fn list(&self) -> Result<Vec<String>, CloudInitError> {
        let mut names = Vec::new();

        if fs::try_exists(&self.instance_sem_dir).await.unwrap_or(false) {
            let mut entries = fs::read_dir(&self.instance_sem_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }
}

/// Seconds since the epoch
fn unix_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
