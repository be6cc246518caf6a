//! Instance state management
//!
//! Manages the /var/lib/cloud directory structure including:
//! - Instance tracking (current vs previous)
//! - The frequency ledger for action execution control
//! - Cached datasource data and status

pub mod ledger;
pub mod paths;

pub use ledger::{FrequencyLedger, Frequency, Marker, Outcome};
pub use paths::CloudPaths;

use crate::CloudInitError;
use crate::datasources::MetadataBundle;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

/// Instance state manager
#[derive(Debug)]
pub struct InstanceState {
    /// Cloud paths configuration
    paths: CloudPaths,
    /// Current instance ID (if known)
    instance_id: Option<String>,
    /// Frequency ledger (initialized when instance ID is set)
    ledger: Option<FrequencyLedger>,
}

/// Status of the provisioning run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudInitStatus {
    /// Current status (running, done, error)
    pub status: String,
    /// Whether boot is finished
    pub boot_finished: bool,
    /// Current stage being executed
    pub stage: Option<String>,
    /// Errors collected so far
    #[serde(default)]
    pub errors: Vec<String>,
    /// Datasource name
    pub datasource: Option<String>,
}

impl Default for CloudInitStatus {
    fn default() -> Self {
        Self {
            status: "not-started".to_string(),
            boot_finished: false,
            stage: None,
            errors: Vec::new(),
            datasource: None,
        }
    }
}

impl Default for InstanceState {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceState {
    /// Create a new instance state manager with default paths
    pub fn new() -> Self {
        Self::with_paths(CloudPaths::new())
    }

    /// Create with custom paths (useful for testing)
    pub fn with_paths(paths: CloudPaths) -> Self {
        Self {
            paths,
            instance_id: None,
            ledger: None,
        }
    }

    /// Get the paths configuration
    pub fn paths(&self) -> &CloudPaths {
        &self.paths
    }

    /// Get the current instance ID
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    /// Get the frequency ledger (requires instance ID to be set)
    pub fn ledger(&self) -> Option<&FrequencyLedger> {
        self.ledger.as_ref()
    }

    /// Initialize the directory structure
    pub async fn initialize(&self) -> Result<(), CloudInitError> {
        info!("Initializing cloud-init state directories");

        fs::create_dir_all(self.paths.data_dir()).await?;
        fs::create_dir_all(self.paths.instances_dir()).await?;
        fs::create_dir_all(self.paths.once_sem_dir()).await?;
        fs::create_dir_all(self.paths.handlers_dir()).await?;
        fs::create_dir_all(self.paths.seed_dir()).await?;

        debug!(
            "Created cloud-init directories under {}",
            self.paths.base.display()
        );
        Ok(())
    }

    /// Set the current instance ID and initialize instance-specific state
    ///
    /// Returns true when the ID differs from the cached one.
    pub async fn set_instance_id(&mut self, instance_id: &str) -> Result<bool, CloudInitError> {
        info!("Setting instance ID: {}", instance_id);

        let is_new_instance = self.check_instance_change(instance_id).await?;

        for dir in [
            self.paths.sem_dir(instance_id),
            self.paths.instance_handlers_dir(instance_id),
            self.paths.scripts_dir(instance_id),
            self.paths.boothooks_dir(instance_id),
        ] {
            fs::create_dir_all(&dir).await?;
        }

        self.update_instance_link(instance_id).await?;

        fs::create_dir_all(self.paths.data_dir()).await?;
        fs::write(self.paths.cached_instance_id(), instance_id).await?;

        self.ledger = Some(FrequencyLedger::for_instance(&self.paths, instance_id));
        self.instance_id = Some(instance_id.to_string());

        if is_new_instance {
            info!("New instance detected: {}", instance_id);
        }

        Ok(is_new_instance)
    }

    /// Check if the instance has changed
    async fn check_instance_change(&self, new_id: &str) -> Result<bool, CloudInitError> {
        let cached_path = self.paths.cached_instance_id();

        if cached_path.exists() {
            let cached_id = fs::read_to_string(&cached_path).await?;
            let cached_id = cached_id.trim();

            if cached_id != new_id {
                fs::write(self.paths.previous_instance_id(), cached_id).await?;
                return Ok(true);
            }
            return Ok(false);
        }

        Ok(true)
    }

    /// Update the /var/lib/cloud/instance symlink
    async fn update_instance_link(&self, instance_id: &str) -> Result<(), CloudInitError> {
        let link_path = self.paths.instance_link();
        let target = self.paths.instance_dir(instance_id);

        if link_path.exists() || link_path.is_symlink() {
            fs::remove_file(&link_path).await.ok();
        }

        #[cfg(unix)]
        {
            fs::symlink(&target, &link_path).await?;
            debug!(
                "Created instance symlink: {} -> {}",
                link_path.display(),
                target.display()
            );
        }

        #[cfg(not(unix))]
        {
            fs::write(&link_path, target.to_string_lossy().as_bytes()).await?;
        }

        Ok(())
    }

    /// Save raw user-data to the instance directory
    pub async fn save_userdata(&self, data: &[u8]) -> Result<(), CloudInitError> {
        if let Some(id) = &self.instance_id {
            let path = self.paths.user_data(id);
            fs::write(&path, data).await?;
            debug!("Saved user-data to {}", path.display());
        }
        Ok(())
    }

    /// Save the metadata bundle and datasource name of the active provider
    pub async fn save_datasource(
        &self,
        datasource: &str,
        bundle: &MetadataBundle,
    ) -> Result<(), CloudInitError> {
        if let Some(id) = &self.instance_id {
            fs::write(self.paths.datasource_file(id), datasource).await?;
            let json = serde_json::to_vec_pretty(bundle)?;
            fs::write(self.paths.metadata_file(id), json).await?;
            debug!("Saved datasource {} for {}", datasource, id);
        }
        Ok(())
    }

    /// Load the metadata bundle cached by the init stage
    pub async fn load_metadata(&self) -> Result<Option<MetadataBundle>, CloudInitError> {
        let Some(id) = &self.instance_id else {
            return Ok(None);
        };
        let path = self.paths.metadata_file(id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path).await?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// Load the cached datasource name
    pub async fn load_datasource_name(&self) -> Result<Option<String>, CloudInitError> {
        let Some(id) = &self.instance_id else {
            return Ok(None);
        };
        let path = self.paths.datasource_file(id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(&path).await?.trim().to_string()))
    }

    /// Mark boot as finished
    pub async fn mark_boot_finished(&self) -> Result<(), CloudInitError> {
        if let Some(id) = &self.instance_id {
            let path = self.paths.boot_finished(id);
            let timestamp = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            fs::write(&path, timestamp.to_string()).await?;
            info!("Boot finished marker created");
        }
        Ok(())
    }

    /// Check if boot has finished
    pub fn is_boot_finished(&self) -> bool {
        match &self.instance_id {
            Some(id) => self.paths.boot_finished(id).exists(),
            None => false,
        }
    }

    /// Update status
    pub async fn update_status(&self, status: &CloudInitStatus) -> Result<(), CloudInitError> {
        fs::create_dir_all(self.paths.data_dir()).await?;
        let json = serde_json::to_string_pretty(status)?;
        fs::write(self.paths.status_file(), json).await?;
        Ok(())
    }

    /// Read current status
    pub async fn read_status(&self) -> Result<CloudInitStatus, CloudInitError> {
        let path = self.paths.status_file();
        if path.exists() {
            let content = fs::read_to_string(&path).await?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(CloudInitStatus::default())
        }
    }

    /// Clean all instance state (for testing or reset)
    ///
    /// Per-once markers are kept; they must survive a reset.
    pub async fn clean(&self, include_logs: bool) -> Result<(), CloudInitError> {
        info!("Cleaning cloud-init state");

        if self.paths.instances_dir().exists() {
            fs::remove_dir_all(self.paths.instances_dir()).await?;
        }

        let link = self.paths.instance_link();
        if link.exists() || link.is_symlink() {
            fs::remove_file(&link).await.ok();
        }

        if self.paths.data_dir().exists() {
            fs::remove_dir_all(self.paths.data_dir()).await?;
        }

        if include_logs {
            for log in ["/var/log/cloud-init.log", "/var/log/cloud-init-output.log"] {
                fs::remove_file(log).await.ok();
            }
        }

        info!("Cloud-init state cleaned");
        Ok(())
    }

    /// Load cached instance ID from disk
    pub async fn load_cached_instance_id(&mut self) -> Result<Option<String>, CloudInitError> {
        let path = self.paths.cached_instance_id();
        if path.exists() {
            let id = fs::read_to_string(&path).await?;
            let id = id.trim().to_string();
            if !id.is_empty() {
                self.ledger = Some(FrequencyLedger::for_instance(&self.paths, &id));
                self.instance_id = Some(id.clone());
                return Ok(Some(id));
            }
        }
        Ok(None)
    }
}
