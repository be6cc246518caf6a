//! Standard cloud-init paths
//!
//! Defines the directory structure used for instance state, the frequency
//! ledger and the files written by user-data handlers.

use std::path::{Path, PathBuf};

/// Base directory for cloud-init state
pub const CLOUD_DIR: &str = "/var/lib/cloud";

/// Cloud configuration directory
pub const CONFIG_DIR: &str = "/etc/cloud";

/// Standard cloud-init paths
#[derive(Debug, Clone)]
pub struct CloudPaths {
    /// Base cloud directory (default: /var/lib/cloud)
    pub base: PathBuf,
    /// Config directory (default: /etc/cloud)
    pub config: PathBuf,
}

impl Default for CloudPaths {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudPaths {
    /// Create with default paths
    pub fn new() -> Self {
        Self {
            base: PathBuf::from(CLOUD_DIR),
            config: PathBuf::from(CONFIG_DIR),
        }
    }

    /// Create with custom base directory (useful for testing)
    pub fn with_base(base: impl AsRef<Path>) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
            config: PathBuf::from(CONFIG_DIR),
        }
    }

    /// Create with custom base and config directories
    pub fn with_dirs(base: impl AsRef<Path>, config: impl AsRef<Path>) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
            config: config.as_ref().to_path_buf(),
        }
    }

    // ==================== Base Directories ====================

    /// /var/lib/cloud/data - Cached data directory
    pub fn data_dir(&self) -> PathBuf {
        self.base.join("data")
    }

    /// /var/lib/cloud/instances - All instances directory
    pub fn instances_dir(&self) -> PathBuf {
        self.base.join("instances")
    }

    /// /var/lib/cloud/instance - Symlink to current instance
    pub fn instance_link(&self) -> PathBuf {
        self.base.join("instance")
    }

    /// /var/lib/cloud/seed - NoCloud seed directory
    pub fn seed_dir(&self) -> PathBuf {
        self.base.join("seed")
    }

    /// /var/lib/cloud/sem - Ledger markers that outlive instance changes
    pub fn once_sem_dir(&self) -> PathBuf {
        self.base.join("sem")
    }

    /// /var/lib/cloud/handlers - Part-handler manifests loaded on every pass
    pub fn handlers_dir(&self) -> PathBuf {
        self.base.join("handlers")
    }

    // ==================== Instance-specific Paths ====================

    /// /var/lib/cloud/instances/<id> - Instance directory
    pub fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.instances_dir().join(instance_id)
    }

    /// /var/lib/cloud/instances/<id>/sem - Per-instance ledger markers
    pub fn sem_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("sem")
    }

    /// /var/lib/cloud/instances/<id>/handlers - Part-handlers found in user-data
    pub fn instance_handlers_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("handlers")
    }

    /// /var/lib/cloud/instances/<id>/scripts - Scripts extracted from user-data
    pub fn scripts_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("scripts")
    }

    /// /var/lib/cloud/instances/<id>/boothooks - Boot hooks extracted from user-data
    pub fn boothooks_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("boothooks")
    }

    /// /var/lib/cloud/instances/<id>/boot-finished - Boot completion marker
    pub fn boot_finished(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("boot-finished")
    }

    /// /var/lib/cloud/instances/<id>/cloud-config.txt - Merged cloud-config
    pub fn cloud_config(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("cloud-config.txt")
    }

    /// /var/lib/cloud/instances/<id>/user-data.txt - Raw user-data
    pub fn user_data(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("user-data.txt")
    }

    /// /var/lib/cloud/instances/<id>/metadata.json - Metadata bundle of the active datasource
    pub fn metadata_file(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("metadata.json")
    }

    /// /var/lib/cloud/instances/<id>/datasource - Datasource identifier
    pub fn datasource_file(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("datasource")
    }

    // ==================== Config Paths ====================

    /// /etc/cloud/cloud.cfg - Main config file
    pub fn main_config(&self) -> PathBuf {
        self.config.join("cloud.cfg")
    }

    /// /etc/cloud/cloud.cfg.d - Config drop-in directory
    pub fn config_d(&self) -> PathBuf {
        self.config.join("cloud.cfg.d")
    }

    // ==================== Data Paths ====================

    /// /var/lib/cloud/data/instance-id - Cached instance ID
    pub fn cached_instance_id(&self) -> PathBuf {
        self.data_dir().join("instance-id")
    }

    /// /var/lib/cloud/data/previous-instance-id - Previous instance ID
    pub fn previous_instance_id(&self) -> PathBuf {
        self.data_dir().join("previous-instance-id")
    }

    /// /var/lib/cloud/data/urlcache - Cache for #include-once downloads
    pub fn url_cache_dir(&self) -> PathBuf {
        self.data_dir().join("urlcache")
    }

    /// /var/lib/cloud/data/status.json - Current status
    pub fn status_file(&self) -> PathBuf {
        self.data_dir().join("status.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        let paths = CloudPaths::new();
        assert_eq!(paths.base, PathBuf::from("/var/lib/cloud"));
        assert_eq!(paths.config, PathBuf::from("/etc/cloud"));
    }

    #[test]
    fn test_custom_base() {
        let paths = CloudPaths::with_base("/tmp/cloud");
        assert_eq!(paths.data_dir(), PathBuf::from("/tmp/cloud/data"));
        assert_eq!(paths.once_sem_dir(), PathBuf::from("/tmp/cloud/sem"));
        assert_eq!(paths.handlers_dir(), PathBuf::from("/tmp/cloud/handlers"));
    }

    #[test]
    fn test_instance_paths() {
        let paths = CloudPaths::new();
        let id = "i-1234567890abcdef0";

        assert_eq!(
            paths.sem_dir(id),
            PathBuf::from("/var/lib/cloud/instances/i-1234567890abcdef0/sem")
        );
        assert_eq!(
            paths.instance_handlers_dir(id),
            PathBuf::from("/var/lib/cloud/instances/i-1234567890abcdef0/handlers")
        );
        assert_eq!(
            paths.scripts_dir(id),
            PathBuf::from("/var/lib/cloud/instances/i-1234567890abcdef0/scripts")
        );
    }

    #[test]
    fn test_config_paths() {
        let paths = CloudPaths::new();
        assert_eq!(paths.main_config(), PathBuf::from("/etc/cloud/cloud.cfg"));
        assert_eq!(paths.config_d(), PathBuf::from("/etc/cloud/cloud.cfg.d"));
    }
}
