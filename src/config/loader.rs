//! Cloud-config loader
//!
//! Loads and merges cloud-configs from standard locations.

use super::{Config, merge};
use crate::{CloudInitError, state::CloudPaths};
use std::path::Path;
use tokio::fs;
use tracing::{debug, info, warn};

/// Load and merge the system config (/etc/cloud/cloud.cfg and drop-ins)
pub async fn load_merged_config(paths: &CloudPaths) -> Result<Config, CloudInitError> {
    let mut configs = Vec::new();

    if let Some(config) = load_config_file(paths.main_config()).await? {
        debug!("Loaded base config from {}", paths.main_config().display());
        configs.push(config);
    }

    configs.extend(load_dropin_configs(paths.config_d()).await?);

    Ok(merge::merge_all_configs(&configs))
}

/// Load the config seen by modules: system config plus the instance's
/// cloud-config gathered from user-data
pub async fn load_instance_config(
    paths: &CloudPaths,
    instance_id: &str,
) -> Result<Config, CloudInitError> {
    let system = load_merged_config(paths).await?;

    match load_config_file(paths.cloud_config(instance_id)).await? {
        Some(user) => {
            debug!("Merging instance cloud-config for {}", instance_id);
            Ok(merge::merge_configs(&system, &user))
        }
        None => Ok(system),
    }
}

/// Load cloud-config from a single file
///
/// Unparseable files are logged and skipped.
pub async fn load_config_file(path: impl AsRef<Path>) -> Result<Option<Config>, CloudInitError> {
    let path = path.as_ref();

    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(path).await?;

    match Config::from_yaml(&content) {
        Ok(config) => Ok(Some(config)),
        Err(e) => {
            warn!("Failed to parse {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

/// Load all drop-in configs from a directory (sorted alphabetically)
async fn load_dropin_configs(dir: impl AsRef<Path>) -> Result<Vec<Config>, CloudInitError> {
    let dir = dir.as_ref();

    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    let mut read_dir = fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "cfg") {
            entries.push(path);
        }
    }
    entries.sort();

    let mut configs = Vec::new();
    for path in entries {
        if let Some(config) = load_config_file(&path).await? {
            debug!("Loaded drop-in config from {}", path.display());
            configs.push(config);
        }
    }

    info!("Loaded {} drop-in configs", configs.len());
    Ok(configs)
}
