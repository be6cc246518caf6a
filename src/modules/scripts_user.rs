//! Scripts-user module - run scripts saved from user-data

use super::Module;
use crate::config::{Config, RunCmd};
use crate::{Cloud, CloudInitError, util};
use async_trait::async_trait;
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

pub struct ScriptsUserModule;

#[async_trait]
impl Module for ScriptsUserModule {
    fn name(&self) -> &'static str {
        "scripts_user"
    }

    async fn handle(
        &self,
        name: &str,
        _config: &Config,
        cloud: &Cloud,
        _args: &[Value],
    ) -> Result<(), CloudInitError> {
        let dir = cloud.paths().scripts_dir(cloud.instance_id());
        run_parts(&dir, cloud.instance_id())
            .await
            .map(|_| ())
            .map_err(|e| CloudInitError::module(name, e.to_string()))
    }
}

/// Run every executable file in `dir`, sorted by name
///
/// All scripts run even if one fails; the failures are reported together.
pub async fn run_parts(dir: &Path, instance_id: &str) -> Result<usize, CloudInitError> {
    if !fs::try_exists(dir).await.unwrap_or(false) {
        debug!("No scripts directory at {}", dir.display());
        return Ok(0);
    }

    let mut scripts: Vec<PathBuf> = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && is_executable(&path).await {
            scripts.push(path);
        }
    }
    scripts.sort();

    let mut failed = Vec::new();
    for script in &scripts {
        info!("Running script {}", script.display());
        let cmd = RunCmd::Args(vec![script.to_string_lossy().into_owned()]);
        if let Err(e) = util::run_command(&cmd, &[("INSTANCE_ID", instance_id)]).await {
            warn!("Script {} failed: {}", script.display(), e);
            failed.push(script.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default());
        }
    }

    if failed.is_empty() {
        Ok(scripts.len())
    } else {
        Err(CloudInitError::Command(format!(
            "Ran {} scripts but {} failed: {}",
            scripts.len(),
            failed.len(),
            failed.join(", ")
        )))
    }
}

async fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path)
            .await
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        true
    }
}
