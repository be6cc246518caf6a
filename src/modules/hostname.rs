//! Hostname configuration module

use super::Module;
use crate::config::Config;
use crate::{Cloud, CloudInitError, util};
use async_trait::async_trait;
use serde_yaml::Value;
use std::path::PathBuf;
use tracing::{debug, info};

/// Sets the hostname from config (`fqdn`, `hostname`) or instance metadata
#[derive(Debug, Clone)]
pub struct SetHostnameModule {
    pub hostname_file: PathBuf,
    /// Also call `hostname` to apply the name immediately
    pub apply_live: bool,
}

impl Default for SetHostnameModule {
    fn default() -> Self {
        Self {
            hostname_file: PathBuf::from("/etc/hostname"),
            apply_live: true,
        }
    }
}

/// Hostname to apply: `fqdn` first, then `hostname`, then metadata
pub fn pick_hostname(config: &Config, cloud: &Cloud) -> String {
    config
        .get_str("fqdn")
        .or_else(|| config.get_str("hostname"))
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| cloud.hostname(false))
}

#[async_trait]
impl Module for SetHostnameModule {
    fn name(&self) -> &'static str {
        "set_hostname"
    }

    async fn handle(
        &self,
        name: &str,
        config: &Config,
        cloud: &Cloud,
        _args: &[Value],
    ) -> Result<(), CloudInitError> {
        if config.get_bool("preserve_hostname").unwrap_or(false) {
            debug!("Configuration option 'preserve_hostname' is set, not setting the hostname in module {}", name);
            return Ok(());
        }

        let hostname = pick_hostname(config, cloud);
        info!("Setting hostname to: {}", hostname);
        util::write_file(&self.hostname_file, format!("{}\n", hostname).as_bytes(), 0o644).await?;

        if self.apply_live {
            util::run_command(&crate::config::RunCmd::Args(vec!["hostname".into(), hostname]), &[])
                .await
                .map_err(|e| CloudInitError::module(name, format!("Failed to set hostname: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasources::MetadataBundle;
    use crate::state::CloudPaths;
    use tempfile::TempDir;

    fn cloud(temp: &TempDir) -> Cloud {
        let mut bundle = MetadataBundle::new();
        bundle.set("local-hostname", "meta-host.example.com");
        Cloud::new(CloudPaths::with_base(temp.path()), "i-1", "Mock", bundle)
    }

    #[test]
    fn test_pick_hostname_precedence() {
        let temp = TempDir::new().unwrap();
        let cloud = cloud(&temp);
        assert_eq!(pick_hostname(&Config::default(), &cloud), "meta-host");
        assert_eq!(pick_hostname(&Config::from_yaml("hostname: web1").unwrap(), &cloud), "web1");
        assert_eq!(
            pick_hostname(&Config::from_yaml("hostname: web1\nfqdn: web1.lan").unwrap(), &cloud),
            "web1.lan"
        );
    }

    #[tokio::test]
    async fn test_writes_hostname_file() {
        let temp = TempDir::new().unwrap();
        let module = SetHostnameModule {
            hostname_file: temp.path().join("hostname"),
            apply_live: false,
        };

        module
            .handle("set_hostname", &Config::from_yaml("hostname: box").unwrap(), &cloud(&temp), &[])
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(temp.path().join("hostname")).unwrap(), "box\n");

        let preserved = Config::from_yaml("hostname: other\npreserve_hostname: true").unwrap();
        module.handle("set_hostname", &preserved, &cloud(&temp), &[]).await.unwrap();
        assert_eq!(std::fs::read_to_string(temp.path().join("hostname")).unwrap(), "box\n");
    }
}
