//! SSH key configuration module
//!
//! Installs keys from `ssh_authorized_keys` and the instance metadata for
//! the default user and for root. With `disable_root` (the default) root's
//! keys carry a forced command telling the caller which user to log in as.

use super::{Module, config_value};
use crate::config::Config;
use crate::ssh::{SshPaths, setup_user_keys};
use crate::{Cloud, CloudInitError};
use async_trait::async_trait;
use serde_yaml::Value;
use tracing::{debug, info};

const DISABLE_ROOT_OPTS: &str = "no-port-forwarding,no-agent-forwarding,no-X11-forwarding,\
command=\"echo 'Please login as the user \\\"$USER\\\" rather than the user \\\"root\\\".';echo;sleep 10\"";

#[derive(Debug, Clone, Default)]
pub struct SshModule {
    pub paths: SshPaths,
}

#[async_trait]
impl Module for SshModule {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn handle(
        &self,
        name: &str,
        config: &Config,
        cloud: &Cloud,
        _args: &[Value],
    ) -> Result<(), CloudInitError> {
        let mut keys: Vec<String> = config_value(config, name, "ssh_authorized_keys")?.unwrap_or_default();
        keys.extend(cloud.public_keys());
        keys.retain(|k| !k.trim().is_empty());

        if keys.is_empty() {
            debug!("No SSH keys to install");
            return Ok(());
        }

        let user = config.default_user();
        if let Some(user) = user {
            setup_user_keys(&self.paths, user, &keys, None).await?;
        }

        let disable_root = config.get_bool("disable_root").unwrap_or(true);
        let root_options = if disable_root {
            let opts = config.get_str("disable_root_opts").unwrap_or(DISABLE_ROOT_OPTS);
            Some(opts.replace("$USER", user.unwrap_or("NONE")))
        } else {
            None
        };

        info!("Installing {} keys for root (disable_root: {})", keys.len(), disable_root);
        setup_user_keys(&self.paths, "root", &keys, root_options.as_deref()).await?;
        Ok(())
    }
}
