//! Bootcmd module - execute early boot commands
//!
//! These commands run on every boot, very early in the boot process, with
//! `INSTANCE_ID` in their environment.

use super::{Module, config_value};
use crate::config::{Config, RunCmd};
use crate::state::Frequency;
use crate::{Cloud, CloudInitError, util};
use async_trait::async_trait;
use serde_yaml::Value;
use tracing::{debug, info};

pub struct BootcmdModule;

#[async_trait]
impl Module for BootcmdModule {
    fn name(&self) -> &'static str {
        "bootcmd"
    }

    fn frequency(&self) -> Frequency {
        Frequency::Always
    }

    async fn handle(
        &self,
        name: &str,
        config: &Config,
        cloud: &Cloud,
        _args: &[Value],
    ) -> Result<(), CloudInitError> {
        let Some(commands) = config_value::<Vec<RunCmd>>(config, name, "bootcmd")? else {
            debug!("Skipping module named {}, no 'bootcmd' key in configuration", name);
            return Ok(());
        };
        execute_bootcmd(&commands, cloud.instance_id()).await
    }
}

/// Execute bootcmd directives, stopping at the first failure
pub async fn execute_bootcmd(commands: &[RunCmd], instance_id: &str) -> Result<(), CloudInitError> {
    if commands.is_empty() {
        return Ok(());
    }

    info!("Executing {} bootcmd commands", commands.len());

    for (i, cmd) in commands.iter().enumerate() {
        debug!("Executing bootcmd {}/{}", i + 1, commands.len());
        util::run_command(cmd, &[("INSTANCE_ID", instance_id)])
            .await
            .map_err(|e| CloudInitError::module("bootcmd", e.to_string()))?;
    }

    Ok(())
}
