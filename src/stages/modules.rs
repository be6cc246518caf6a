//! Module stages - run a configured module list for the cached instance

use super::{ModuleMode, Pipeline};
use crate::config::{Config, loader};
use crate::modules::{ModuleRunner, RunReport};
use crate::state::InstanceState;
use crate::{Cloud, CloudInitError};
use serde_yaml::Value;
use tracing::info;

impl Pipeline {
    /// Instance state, cloud view and merged config left by the init stage
    async fn load_instance(&self) -> Result<(InstanceState, Cloud, Config), CloudInitError> {
        let mut state = InstanceState::with_paths(self.paths.clone());
        let Some(instance_id) = state.load_cached_instance_id().await? else {
            return Err(CloudInitError::Config(
                "No cached instance id, run init first".to_string(),
            ));
        };

        let bundle = state.load_metadata().await?.unwrap_or_default();
        let datasource = state
            .load_datasource_name()
            .await?
            .unwrap_or_else(|| "unknown".to_string());
        let cloud = Cloud::new(self.paths.clone(), &instance_id, &datasource, bundle);
        let config = loader::load_instance_config(&self.paths, &instance_id).await?;
        Ok((state, cloud, config))
    }

    /// Run the module list for `mode`
    ///
    /// The final mode also writes the boot-finished marker.
    pub async fn run_modules(&self, mode: ModuleMode) -> Result<RunReport, CloudInitError> {
        let (state, cloud, config) = self.load_instance().await?;
        let Some(ledger) = state.ledger() else {
            return Err(CloudInitError::Config("instance id not set".to_string()));
        };

        let report = ModuleRunner::new(&self.modules, ledger, &cloud, &config)
            .run_section(mode.section())
            .await;
        info!(
            "modules:{} ran {} modules with {} failures",
            mode,
            report.ran.len(),
            report.failures.len()
        );

        let status = if mode == ModuleMode::Final {
            state.mark_boot_finished().await?;
            "done"
        } else {
            "running"
        };
        let errors = report
            .failures
            .iter()
            .map(|(name, e)| format!("{}: {}", name, e))
            .collect();
        self.record_status(
            &state,
            &format!("modules:{}", mode),
            Some(cloud.datasource().to_string()),
            errors,
            status,
        )
        .await;

        Ok(report)
    }

    /// Run one module by name
    pub async fn run_single(
        &self,
        name: &str,
        frequency: Option<&str>,
        args: Vec<Value>,
    ) -> Result<RunReport, CloudInitError> {
        let (state, cloud, config) = self.load_instance().await?;
        let Some(ledger) = state.ledger() else {
            return Err(CloudInitError::Config("instance id not set".to_string()));
        };
        Ok(ModuleRunner::new(&self.modules, ledger, &cloud, &config)
            .run_single(name, frequency, args)
            .await)
    }

    /// Look up a key in the cached instance data
    ///
    /// `instance-id`, `datasource`, `hostname` and `fqdn` are derived;
    /// anything else is read from the metadata bundle.
    pub async fn query(&self, key: &str) -> Result<Option<serde_json::Value>, CloudInitError> {
        let (_, cloud, _) = self.load_instance().await?;
        let value = match key {
            "instance-id" | "instance_id" => Some(cloud.instance_id().into()),
            "datasource" => Some(cloud.datasource().into()),
            "hostname" => Some(cloud.hostname(false).into()),
            "fqdn" => Some(cloud.hostname(true).into()),
            "public-keys" | "public_keys" => Some(cloud.public_keys().into()),
            other => cloud.bundle().get(other).cloned(),
        };
        Ok(value)
    }
}
