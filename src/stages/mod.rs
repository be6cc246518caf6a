//! Boot stages
//!
//! A [`Pipeline`] owns the registries for one invocation and drives:
//! 1. init (local or network): find a datasource, record the instance,
//!    consume user-data
//! 2. modules (init, config or final): run a configured module list
//!
//! Each stage is a separate process invocation; state between them lives on
//! disk under [`CloudPaths`].

pub mod init;
pub mod modules;

pub use init::InitReport;

use crate::CloudInitError;
use crate::datasources::DatasourceRegistry;
use crate::handlers::HandlerCatalog;
use crate::modules::ModuleRegistry;
use crate::state::{CloudInitStatus, CloudPaths, InstanceState};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Which module list a `modules` run executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleMode {
    Init,
    Config,
    Final,
}

impl ModuleMode {
    /// Config key holding this mode's module list
    pub fn section(&self) -> &'static str {
        match self {
            Self::Init => "cloud_init_modules",
            Self::Config => "cloud_config_modules",
            Self::Final => "cloud_final_modules",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Config => "config",
            Self::Final => "final",
        }
    }
}

impl fmt::Display for ModuleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleMode {
    type Err = CloudInitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "init" => Ok(Self::Init),
            "config" => Ok(Self::Config),
            "final" => Ok(Self::Final),
            other => Err(CloudInitError::Config(format!("Unknown module mode: {}", other))),
        }
    }
}

/// Registries and paths for one pipeline invocation
#[derive(Debug)]
pub struct Pipeline {
    paths: CloudPaths,
    datasources: DatasourceRegistry,
    catalog: HandlerCatalog,
    modules: ModuleRegistry,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(CloudPaths::new())
    }
}

impl Pipeline {
    /// Pipeline with every built-in datasource, handler and module
    pub fn new(paths: CloudPaths) -> Self {
        Self {
            paths,
            datasources: DatasourceRegistry::builtin(),
            catalog: HandlerCatalog::builtin(),
            modules: ModuleRegistry::builtin(),
        }
    }

    pub fn with_datasources(mut self, datasources: DatasourceRegistry) -> Self {
        self.datasources = datasources;
        self
    }

    pub fn with_catalog(mut self, catalog: HandlerCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_modules(mut self, modules: ModuleRegistry) -> Self {
        self.modules = modules;
        self
    }

    pub fn paths(&self) -> &CloudPaths {
        &self.paths
    }

    /// Record the outcome of a stage in the status file
    async fn record_status(
        &self,
        state: &InstanceState,
        stage: &str,
        datasource: Option<String>,
        errors: Vec<String>,
        status: &str,
    ) {
        let mut current = state.read_status().await.unwrap_or_default();
        // a new boot starts with the local stage
        if stage.starts_with(&crate::Stage::Local.to_string()) {
            current.errors.clear();
        }
        current.stage = Some(stage.to_string());
        current.status = status.to_string();
        current.boot_finished = state.is_boot_finished();
        if datasource.is_some() {
            current.datasource = datasource;
        }
        current.errors.extend(errors);

        if let Err(e) = state.update_status(&current).await {
            warn!("Failed to write status: {}", e);
        }
    }

    /// Current status as recorded on disk
    pub async fn status(&self) -> Result<CloudInitStatus, CloudInitError> {
        InstanceState::with_paths(self.paths.clone()).read_status().await
    }

    /// Remove instance state; per-once markers survive
    pub async fn clean(&self, include_logs: bool) -> Result<(), CloudInitError> {
        InstanceState::with_paths(self.paths.clone()).clean(include_logs).await
    }
}
