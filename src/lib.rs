//! cloud-init-engine library
//!
//! Boot-time provisioning core: datasource discovery, user-data
//! decomposition into handler-dispatched parts, and frequency-gated
//! execution of configuration modules.
//!
//! # Design Principles
//!
//! - **Safety First**: No unsafe code (`#![forbid(unsafe_code)]`)
//! - **Explicit registries**: datasources, part handlers and modules are
//!   compiled-in tables passed into the pipeline, never globals
//! - **Keep going**: only "no datasource found" aborts a run; every other
//!   failure is logged and collected

pub mod config;
pub mod datasources;
pub mod handlers;
pub mod modules;
pub mod ssh;
pub mod stages;
pub mod state;
pub mod userdata;
pub mod util;

mod error;

pub use error::CloudInitError;
pub use stages::Pipeline;

use datasources::MetadataBundle;
use state::CloudPaths;
use tracing::info;

/// Boot stages, in the order they run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Datasource discovery without network, user-data consumption
    Local,
    /// Datasource discovery with network, user-data consumption,
    /// `cloud_init_modules`
    Network,
    /// `cloud_config_modules`
    Config,
    /// `cloud_final_modules`, boot-finished marker
    Final,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Local => write!(f, "init-local"),
            Stage::Network => write!(f, "init"),
            Stage::Config => write!(f, "modules:config"),
            Stage::Final => write!(f, "modules:final"),
        }
    }
}

/// Run the specified stages in order
pub async fn run_stages(pipeline: &Pipeline, stages: &[Stage]) -> Result<(), CloudInitError> {
    for stage in stages {
        info!("Starting stage: {}", stage);
        match stage {
            Stage::Local => match pipeline.init(true).await {
                Ok(_) => {}
                // the network stage probes again
                Err(CloudInitError::NoDatasource { searched }) => {
                    info!("No local datasource found (searched: {:?})", searched);
                }
                Err(e) => return Err(e),
            },
            Stage::Network => {
                pipeline.init(false).await?;
            }
            Stage::Config => {
                pipeline.run_modules(stages::ModuleMode::Config).await?;
            }
            Stage::Final => {
                pipeline.run_modules(stages::ModuleMode::Final).await?;
            }
        }
        info!("Completed stage: {}", stage);
    }
    Ok(())
}

/// Everything a part handler or module sees about the running instance
#[derive(Debug, Clone)]
pub struct Cloud {
    paths: CloudPaths,
    instance_id: String,
    datasource: String,
    bundle: MetadataBundle,
}

impl Cloud {
    pub fn new(paths: CloudPaths, instance_id: &str, datasource: &str, bundle: MetadataBundle) -> Self {
        Self {
            paths,
            instance_id: instance_id.to_string(),
            datasource: datasource.to_string(),
            bundle,
        }
    }

    pub fn paths(&self) -> &CloudPaths {
        &self.paths
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Name of the datasource that claimed this instance
    pub fn datasource(&self) -> &str {
        &self.datasource
    }

    pub fn bundle(&self) -> &MetadataBundle {
        &self.bundle
    }

    pub fn hostname(&self, fqdn: bool) -> String {
        self.bundle.hostname(fqdn)
    }

    pub fn public_keys(&self) -> Vec<String> {
        self.bundle.public_keys()
    }
}
