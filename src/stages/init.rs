//! Init stage - find the datasource and consume user-data
//!
//! The local variant probes providers that need only the filesystem. A
//! provider it finds is cached, and when that provider is disconnected its
//! user-data is consumed right away. The network variant probes providers
//! needing filesystem and network, unless the local variant already
//! consumed data this boot, in which case the cached selection is reused.
//! The network variant then runs `cloud_init_modules`.

use super::{ModuleMode, Pipeline};
use crate::config::loader;
use crate::datasources::{DatasourceContext, Dependency, MetadataBundle, deps};
use crate::handlers::{self, HandlerRegistry, WalkReport};
use crate::modules::{ModuleRunner, RunReport};
use crate::state::{Frequency, InstanceState};
use crate::userdata::UserDataProcessor;
use crate::{Cloud, CloudInitError};
use tracing::{debug, info, warn};

const LOCAL_STAGE: &str = "init-local";
const NETWORK_STAGE: &str = "init";
/// Ledger entry for the per-instance user-data walk
const CONSUME_DATA: &str = "consume_data";
/// Recorded when the local stage left user-data for the network stage
const DEFERRED_STAGE: &str = "init-local-deferred";

/// What an init run did
#[derive(Debug)]
pub struct InitReport {
    pub datasource: String,
    pub instance_id: String,
    pub is_new_instance: bool,
    /// `None` when user-data was left for a later stage
    pub walk: Option<WalkReport>,
    /// `cloud_init_modules` results (network stage only)
    pub modules: Option<RunReport>,
}

impl Pipeline {
    /// Run the local or network init stage
    pub async fn init(&self, local: bool) -> Result<InitReport, CloudInitError> {
        let stage = if local { LOCAL_STAGE } else { NETWORK_STAGE };
        info!("Stage {}: searching for datasource", stage);

        let mut state = InstanceState::with_paths(self.paths.clone());
        state.initialize().await?;
        let config = loader::load_merged_config(&self.paths).await?;

        if !local && let Some(report) = self.resume_from_local(&mut state).await? {
            return Ok(report);
        }

        let depends = if local {
            deps(&[Dependency::Filesystem])
        } else {
            deps(&[Dependency::Filesystem, Dependency::Network])
        };
        let ctx = DatasourceContext::new(self.paths.clone(), config.clone());
        let selection = match self
            .datasources
            .find_source(&config.datasource_list(), &depends, &ctx)
            .await
        {
            Ok(selection) => selection,
            Err(e) => {
                let (recorded, status) = if local {
                    (DEFERRED_STAGE, "running")
                } else {
                    (stage, "error")
                };
                self.record_status(&state, recorded, None, vec![e.to_string()], status)
                    .await;
                return Err(e);
            }
        };
        let source = selection.source;

        let instance_id = source.instance_id();
        let is_new_instance = state.set_instance_id(&instance_id).await?;
        let bundle = source.bundle().clone();
        let raw = bundle.userdata_raw().unwrap_or_default().to_vec();
        state.save_userdata(&raw).await?;
        state.save_datasource(source.name(), &bundle).await?;

        let cloud = Cloud::new(self.paths.clone(), &instance_id, source.name(), bundle);
        let mut errors = Vec::new();

        let walk = if local && !source.is_disconnected() {
            info!(
                "Datasource {} needs the network, deferring user-data to the network stage",
                source.name()
            );
            None
        } else {
            Some(self.consume(&state, &cloud, &raw, &mut errors).await)
        };

        let modules = if local {
            None
        } else {
            Some(self.init_modules(&state, &cloud, &mut errors).await?)
        };

        // The network stage reuses this selection only if data was consumed
        let datasource = Some(source.name().to_string());
        let stage_recorded = if walk.is_some() { stage } else { DEFERRED_STAGE };
        self.record_status(&state, stage_recorded, datasource, errors, "running")
            .await;

        Ok(InitReport {
            datasource: source.name().to_string(),
            instance_id,
            is_new_instance,
            walk,
            modules,
        })
    }

    /// Reuse the datasource the local stage found and consumed
    async fn resume_from_local(
        &self,
        state: &mut InstanceState,
    ) -> Result<Option<InitReport>, CloudInitError> {
        let status = state.read_status().await?;
        if status.stage.as_deref() != Some(LOCAL_STAGE) {
            return Ok(None);
        }
        let Some(instance_id) = state.load_cached_instance_id().await? else {
            return Ok(None);
        };
        let Some(datasource) = state.load_datasource_name().await? else {
            return Ok(None);
        };

        info!("Reusing datasource {} found by the local stage", datasource);
        let bundle = state.load_metadata().await?.unwrap_or_else(MetadataBundle::new);
        let cloud = Cloud::new(self.paths.clone(), &instance_id, &datasource, bundle);

        let mut errors = Vec::new();
        let modules = self.init_modules(state, &cloud, &mut errors).await?;
        self.record_status(state, NETWORK_STAGE, Some(datasource.clone()), errors, "running")
            .await;

        Ok(Some(InitReport {
            datasource,
            instance_id,
            is_new_instance: false,
            walk: None,
            modules: Some(modules),
        }))
    }

    /// Decompose user-data and walk it through the handlers
    ///
    /// The first walk for an instance is a per-instance pass; later walks of
    /// the same instance only reach handlers declaring `always`.
    async fn consume(
        &self,
        state: &InstanceState,
        cloud: &Cloud,
        raw: &[u8],
        errors: &mut Vec<String>,
    ) -> WalkReport {
        let parts = match UserDataProcessor::new(&self.paths) {
            Ok(processor) => match processor.process(raw).await {
                Ok(parts) => parts,
                Err(e) => {
                    warn!("Failed to decompose user-data: {}", e);
                    errors.push(e.to_string());
                    Vec::new()
                }
            },
            Err(e) => {
                warn!("Failed to set up user-data processing: {}", e);
                errors.push(e.to_string());
                Vec::new()
            }
        };
        debug!("User-data decomposed into {} parts", parts.len());

        let mut registry = HandlerRegistry::new();
        if let Err(e) =
            handlers::load_persisted_handlers(&mut registry, &self.catalog, &self.paths.handlers_dir())
                .await
        {
            warn!("Failed to load persisted handlers: {}", e);
        }
        let claimed = registry.register_defaults(handlers::default_handlers());
        debug!("Default handlers claimed {:?}", claimed);

        let Some(ledger) = state.ledger() else {
            errors.push("instance id not set".to_string());
            return WalkReport::default();
        };
        let catalog = &self.catalog;
        let parts = &parts;
        let first_pass = &mut registry;
        let first = ledger
            .run(CONSUME_DATA, Frequency::PerInstance, false, move || async move {
                Ok(handlers::consume_userdata(first_pass, catalog, cloud, parts, Frequency::PerInstance).await)
            })
            .await;
        let walk = match first {
            Ok(Some(walk)) => walk,
            Ok(None) => {
                handlers::consume_userdata(&mut registry, catalog, cloud, parts, Frequency::Always).await
            }
            Err(e) => {
                warn!("Failed to record {}: {}", CONSUME_DATA, e);
                errors.push(e.to_string());
                WalkReport::default()
            }
        };
        errors.extend(walk.failures.iter().map(|(name, e)| format!("{}: {}", name, e)));
        walk
    }

    async fn init_modules(
        &self,
        state: &InstanceState,
        cloud: &Cloud,
        errors: &mut Vec<String>,
    ) -> Result<RunReport, CloudInitError> {
        let config = loader::load_instance_config(&self.paths, cloud.instance_id()).await?;
        let Some(ledger) = state.ledger() else {
            return Err(CloudInitError::Config("instance id not set".to_string()));
        };
        let report = ModuleRunner::new(&self.modules, ledger, cloud, &config)
            .run_section(ModuleMode::Init.section())
            .await;
        errors.extend(report.failures.iter().map(|(name, e)| format!("{}: {}", name, e)));
        Ok(report)
    }
}
