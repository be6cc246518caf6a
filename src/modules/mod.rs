//! Configuration modules
//!
//! Each module handles a specific aspect of instance configuration. The
//! stage's configuration lists which modules run and in what order; the
//! [`runner`] resolves those entries against a [`ModuleRegistry`] and gates
//! each run through the frequency ledger.

pub mod bootcmd;
pub mod final_message;
pub mod hostname;
pub mod runcmd;
pub mod runner;
pub mod scripts_user;
pub mod ssh_keys;
pub mod write_files;

pub use runner::{ModuleRunner, ModuleSpec, RunReport};

use crate::config::Config;
use crate::state::Frequency;
use crate::{Cloud, CloudInitError};
use async_trait::async_trait;
use serde_yaml::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Trait for configuration modules
#[async_trait]
pub trait Module: Send + Sync {
    /// Name of this module
    fn name(&self) -> &'static str;

    /// Execution frequency for this module
    fn frequency(&self) -> Frequency {
        Frequency::PerInstance
    }

    /// Distros this module is known to work on (empty means any)
    fn distros(&self) -> &[&'static str] {
        &[]
    }

    /// OS families this module is known to work on
    fn os_families(&self) -> &[&'static str] {
        &[]
    }

    /// Apply the module
    ///
    /// `name` is the name the configuration used, `args` any positional
    /// arguments given with it.
    async fn handle(
        &self,
        name: &str,
        config: &Config,
        cloud: &Cloud,
        args: &[Value],
    ) -> Result<(), CloudInitError>;
}

/// Compiled-in table of modules, keyed by normalized name
#[derive(Default, Clone)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn Module>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in module
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(bootcmd::BootcmdModule));
        registry.register(Arc::new(runcmd::RuncmdModule));
        registry.register(Arc::new(write_files::WriteFilesModule));
        registry.register(Arc::new(hostname::SetHostnameModule::default()));
        registry.register(Arc::new(ssh_keys::SshModule::default()));
        registry.register(Arc::new(scripts_user::ScriptsUserModule));
        registry.register(Arc::new(final_message::FinalMessageModule));
        registry
    }

    /// Add or replace a module
    pub fn register(&mut self, module: Arc<dyn Module>) {
        self.modules.insert(module.name().to_string(), module);
    }

    /// Look a module up by configured name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
        normalize_name(name).and_then(|n| self.modules.get(&n).cloned())
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.names())
            .finish()
    }
}

/// Canonical module name: trimmed, `-` as `_`, without a `cc_` prefix
pub fn normalize_name(raw: &str) -> Option<String> {
    let name = raw.trim().replace('-', "_");
    let name = name.strip_prefix("cc_").unwrap_or(&name);
    (!name.is_empty()).then(|| name.to_string())
}

/// Deserialize an optional config key, naming the module on failure
pub(crate) fn config_value<T: serde::de::DeserializeOwned>(
    config: &Config,
    module: &str,
    key: &str,
) -> Result<Option<T>, CloudInitError> {
    config
        .get_as(key)
        .map_err(|e| CloudInitError::module(module, e.to_string()))
}
