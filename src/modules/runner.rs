//! Module execution engine
//!
//! Reads a configured module list, resolves each entry to a registered
//! module and runs them strictly in order through the frequency ledger.
//! A failing module is recorded and the next one still runs; deciding
//! whether a failure is fatal is left to the caller.

use super::{Module, ModuleRegistry, normalize_name};
use crate::config::Config;
use crate::state::{Frequency, FrequencyLedger};
use crate::{Cloud, CloudInitError};
use serde_yaml::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One entry of a module list: name, optional frequency, positional args
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleSpec {
    pub name: String,
    pub frequency: Option<String>,
    pub args: Vec<Value>,
}

impl ModuleSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            frequency: None,
            args: Vec::new(),
        }
    }

    /// Parse one list entry
    ///
    /// Accepts `name`, `[name, frequency, args...]` or
    /// `{name, frequency, args}`. Returns `None` for empty or malformed
    /// entries.
    pub fn from_value(item: &Value) -> Option<Self> {
        match item {
            Value::String(s) if !s.trim().is_empty() => Some(Self::new(s)),
            Value::Sequence(seq) => {
                let name = seq.first()?.as_str()?;
                Some(Self {
                    name: name.trim().to_string(),
                    frequency: seq.get(1).and_then(Value::as_str).map(|f| f.trim().to_string()),
                    args: seq.iter().skip(2).cloned().collect(),
                })
            }
            Value::Mapping(map) => {
                let name = map.get("name")?.as_str()?;
                let args = match map.get("args") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Sequence(args)) => args.clone(),
                    Some(other) => vec![other.clone()],
                };
                Some(Self {
                    name: name.trim().to_string(),
                    frequency: map
                        .get("frequency")
                        .and_then(Value::as_str)
                        .map(|f| f.trim().to_string()),
                    args,
                })
            }
            _ => None,
        }
    }
}

/// Read the module list stored under `section` in the config
pub fn read_modules(config: &Config, section: &str) -> Vec<ModuleSpec> {
    let Some(items) = config.get(section) else {
        debug!("No {} section in config", section);
        return Vec::new();
    };
    let Some(items) = items.as_sequence() else {
        warn!("{} is not a list, ignoring it", section);
        return Vec::new();
    };

    items
        .iter()
        .filter(|item| !item.is_null())
        .filter_map(|item| {
            let spec = ModuleSpec::from_value(item);
            if spec.is_none() {
                warn!("Skipping malformed entry in {}: {:?}", section, item);
            }
            spec
        })
        .filter(|spec| !spec.name.is_empty())
        .collect()
}

/// A spec bound to its module
struct Resolved {
    module: Arc<dyn Module>,
    name: String,
    frequency: Option<Frequency>,
    args: Vec<Value>,
}

/// Outcome of running a module list
#[derive(Debug, Default)]
pub struct RunReport {
    /// Modules attempted, in order, whether or not they succeeded
    pub ran: Vec<String>,
    /// Failed modules, in order
    pub failures: Vec<(String, CloudInitError)>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_names(&self) -> Vec<&str> {
        self.failures.iter().map(|(n, _)| n.as_str()).collect()
    }
}

/// Runs modules for one instance
pub struct ModuleRunner<'a> {
    registry: &'a ModuleRegistry,
    ledger: &'a FrequencyLedger,
    cloud: &'a Cloud,
    config: &'a Config,
}

impl<'a> ModuleRunner<'a> {
    pub fn new(
        registry: &'a ModuleRegistry,
        ledger: &'a FrequencyLedger,
        cloud: &'a Cloud,
        config: &'a Config,
    ) -> Self {
        Self {
            registry,
            ledger,
            cloud,
            config,
        }
    }

    /// Run the module list stored under `section`
    pub async fn run_section(&self, section: &str) -> RunReport {
        let specs = read_modules(self.config, section);
        info!("Running {} modules from {}", specs.len(), section);
        self.run_specs(&specs).await
    }

    /// Run one module by name, outside any list
    pub async fn run_single(&self, name: &str, frequency: Option<&str>, args: Vec<Value>) -> RunReport {
        let spec = ModuleSpec {
            name: name.trim().to_string(),
            frequency: frequency.map(String::from),
            args,
        };
        self.run_specs(&[spec]).await
    }

    pub async fn run_specs(&self, specs: &[ModuleSpec]) -> RunReport {
        let resolved = self.resolve(specs);
        self.run_resolved(resolved).await
    }

    /// Drop unknown modules and unrecognized frequency overrides
    fn resolve(&self, specs: &[ModuleSpec]) -> Vec<Resolved> {
        let mut resolved = Vec::new();
        for spec in specs {
            if normalize_name(&spec.name).is_none() {
                continue;
            }

            let frequency = match spec.frequency.as_deref() {
                None | Some("") => None,
                Some(f) => {
                    let parsed = Frequency::parse(f);
                    if parsed.is_none() {
                        warn!(
                            "Config specified module {} has an unknown frequency {}",
                            spec.name, f
                        );
                    }
                    parsed
                }
            };

            let Some(module) = self.registry.get(&spec.name) else {
                warn!("Could not find module named {}", spec.name);
                continue;
            };

            resolved.push(Resolved {
                module,
                name: spec.name.clone(),
                frequency,
                args: spec.args.clone(),
            });
        }
        resolved
    }

    async fn run_resolved(&self, resolved: Vec<Resolved>) -> RunReport {
        let mut report = RunReport::default();
        let distro = self.config.distro().unwrap_or("unknown");

        for item in resolved {
            let frequency = item.frequency.unwrap_or_else(|| item.module.frequency());

            let worked: Vec<&str> = item
                .module
                .distros()
                .iter()
                .chain(item.module.os_families())
                .copied()
                .collect();
            if !worked.is_empty() && !worked.contains(&distro) {
                warn!(
                    "Module {} is verified on {:?} distros but not on {} distro. \
                     It may or may not work correctly.",
                    item.name, worked, distro
                );
            }

            report.ran.push(item.name.clone());
            let ledger_key = format!("config-{}", item.name);
            let module = &item.module;
            let result = self
                .ledger
                .run(&ledger_key, frequency, false, || {
                    module.handle(&item.name, self.config, self.cloud, &item.args)
                })
                .await;

            match result {
                Ok(Some(())) => debug!("Module {} completed", item.name),
                Ok(None) => {}
                Err(e) => {
                    warn!("Running module {} failed: {}", item.name, e);
                    report.failures.push((item.name, e));
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasources::MetadataBundle;
    use crate::state::CloudPaths;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records each run into a shared log; fails when told to
    struct Probe {
        name: &'static str,
        frequency: Frequency,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Module for Probe {
        fn name(&self) -> &'static str {
            self.name
        }
        fn frequency(&self) -> Frequency {
            self.frequency
        }
        fn distros(&self) -> &[&'static str] {
            &["ubuntu"]
        }
        async fn handle(&self, name: &str, _config: &Config, _cloud: &Cloud, args: &[Value]) -> Result<(), CloudInitError> {
            self.log.lock().unwrap().push(format!("{}{:?}", name, args.len()));
            if self.fail {
                return Err(CloudInitError::module(name, "probe failure"));
            }
            Ok(())
        }
    }

    struct Fixture {
        _temp: TempDir,
        registry: ModuleRegistry,
        ledger: FrequencyLedger,
        cloud: Cloud,
        log: Arc<Mutex<Vec<String>>>,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let paths = CloudPaths::with_base(temp.path());
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ModuleRegistry::new();
        for (name, frequency, fail) in [
            ("alpha", Frequency::PerInstance, false),
            ("beta", Frequency::PerInstance, true),
            ("gamma", Frequency::Always, false),
            ("delta", Frequency::PerOnce, true),
        ] {
            registry.register(Arc::new(Probe { name, frequency, fail, log: log.clone() }));
        }
        Fixture {
            ledger: FrequencyLedger::for_instance(&paths, "i-run"),
            cloud: Cloud::new(paths, "i-run", "Mock", MetadataBundle::new()),
            registry,
            log,
            _temp: temp,
        }
    }

    #[test]
    fn test_read_modules_entry_forms() {
        let config = Config::from_yaml(
            r#"
cloud_config_modules:
  - bootcmd
  - [runcmd, always, a, b]
  - {name: write-files, frequency: once, args: [x]}
  - {frequency: always}
  - 42
  - ""
  -
"#,
        )
        .unwrap();

        let specs = read_modules(&config, "cloud_config_modules");
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0], ModuleSpec::new("bootcmd"));
        assert_eq!(specs[1].frequency.as_deref(), Some("always"));
        assert_eq!(specs[1].args.len(), 2);
        assert_eq!(specs[2].name, "write-files");
        assert_eq!(specs[2].args, vec![Value::from("x")]);
        assert!(read_modules(&config, "cloud_final_modules").is_empty());
    }

    #[tokio::test]
    async fn test_order_preserved_and_failures_collected() {
        let fx = fixture();
        let config = Config::from_yaml(
            "cloud_config_modules: [alpha, beta, nonexistent, gamma, delta]\nsystem_info: {distro: debian}",
        )
        .unwrap();
        let runner = ModuleRunner::new(&fx.registry, &fx.ledger, &fx.cloud, &config);

        let report = runner.run_section("cloud_config_modules").await;
        assert_eq!(report.ran, vec!["alpha", "beta", "gamma", "delta"]);
        assert_eq!(report.failed_names(), vec!["beta", "delta"]);
        assert_eq!(*fx.log.lock().unwrap(), vec!["alpha0", "beta0", "gamma0", "delta0"]);
    }

    #[tokio::test]
    async fn test_ledger_gates_second_pass() {
        let fx = fixture();
        let config = Config::from_yaml("cloud_final_modules: [alpha, gamma]").unwrap();
        let runner = ModuleRunner::new(&fx.registry, &fx.ledger, &fx.cloud, &config);

        runner.run_section("cloud_final_modules").await;
        let second = runner.run_section("cloud_final_modules").await;

        assert!(second.is_success());
        assert_eq!(second.ran, vec!["alpha", "gamma"]);
        assert_eq!(*fx.log.lock().unwrap(), vec!["alpha0", "gamma0", "gamma0"]);
        assert!(fx.ledger.has_run("config-alpha", Frequency::PerInstance).await);
    }

    #[tokio::test]
    async fn test_frequency_override_and_unknown_fallback() {
        let fx = fixture();
        let config = Config::default();
        let runner = ModuleRunner::new(&fx.registry, &fx.ledger, &fx.cloud, &config);

        // explicit "always" lets a per-instance module repeat
        runner.run_single("alpha", Some("always"), vec![]).await;
        runner.run_single("alpha", Some("always"), vec![]).await;
        // an unrecognized override falls back to the module default
        runner.run_single("alpha", Some("fortnightly"), vec![Value::from(1)]).await;
        runner.run_single("alpha", Some("fortnightly"), vec![]).await;

        assert_eq!(*fx.log.lock().unwrap(), vec!["alpha0", "alpha0", "alpha1"]);
    }

    #[tokio::test]
    async fn test_run_single_unknown_module() {
        let fx = fixture();
        let config = Config::default();
        let runner = ModuleRunner::new(&fx.registry, &fx.ledger, &fx.cloud, &config);

        let report = runner.run_single("no-such-module", None, vec![]).await;
        assert!(report.ran.is_empty());
        assert!(report.is_success());
    }
}
