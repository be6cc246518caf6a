//! Datasource implementations and provider selection
//!
//! Datasources provide instance metadata and user data from cloud providers.
//! Each provider is registered with the set of capabilities it needs
//! (filesystem, network); the selector probes the configured providers in
//! order and returns the first one that claims the environment.

pub mod ec2;
pub mod mock;
pub mod nocloud;
pub mod none;

use crate::CloudInitError;
use crate::config::Config;
use crate::state::CloudPaths;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

/// Instance id reported when a provider has none
pub const DEFAULT_INSTANCE_ID: &str = "iid-datasource";

/// Capability a provider needs before it can be probed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dependency {
    Filesystem,
    Network,
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filesystem => f.write_str("FILESYSTEM"),
            Self::Network => f.write_str("NETWORK"),
        }
    }
}

/// Set of capabilities, compared by exact equality
pub type DependencySet = BTreeSet<Dependency>;

/// Build a dependency set from a slice
pub fn deps(items: &[Dependency]) -> DependencySet {
    items.iter().copied().collect()
}

/// Metadata gathered by a provider plus the raw user-data blob
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataBundle {
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(skip)]
    userdata_raw: Option<Vec<u8>>,
}

impl MetadataBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a bundle from an already parsed metadata map
    pub fn from_map(metadata: Map<String, Value>) -> Self {
        Self {
            metadata,
            userdata_raw: None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.get_str("instance-id")
    }

    pub fn local_hostname(&self) -> Option<&str> {
        self.get_str("local-hostname")
    }

    /// Hostname to configure for this instance
    ///
    /// IPv4 addresses become `ip-a-b-c-d`. Without `fqdn` only the first
    /// label is returned.
    pub fn hostname(&self, fqdn: bool) -> String {
        let Some(raw) = self
            .local_hostname()
            .or_else(|| self.get_str("hostname"))
            .map(str::trim)
            .filter(|h| !h.is_empty())
        else {
            return "localhost".to_string();
        };

        if let Ok(ip) = raw.parse::<Ipv4Addr>() {
            let [a, b, c, d] = ip.octets();
            return format!("ip-{a}-{b}-{c}-{d}");
        }

        if fqdn {
            raw.to_string()
        } else {
            raw.split('.').next().unwrap_or(raw).to_string()
        }
    }

    /// Public SSH keys, whether given as a string, a list or a map of either
    pub fn public_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        if let Some(value) = self.get("public-keys") {
            collect_keys(value, &mut keys);
        }
        keys
    }

    pub fn userdata_raw(&self) -> Option<&[u8]> {
        self.userdata_raw.as_deref()
    }

    pub fn set_userdata(&mut self, raw: Vec<u8>) {
        self.userdata_raw = Some(raw);
    }
}

fn collect_keys(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.extend(
            s.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(String::from),
        ),
        Value::Array(items) => items.iter().for_each(|v| collect_keys(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_keys(v, out)),
        _ => {}
    }
}

/// Trait for cloud metadata datasources
///
/// Each cloud provider implements this trait. `fetch` decides whether the
/// provider claims the environment and fills its bundle as a side effect.
#[async_trait]
pub trait Datasource: Send + Sync {
    /// Name of this datasource (e.g., "Ec2", "NoCloud")
    fn name(&self) -> &str;

    /// Probe the environment and populate the bundle
    async fn fetch(&mut self) -> Result<bool, CloudInitError>;

    /// Metadata collected by the last successful fetch
    fn bundle(&self) -> &MetadataBundle;

    fn instance_id(&self) -> String {
        self.bundle()
            .instance_id()
            .unwrap_or(DEFAULT_INSTANCE_ID)
            .to_string()
    }

    /// Whether this provider cannot reach network-backed data
    fn is_disconnected(&self) -> bool {
        false
    }
}

/// What a provider gets to build itself
#[derive(Debug, Clone)]
pub struct DatasourceContext {
    pub paths: CloudPaths,
    pub config: Config,
}

impl DatasourceContext {
    pub fn new(paths: CloudPaths, config: Config) -> Self {
        Self { paths, config }
    }
}

/// Constructor for a provider
pub type DatasourceFactory =
    Box<dyn Fn(&DatasourceContext) -> Result<Box<dyn Datasource>, CloudInitError> + Send + Sync>;

/// A registered provider: its name, required capabilities and constructor
pub struct ProviderDescriptor {
    name: String,
    depends: DependencySet,
    factory: DatasourceFactory,
}

impl ProviderDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn depends(&self) -> &DependencySet {
        &self.depends
    }
}

impl fmt::Debug for ProviderDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderDescriptor")
            .field("name", &self.name)
            .field("depends", &self.depends)
            .finish_non_exhaustive()
    }
}

/// Result of probing one provider
#[derive(Debug)]
pub struct ProbeOutcome {
    pub provider: String,
    pub claimed: bool,
    pub error: Option<CloudInitError>,
}

/// The provider that claimed the environment, plus the probe trail
pub struct Selection {
    pub source: Box<dyn Datasource>,
    pub probes: Vec<ProbeOutcome>,
}

/// Table of known providers
#[derive(Debug, Default)]
pub struct DatasourceRegistry {
    providers: Vec<ProviderDescriptor>,
}

/// Match key for provider names: case-insensitive, `DataSource` prefix optional
fn canonical_name(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    lower
        .strip_prefix("datasource")
        .map(String::from)
        .unwrap_or(lower)
}

impl DatasourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every compiled-in provider
    pub fn builtin() -> Self {
        use Dependency::{Filesystem, Network};

        let mut registry = Self::new();
        registry.register("NoCloud", &[Filesystem], |ctx| {
            Ok(Box::new(nocloud::NoCloud::from_context(ctx, false)))
        });
        registry.register("NoCloud", &[Filesystem, Network], |ctx| {
            Ok(Box::new(nocloud::NoCloud::from_context(ctx, true)))
        });
        registry.register("Ec2", &[Filesystem, Network], |ctx| {
            Ok(Box::new(ec2::Ec2::from_context(ctx)?))
        });
        registry.register("None", &[], |ctx| Ok(Box::new(none::NoneSource::from_context(ctx))));
        registry.register("None", &[Filesystem, Network], |ctx| {
            Ok(Box::new(none::NoneSource::from_context(ctx)))
        });
        registry
    }

    /// Register a provider for an exact dependency set
    pub fn register<F>(&mut self, name: &str, depends: &[Dependency], factory: F)
    where
        F: Fn(&DatasourceContext) -> Result<Box<dyn Datasource>, CloudInitError>
            + Send
            + Sync
            + 'static,
    {
        self.providers.push(ProviderDescriptor {
            name: name.to_string(),
            depends: deps(depends),
            factory: Box::new(factory),
        });
    }

    /// Providers eligible for `names` in list order, whose dependencies equal `depends`
    pub fn list_sources(&self, names: &[String], depends: &DependencySet) -> Vec<&ProviderDescriptor> {
        let mut found = Vec::new();
        for wanted in names {
            let wanted = canonical_name(wanted);
            for provider in &self.providers {
                if canonical_name(&provider.name) == wanted && provider.depends == *depends {
                    found.push(provider);
                }
            }
        }
        found
    }

    /// Probe a single provider
    async fn probe(
        provider: &ProviderDescriptor,
        ctx: &DatasourceContext,
    ) -> (ProbeOutcome, Option<Box<dyn Datasource>>) {
        let mut outcome = ProbeOutcome {
            provider: provider.name.clone(),
            claimed: false,
            error: None,
        };

        let mut source = match (provider.factory)(ctx) {
            Ok(source) => source,
            Err(e) => {
                outcome.error = Some(e);
                return (outcome, None);
            }
        };

        match source.fetch().await {
            Ok(true) => {
                outcome.claimed = true;
                (outcome, Some(source))
            }
            Ok(false) => (outcome, None),
            Err(e) => {
                outcome.error = Some(e);
                (outcome, None)
            }
        }
    }

    /// Return the first provider in `names` order that claims the environment
    pub async fn find_source(
        &self,
        names: &[String],
        depends: &DependencySet,
        ctx: &DatasourceContext,
    ) -> Result<Selection, CloudInitError> {
        let candidates = self.list_sources(names, depends);
        let searched: Vec<String> = candidates.iter().map(|p| p.name.clone()).collect();
        let depends_str: Vec<String> = depends.iter().map(ToString::to_string).collect();

        debug!(
            "Searching for datasource in {:?} with dependencies [{}]",
            searched,
            depends_str.join(", ")
        );

        let mut probes = Vec::new();
        for provider in candidates {
            let (outcome, source) = Self::probe(provider, ctx).await;
            match (&outcome.error, source) {
                (None, Some(source)) => {
                    info!("Found datasource {}", source.name());
                    probes.push(outcome);
                    return Ok(Selection { source, probes });
                }
                (Some(e), _) => warn!("Datasource {} probe failed: {}", provider.name, e),
                (None, None) => debug!("Datasource {} did not claim the environment", provider.name),
            }
            probes.push(outcome);
        }

        Err(CloudInitError::NoDatasource { searched })
    }
}
