//! Cloud-config parsing and types
//!
//! The merged configuration is kept as an untyped YAML mapping: module lists,
//! datasource settings and per-module sections are all read from it, and
//! modules deserialize the typed views they need on demand.

pub mod loader;
pub mod merge;

use crate::CloudInitError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

/// Datasources probed when the config does not name any
pub const DEFAULT_DATASOURCE_LIST: [&str; 3] = ["NoCloud", "Ec2", "None"];

/// Merged cloud configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    root: Mapping,
}

impl Config {
    /// Parse cloud-config from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        // Strip #cloud-config header if present
        let yaml = yaml
            .trim_start()
            .strip_prefix("#cloud-config")
            .unwrap_or(yaml);

        match serde_yaml::from_str::<Value>(yaml)? {
            Value::Null => Ok(Self::default()),
            Value::Mapping(root) => Ok(Self { root }),
            other => Err(<serde_yaml::Error as serde::de::Error>::custom(format!(
                "cloud-config must be a mapping, found {}",
                value_kind(&other)
            ))),
        }
    }

    /// Wrap an existing mapping
    pub fn from_mapping(root: Mapping) -> Self {
        Self { root }
    }

    /// Check if this looks like a cloud-config (starts with #cloud-config)
    pub fn is_cloud_config(data: &str) -> bool {
        data.trim_start().starts_with("#cloud-config")
    }

    /// The underlying mapping
    pub fn as_mapping(&self) -> &Mapping {
        &self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Look up a top-level key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    /// Look up a nested key path
    pub fn get_path(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut current = self.root.get(*first)?;
        for key in rest {
            current = current.as_mapping()?.get(*key)?;
        }
        Some(current)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// Deserialize a top-level key into a typed view
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CloudInitError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_yaml::from_value(value.clone())
                .map(Some)
                .map_err(|e| CloudInitError::Config(format!("invalid '{}': {}", key, e))),
        }
    }

    /// Set a top-level key
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.root.insert(Value::from(key), value.into());
    }

    /// Ordered datasource names to probe
    pub fn datasource_list(&self) -> Vec<String> {
        let configured: Vec<String> = self
            .get("datasource_list")
            .and_then(Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        if configured.is_empty() {
            DEFAULT_DATASOURCE_LIST.iter().map(|s| s.to_string()).collect()
        } else {
            configured
        }
    }

    /// The `datasource.<name>` section
    pub fn datasource_config(&self, name: &str) -> Config {
        match self.get_path(&["datasource", name]) {
            Some(Value::Mapping(section)) => Config::from_mapping(section.clone()),
            _ => Config::default(),
        }
    }

    /// Distro name from `system_info.distro`
    pub fn distro(&self) -> Option<&str> {
        self.get_path(&["system_info", "distro"])
            .and_then(Value::as_str)
    }

    /// Default user name from `system_info.default_user.name`
    pub fn default_user(&self) -> Option<&str> {
        self.get_path(&["system_info", "default_user", "name"])
            .and_then(Value::as_str)
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

/// File to write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFileConfig {
    pub path: String,
    #[serde(default)]
    pub content: String,
    pub encoding: Option<String>,
    pub owner: Option<String>,
    pub permissions: Option<String>,
    pub append: Option<bool>,
}

/// Command to run (can be string or list of args)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunCmd {
    /// Shell command as string
    Shell(String),
    /// Command with arguments
    Args(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_cloud_config() {
        let yaml = r#"
#cloud-config
hostname: test-instance
packages:
  - nginx
  - vim
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.get_str("hostname"), Some("test-instance"));
        let packages: Vec<String> = config.get_as("packages").unwrap().unwrap();
        assert_eq!(packages, vec!["nginx", "vim"]);
    }

    #[test]
    fn test_empty_and_non_mapping() {
        assert!(Config::from_yaml("#cloud-config\n").unwrap().is_empty());
        assert!(Config::from_yaml("- a\n- b\n").is_err());
    }

    #[test]
    fn test_is_cloud_config() {
        assert!(Config::is_cloud_config("#cloud-config\nhostname: test"));
        assert!(Config::is_cloud_config("  #cloud-config\n"));
        assert!(!Config::is_cloud_config("#!/bin/bash\necho hello"));
    }

    #[test]
    fn test_datasource_list_default_and_configured() {
        let config = Config::default();
        assert_eq!(config.datasource_list(), vec!["NoCloud", "Ec2", "None"]);

        let config = Config::from_yaml("datasource_list: [ Ec2, None ]").unwrap();
        assert_eq!(config.datasource_list(), vec!["Ec2", "None"]);
    }

    #[test]
    fn test_nested_lookups() {
        let config = Config::from_yaml(
            r#"
system_info:
  distro: ubuntu
  default_user:
    name: ubuntu
datasource:
  Ec2:
    timeout: 5
"#,
        )
        .unwrap();

        assert_eq!(config.distro(), Some("ubuntu"));
        assert_eq!(config.default_user(), Some("ubuntu"));
        let ec2 = config.datasource_config("Ec2");
        assert_eq!(ec2.get("timeout").and_then(Value::as_u64), Some(5));
        assert!(config.datasource_config("NoCloud").is_empty());
    }

    #[test]
    fn test_get_as_reports_bad_shape() {
        let config = Config::from_yaml("runcmd: 5").unwrap();
        assert!(config.get_as::<Vec<RunCmd>>("runcmd").is_err());
    }
}
