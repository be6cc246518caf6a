//! Cloud-config merging
//!
//! Implements merging of multiple cloud-config sources with proper precedence:
//! 1. /etc/cloud/cloud.cfg (base)
//! 2. /etc/cloud/cloud.cfg.d/*.cfg (sorted alphabetically)
//! 3. The per-instance cloud-config gathered from user-data (highest priority)

use super::Config;
use serde_yaml::Value;
use tracing::debug;

/// Merge strategy for list fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListMergeStrategy {
    /// Append new items to existing list
    #[default]
    Append,
    /// Prepend new items to existing list
    Prepend,
    /// Replace entire list
    Replace,
    /// No change (keep original)
    NoReplace,
}

impl ListMergeStrategy {
    /// Parse from string (as used in merge_how)
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "append" => Self::Append,
            "prepend" => Self::Prepend,
            "replace" => Self::Replace,
            "no_replace" | "noreplace" => Self::NoReplace,
            _ => Self::Append,
        }
    }
}

/// Merge two configs
///
/// The `overlay` config takes precedence over `base` for scalar values.
/// List values are appended without duplicates.
pub fn merge_configs(base: &Config, overlay: &Config) -> Config {
    let merged = merge_yaml_values(
        &Value::Mapping(base.as_mapping().clone()),
        &Value::Mapping(overlay.as_mapping().clone()),
        ListMergeStrategy::Append,
    );

    match merged {
        Value::Mapping(root) => Config::from_mapping(root),
        _ => base.clone(),
    }
}

/// Merge two YAML values recursively
pub fn merge_yaml_values(base: &Value, overlay: &Value, list_strategy: ListMergeStrategy) -> Value {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            let mut result = base_map.clone();

            for (key, overlay_value) in overlay_map {
                let merged = match result.get(key) {
                    Some(base_value) => merge_yaml_values(base_value, overlay_value, list_strategy),
                    None => overlay_value.clone(),
                };
                result.insert(key.clone(), merged);
            }

            Value::Mapping(result)
        }

        (Value::Sequence(base_seq), Value::Sequence(overlay_seq)) => match list_strategy {
            ListMergeStrategy::Append => {
                let mut result = base_seq.clone();
                for item in overlay_seq {
                    if !result.contains(item) {
                        result.push(item.clone());
                    }
                }
                Value::Sequence(result)
            }
            ListMergeStrategy::Prepend => {
                let mut result = overlay_seq.clone();
                for item in base_seq {
                    if !result.contains(item) {
                        result.push(item.clone());
                    }
                }
                Value::Sequence(result)
            }
            ListMergeStrategy::Replace => Value::Sequence(overlay_seq.clone()),
            ListMergeStrategy::NoReplace => Value::Sequence(base_seq.clone()),
        },

        // Overlay is null - keep base value
        (base_value, Value::Null) => base_value.clone(),

        // All other cases - overlay wins
        (_, overlay_value) => overlay_value.clone(),
    }
}

/// Merge multiple configs in order (later configs have higher priority)
pub fn merge_all_configs(configs: &[Config]) -> Config {
    let Some((first, rest)) = configs.split_first() else {
        return Config::default();
    };

    let mut result = first.clone();
    for config in rest {
        debug!("Merging cloud-config");
        result = merge_configs(&result, config);
    }
    result
}
