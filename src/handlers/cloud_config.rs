//! `text/cloud-config` handler
//!
//! Merges every cloud-config part of a pass and writes the result to the
//! instance's `cloud-config.txt` when the pass ends.

use super::{PartCall, PartHandler};
use crate::config::merge::{ListMergeStrategy, merge_yaml_values};
use crate::userdata::types;
use crate::{Cloud, CloudInitError, util};
use async_trait::async_trait;
use serde_yaml::{Mapping, Value};
use tracing::debug;

/// Keys a part may use to pick how its lists merge
const MERGE_KEYS: [&str; 2] = ["merge_how", "merge_type"];

#[derive(Debug, Default)]
pub struct CloudConfigHandler {
    buf: Option<Value>,
    file_names: Vec<String>,
}

impl CloudConfigHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.buf = None;
        self.file_names.clear();
    }

    fn merge_part(&mut self, payload: &[u8]) -> Result<(), CloudInitError> {
        let text = String::from_utf8_lossy(payload);
        let mut part = match serde_yaml::from_str::<Value>(&text)? {
            Value::Mapping(map) => map,
            Value::Null => Mapping::new(),
            _ => {
                return Err(CloudInitError::InvalidData(
                    "cloud-config part is not a mapping".to_string(),
                ));
            }
        };

        let strategy = extract_list_strategy(&mut part);
        debug!("Merging cloud-config part with list strategy {:?}", strategy);

        let base = self.buf.take().unwrap_or(Value::Mapping(Mapping::new()));
        self.buf = Some(merge_yaml_values(&base, &Value::Mapping(part), strategy));
        Ok(())
    }

    fn render(&self) -> Result<String, CloudInitError> {
        let Some(buf) = &self.buf else {
            return Ok(String::new());
        };

        let mut lines = vec!["#cloud-config".to_string(), String::new()];
        if !self.file_names.is_empty() {
            lines.push(format!("# from {} files", self.file_names.len()));
            lines.extend(self.file_names.iter().map(|f| format!("# {}", f)));
            lines.push(String::new());
        }
        lines.push(serde_yaml::to_string(buf)?);
        Ok(lines.join("\n"))
    }
}

/// Remove `merge_how`/`merge_type` from a part and read its list strategy
///
/// Accepts `list(append)+dict(...)` strings or `[{name: list, settings: [...]}]`.
fn extract_list_strategy(part: &mut Mapping) -> ListMergeStrategy {
    let mut strategy = ListMergeStrategy::default();
    for key in MERGE_KEYS {
        let Some(spec) = part.remove(key) else {
            continue;
        };
        let setting = match &spec {
            Value::String(s) => s
                .split('+')
                .find_map(|m| m.trim().strip_prefix("list("))
                .and_then(|rest| rest.split(')').next())
                .and_then(|settings| settings.split(',').map(str::trim).find(|s| !s.is_empty()))
                .map(String::from),
            Value::Sequence(entries) => entries
                .iter()
                .find(|e| e.get("name").and_then(Value::as_str) == Some("list"))
                .and_then(|e| e.get("settings"))
                .and_then(Value::as_sequence)
                .and_then(|s| s.first())
                .and_then(Value::as_str)
                .map(String::from),
            _ => None,
        };
        if let Some(setting) = setting {
            strategy = ListMergeStrategy::parse(&setting);
        }
    }
    strategy
}

#[async_trait]
impl PartHandler for CloudConfigHandler {
    fn name(&self) -> &str {
        "cloud-config"
    }

    fn list_types(&self) -> Vec<String> {
        vec![types::CLOUD_CONFIG.to_string()]
    }

    fn handler_version(&self) -> Option<u32> {
        Some(3)
    }

    fn frequency(&self) -> Option<String> {
        Some("always".to_string())
    }

    async fn handle_part(&mut self, cloud: &Cloud, call: PartCall<'_>) -> Result<(), CloudInitError> {
        if call.is_begin() {
            self.reset();
            return Ok(());
        }

        if call.is_end() {
            let content = self.render()?;
            let path = cloud.paths().cloud_config(cloud.instance_id());
            util::write_file(&path, content.as_bytes(), 0o600).await?;
            self.reset();
            return Ok(());
        }

        self.merge_part(call.payload)?;
        if let Some(filename) = call.filename {
            self.file_names.push(filename.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::datasources::MetadataBundle;
    use crate::state::CloudPaths;
    use tempfile::TempDir;
    use tokio::fs;

    fn part<'a>(name: &'a str, payload: &'a [u8]) -> PartCall<'a> {
        PartCall {
            content_type: types::CLOUD_CONFIG,
            filename: Some(name),
            payload,
            frequency: None,
        }
    }

    #[tokio::test]
    async fn test_merges_parts_and_writes_at_end() {
        let temp = TempDir::new().unwrap();
        let cloud = Cloud::new(CloudPaths::with_base(temp.path()), "i-1", "Mock", MetadataBundle::new());
        let mut handler = CloudConfigHandler::new();

        handler.handle_part(&cloud, PartCall::lifecycle(types::CONTENT_START)).await.unwrap();
        handler
            .handle_part(&cloud, part("part-001", b"#cloud-config\nhostname: a\nruncmd: [one]"))
            .await
            .unwrap();
        handler
            .handle_part(&cloud, part("part-002", b"#cloud-config\nhostname: b\nruncmd: [two]"))
            .await
            .unwrap();
        handler.handle_part(&cloud, PartCall::lifecycle(types::CONTENT_END)).await.unwrap();

        let written = fs::read_to_string(temp.path().join("instances/i-1/cloud-config.txt"))
            .await
            .unwrap();
        assert!(written.starts_with("#cloud-config"));
        assert!(written.contains("# from 2 files"));

        let config = Config::from_yaml(&written).unwrap();
        assert_eq!(config.get_str("hostname"), Some("b"));
        let runcmd: Vec<String> = config.get_as("runcmd").unwrap().unwrap();
        assert_eq!(runcmd, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_merge_how_replace() {
        let mut handler = CloudConfigHandler::new();
        handler.merge_part(b"packages: [a, b]").unwrap();
        handler
            .merge_part(b"merge_how: 'list(replace)+dict(recurse_array)'\npackages: [c]")
            .unwrap();

        let buf = handler.buf.unwrap();
        assert_eq!(buf.get("packages").unwrap().as_sequence().unwrap().len(), 1);
        assert!(buf.get("merge_how").is_none());
    }

    #[test]
    fn test_extract_list_strategy_forms() {
        let mut part: Mapping =
            serde_yaml::from_str("merge_type:\n  - name: list\n    settings: [prepend]").unwrap();
        assert_eq!(extract_list_strategy(&mut part), ListMergeStrategy::Prepend);

        let mut part = Mapping::new();
        assert_eq!(extract_list_strategy(&mut part), ListMergeStrategy::Append);
    }

    #[tokio::test]
    async fn test_rejects_non_mapping() {
        let mut handler = CloudConfigHandler::new();
        assert!(handler.merge_part(b"- just\n- a list").is_err());
    }

    #[tokio::test]
    async fn test_nothing_gathered_writes_empty_file() {
        let temp = TempDir::new().unwrap();
        let cloud = Cloud::new(CloudPaths::with_base(temp.path()), "i-2", "Mock", MetadataBundle::new());
        let mut handler = CloudConfigHandler::new();

        handler.handle_part(&cloud, PartCall::lifecycle(types::CONTENT_START)).await.unwrap();
        handler.handle_part(&cloud, PartCall::lifecycle(types::CONTENT_END)).await.unwrap();

        let written = fs::read_to_string(temp.path().join("instances/i-2/cloud-config.txt"))
            .await
            .unwrap();
        assert!(written.is_empty());
    }
}
