//! Compiled-in handler catalog
//!
//! User-data can add handlers with a `#part-handler` manifest naming a
//! catalog entry:
//!
//! ```yaml
//! #part-handler
//! handler: shell-script
//! list_types: [text/x-custom-script]
//! frequency: always
//! handler_version: 2
//! ```
//!
//! Only implementations registered here can be selected; the manifest may
//! override the types, frequency and version they declare.

use super::{PartCall, PartHandler, boot_hook, cloud_config, shell_script};
use crate::{Cloud, CloudInitError};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Parsed `#part-handler` payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HandlerManifest {
    pub handler: String,
    #[serde(default)]
    pub list_types: Option<Vec<String>>,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub handler_version: Option<u32>,
}

impl HandlerManifest {
    pub fn parse(payload: &[u8]) -> Result<Self, CloudInitError> {
        let text = String::from_utf8_lossy(payload);
        let body = text
            .trim_start()
            .strip_prefix("#part-handler")
            .unwrap_or(&text);
        let manifest: Self = serde_yaml::from_str(body)?;
        if manifest.handler.trim().is_empty() {
            return Err(CloudInitError::InvalidData(
                "part-handler manifest has an empty handler name".to_string(),
            ));
        }
        Ok(manifest)
    }
}

type HandlerFactory = Box<dyn Fn() -> Box<dyn PartHandler> + Send + Sync>;

/// Name to implementation table for manifest-selected handlers
pub struct HandlerCatalog {
    factories: BTreeMap<String, HandlerFactory>,
}

impl std::fmt::Debug for HandlerCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerCatalog")
            .field("handlers", &self.names())
            .finish()
    }
}

impl Default for HandlerCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl HandlerCatalog {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        catalog.insert("cloud-config", || Box::new(cloud_config::CloudConfigHandler::new()));
        catalog.insert("shell-script", || Box::new(shell_script::ShellScriptHandler));
        catalog.insert("boot-hook", || Box::new(boot_hook::BootHookHandler));
        catalog.insert("discard", || Box::new(DiscardHandler));
        catalog
    }

    pub fn insert<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn PartHandler> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build the handler a manifest asks for, `None` if the name is unknown
    pub fn instantiate(&self, manifest: &HandlerManifest) -> Option<Box<dyn PartHandler>> {
        let factory = self.factories.get(manifest.handler.trim())?;
        debug!("Instantiating catalog handler {}", manifest.handler);
        Some(Box::new(ManifestHandler {
            inner: factory(),
            manifest: manifest.clone(),
        }))
    }
}

/// A catalog handler with manifest overrides applied
struct ManifestHandler {
    inner: Box<dyn PartHandler>,
    manifest: HandlerManifest,
}

#[async_trait]
impl PartHandler for ManifestHandler {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn list_types(&self) -> Vec<String> {
        self.manifest
            .list_types
            .clone()
            .unwrap_or_else(|| self.inner.list_types())
    }

    fn handler_version(&self) -> Option<u32> {
        self.manifest
            .handler_version
            .or_else(|| self.inner.handler_version())
    }

    fn frequency(&self) -> Option<String> {
        self.manifest
            .frequency
            .clone()
            .or_else(|| self.inner.frequency())
    }

    async fn handle_part(&mut self, cloud: &Cloud, call: PartCall<'_>) -> Result<(), CloudInitError> {
        self.inner.handle_part(cloud, call).await
    }
}

/// Accepts parts and drops them
struct DiscardHandler;

#[async_trait]
impl PartHandler for DiscardHandler {
    fn name(&self) -> &str {
        "discard"
    }

    fn frequency(&self) -> Option<String> {
        Some("always".to_string())
    }

    async fn handle_part(&mut self, _cloud: &Cloud, call: PartCall<'_>) -> Result<(), CloudInitError> {
        if !call.is_lifecycle() {
            debug!(
                "Discarding {} part {}",
                call.content_type,
                call.filename.unwrap_or_default()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::HandlerInfo;
    use crate::state::Frequency;

    #[test]
    fn test_parse_manifest() {
        let manifest = HandlerManifest::parse(
            b"#part-handler\nhandler: discard\nlist_types: [text/x-junk]\nfrequency: per-instance\n",
        )
        .unwrap();
        assert_eq!(manifest.handler, "discard");
        assert_eq!(manifest.list_types, Some(vec!["text/x-junk".to_string()]));
        assert!(HandlerManifest::parse(b"#part-handler\nlist_types: []").is_err());
        assert!(HandlerManifest::parse(b"#part-handler\nhandler: ''").is_err());
    }

    #[test]
    fn test_instantiate_applies_overrides() {
        let catalog = HandlerCatalog::builtin();
        let manifest = HandlerManifest::parse(
            b"#part-handler\nhandler: shell-script\nlist_types: [text/x-custom]\nfrequency: per-instance\nhandler_version: 1",
        )
        .unwrap();

        let handler = catalog.instantiate(&manifest).unwrap();
        let info = HandlerInfo::fixup(handler.as_ref());
        assert_eq!(info.types, vec!["text/x-custom"]);
        assert_eq!(info.frequency, Some(Frequency::PerInstance));
        assert_eq!(info.version, 1);
    }

    #[test]
    fn test_unknown_name() {
        let catalog = HandlerCatalog::builtin();
        let manifest = HandlerManifest::parse(b"#part-handler\nhandler: python-module").unwrap();
        assert!(catalog.instantiate(&manifest).is_none());
        assert!(catalog.names().contains(&"boot-hook"));
    }
}
