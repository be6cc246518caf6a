//! NoCloud datasource
//!
//! Reads metadata and user data from local files or mounted ISO.
//! Common locations:
//! - /var/lib/cloud/seed/nocloud/
//! - /var/lib/cloud/seed/nocloud-net/
//! - Mounted filesystem with label 'cidata' or 'CIDATA'

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::{Datasource, DatasourceContext, MetadataBundle};
use crate::CloudInitError;

/// Instance id used when meta-data does not set one
const DEFAULT_NOCLOUD_ID: &str = "nocloud";

/// Mount points checked for a `cidata` volume
const CIDATA_MOUNTS: [&str; 3] = ["/mnt/cidata", "/media/cidata", "/run/cloud-init/cidata"];

/// NoCloud datasource for local file-based configuration
pub struct NoCloud {
    name: &'static str,
    seed_dirs: Vec<PathBuf>,
    bundle: MetadataBundle,
}

impl NoCloud {
    /// Create with explicit seed directories
    pub fn new(seed_dirs: Vec<PathBuf>) -> Self {
        Self {
            name: "NoCloud",
            seed_dirs,
            bundle: MetadataBundle::default(),
        }
    }

    /// Build the local (`net == false`) or network-stage variant
    pub fn from_context(ctx: &DatasourceContext, net: bool) -> Self {
        let seed = ctx.paths.seed_dir();
        let mut seed_dirs = Vec::new();

        if let Some(dir) = ctx
            .config
            .datasource_config("NoCloud")
            .get_str("seed_dir")
        {
            seed_dirs.push(PathBuf::from(dir));
        }

        if net {
            seed_dirs.push(seed.join("nocloud-net"));
        } else {
            seed_dirs.push(seed.join("nocloud"));
            seed_dirs.extend(CIDATA_MOUNTS.iter().map(PathBuf::from));
        }

        let mut source = Self::new(seed_dirs);
        if net {
            source.name = "NoCloudNet";
        }
        source
    }

    /// Find the seed directory containing meta-data
    async fn find_seed_dir(&self) -> Option<PathBuf> {
        for dir in &self.seed_dirs {
            if let Ok(metadata) = fs::metadata(dir.join("meta-data")).await
                && metadata.is_file()
            {
                return Some(dir.clone());
            }
        }
        None
    }

    async fn read_file(seed_dir: &Path, filename: &str) -> Option<Vec<u8>> {
        fs::read(seed_dir.join(filename)).await.ok()
    }
}

#[async_trait]
impl Datasource for NoCloud {
    fn name(&self) -> &str {
        self.name
    }

    async fn fetch(&mut self) -> Result<bool, CloudInitError> {
        let Some(seed_dir) = self.find_seed_dir().await else {
            debug!("No NoCloud seed directory found");
            return Ok(false);
        };

        debug!("Reading NoCloud metadata from {:?}", seed_dir);

        let raw = Self::read_file(&seed_dir, "meta-data").await.unwrap_or_default();
        let parsed: serde_yaml::Value = if raw.is_empty() {
            serde_yaml::Value::Null
        } else {
            serde_yaml::from_slice(&raw)?
        };

        let mut bundle = match serde_json::to_value(&parsed)? {
            serde_json::Value::Object(map) => MetadataBundle::from_map(map),
            serde_json::Value::Null => MetadataBundle::new(),
            _ => {
                return Err(CloudInitError::Datasource(format!(
                    "meta-data in {} is not a mapping",
                    seed_dir.display()
                )));
            }
        };

        if bundle.instance_id().is_none() {
            bundle.set("instance-id", DEFAULT_NOCLOUD_ID);
        }

        bundle.set_userdata(Self::read_file(&seed_dir, "user-data").await.unwrap_or_default());
        self.bundle = bundle;
        Ok(true)
    }

    fn bundle(&self) -> &MetadataBundle {
        &self.bundle
    }

    fn is_disconnected(&self) -> bool {
        self.name == "NoCloud"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fetch_from_seed_dir() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("meta-data"),
            "instance-id: iid-local01\nlocal-hostname: seeded",
        )
        .await
        .unwrap();
        fs::write(temp.path().join("user-data"), "#cloud-config\nhostname: x")
            .await
            .unwrap();

        let mut source = NoCloud::new(vec![temp.path().to_path_buf()]);
        assert!(source.fetch().await.unwrap());
        assert_eq!(source.instance_id(), "iid-local01");
        assert_eq!(source.bundle().local_hostname(), Some("seeded"));
        assert!(source.bundle().userdata_raw().unwrap().starts_with(b"#cloud-config"));
    }

    #[tokio::test]
    async fn test_fetch_without_seed() {
        let temp = TempDir::new().unwrap();
        let mut source = NoCloud::new(vec![temp.path().join("missing")]);
        assert!(!source.fetch().await.unwrap());
    }

    #[tokio::test]
    async fn test_default_instance_id() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("meta-data"), "").await.unwrap();

        let mut source = NoCloud::new(vec![temp.path().to_path_buf()]);
        assert!(source.fetch().await.unwrap());
        assert_eq!(source.instance_id(), "nocloud");
        assert_eq!(source.bundle().userdata_raw(), Some(&b""[..]));
    }

    #[tokio::test]
    async fn test_non_mapping_metadata_is_an_error() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("meta-data"), "- a\n- b").await.unwrap();

        let mut source = NoCloud::new(vec![temp.path().to_path_buf()]);
        assert!(source.fetch().await.is_err());
    }
}
