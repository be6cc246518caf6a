//! Fallback datasource that always claims the environment
//!
//! Used last in `datasource_list` so a boot without any reachable provider
//! still gets a stable instance id. Metadata and user-data can be supplied
//! through the `datasource.None` config section.

use async_trait::async_trait;

use super::{Datasource, DatasourceContext, MetadataBundle};
use crate::CloudInitError;

pub const NONE_INSTANCE_ID: &str = "iid-datasource-none";

pub struct NoneSource {
    config: crate::config::Config,
    bundle: MetadataBundle,
}

impl NoneSource {
    pub fn from_context(ctx: &DatasourceContext) -> Self {
        Self {
            config: ctx.config.datasource_config("None"),
            bundle: MetadataBundle::default(),
        }
    }
}

#[async_trait]
impl Datasource for NoneSource {
    fn name(&self) -> &str {
        "None"
    }

    async fn fetch(&mut self) -> Result<bool, CloudInitError> {
        let mut bundle = match self.config.get("metadata") {
            Some(value @ serde_yaml::Value::Mapping(_)) => match serde_json::to_value(value)? {
                serde_json::Value::Object(map) => MetadataBundle::from_map(map),
                _ => MetadataBundle::new(),
            },
            _ => MetadataBundle::new(),
        };

        if bundle.instance_id().is_none() {
            bundle.set("instance-id", NONE_INSTANCE_ID);
        }

        let userdata = self.config.get_str("userdata_raw").unwrap_or_default();
        bundle.set_userdata(userdata.as_bytes().to_vec());

        self.bundle = bundle;
        Ok(true)
    }

    fn bundle(&self) -> &MetadataBundle {
        &self.bundle
    }

    fn is_disconnected(&self) -> bool {
        true
    }
}
