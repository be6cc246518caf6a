//! EC2 (AWS) datasource
//!
//! Fetches metadata from the EC2 Instance Metadata Service (IMDS).
//! Supports both IMDSv1 and IMDSv2 (preferred for security).

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Datasource, DatasourceContext, MetadataBundle};
use crate::CloudInitError;

/// EC2 metadata service base URL (link-local address)
const IMDS_BASE_URL: &str = "http://169.254.169.254";

/// IMDSv2 token TTL in seconds
const TOKEN_TTL_SECONDS: u32 = 300;

/// Default request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Simple metadata paths copied into the bundle under the same key
const METADATA_KEYS: [&str; 5] = [
    "local-hostname",
    "hostname",
    "instance-type",
    "local-ipv4",
    "ami-id",
];

/// EC2 datasource for AWS and compatible clouds
pub struct Ec2 {
    client: Client,
    base_url: String,
    check_platform: bool,
    token: Option<String>,
    bundle: MetadataBundle,
}

impl Ec2 {
    /// Create against the link-local IMDS endpoint
    pub fn new(timeout: Duration) -> Result<Self, CloudInitError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(2))
            .build()?;

        Ok(Self {
            client,
            base_url: IMDS_BASE_URL.to_string(),
            check_platform: true,
            token: None,
            bundle: MetadataBundle::default(),
        })
    }

    /// Create against a custom endpoint; skips the platform (DMI) check
    pub fn with_base_url(base_url: &str) -> Result<Self, CloudInitError> {
        let mut source = Self::new(Duration::from_secs(DEFAULT_TIMEOUT_SECS))?;
        source.base_url = base_url.trim_end_matches('/').to_string();
        source.check_platform = false;
        Ok(source)
    }

    /// Build from the `datasource.Ec2` config section (`metadata_url`, `timeout`)
    pub fn from_context(ctx: &DatasourceContext) -> Result<Self, CloudInitError> {
        let section = ctx.config.datasource_config("Ec2");
        let timeout = section
            .get("timeout")
            .and_then(serde_yaml::Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        match section.get_str("metadata_url") {
            Some(url) => {
                let mut source = Self::with_base_url(url)?;
                source.client = Client::builder()
                    .timeout(Duration::from_secs(timeout))
                    .connect_timeout(Duration::from_secs(2))
                    .build()?;
                Ok(source)
            }
            None => Self::new(Duration::from_secs(timeout)),
        }
    }

    /// Get IMDSv2 token for authenticated requests
    async fn get_imdsv2_token(&self) -> Option<String> {
        let url = format!("{}/latest/api/token", self.base_url);
        let response = self
            .client
            .put(&url)
            .header("X-aws-ec2-metadata-token-ttl-seconds", TOKEN_TTL_SECONDS.to_string())
            .send()
            .await
            .ok()?;

        if response.status().is_success() {
            response.text().await.ok()
        } else {
            None
        }
    }

    /// GET a path below /latest, with the session token when we have one
    ///
    /// Returns `Ok(None)` on 404.
    async fn get(&self, path: &str) -> Result<Option<String>, CloudInitError> {
        let url = format!("{}/latest/{}", self.base_url, path);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.header("X-aws-ec2-metadata-token", token);
        }

        let response = request.send().await?;
        match response.status() {
            status if status.is_success() => Ok(Some(response.text().await?)),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(CloudInitError::Datasource(format!(
                "Failed to fetch {}: {}",
                path, status
            ))),
        }
    }

    async fn get_metadata(&self, path: &str) -> Result<Option<String>, CloudInitError> {
        self.get(&format!("meta-data/{path}")).await
    }

    /// Collect `public-keys/<n>=<name>` entries into a name → key map
    async fn fetch_public_keys(&self) -> Result<serde_json::Map<String, serde_json::Value>, CloudInitError> {
        let mut keys = serde_json::Map::new();
        let Some(listing) = self.get_metadata("public-keys/").await? else {
            return Ok(keys);
        };

        for line in listing.lines() {
            let Some((index, name)) = line.split_once('=') else {
                continue;
            };
            match self
                .get_metadata(&format!("public-keys/{index}/openssh-key"))
                .await
            {
                Ok(Some(key)) => {
                    keys.insert(name.trim().to_string(), key.trim().into());
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to fetch public key {}: {}", name, e),
            }
        }
        Ok(keys)
    }

    /// Check if we're running on EC2 by looking for DMI data
    async fn check_dmi_data() -> bool {
        let dmi_paths = [
            "/sys/class/dmi/id/product_name",
            "/sys/class/dmi/id/bios_vendor",
            "/sys/class/dmi/id/sys_vendor",
        ];

        for path in &dmi_paths {
            if let Ok(content) = tokio::fs::read_to_string(path).await {
                let content = content.to_lowercase();
                if content.contains("amazon") || content.contains("ec2") {
                    return true;
                }
            }
        }

        Path::new("/sys/hypervisor/uuid").exists()
    }
}

#[async_trait]
impl Datasource for Ec2 {
    fn name(&self) -> &str {
        "Ec2"
    }

    async fn fetch(&mut self) -> Result<bool, CloudInitError> {
        if self.check_platform && !Self::check_dmi_data().await {
            debug!("DMI data does not look like EC2");
            return Ok(false);
        }

        self.token = self.get_imdsv2_token().await;
        if self.token.is_none() {
            debug!("IMDSv2 token unavailable, using IMDSv1");
        }

        let Some(instance_id) = self.get_metadata("instance-id").await? else {
            debug!("IMDS has no instance-id");
            return Ok(false);
        };

        let mut bundle = MetadataBundle::new();
        bundle.set("instance-id", instance_id.trim());
        bundle.set("cloud-name", "aws");

        for key in METADATA_KEYS {
            match self.get_metadata(key).await {
                Ok(Some(value)) => bundle.set(key, value.trim()),
                Ok(None) => {}
                Err(e) => warn!("Failed to fetch {}: {}", key, e),
            }
        }

        if let Ok(Some(az)) = self.get_metadata("placement/availability-zone").await {
            let az = az.trim();
            bundle.set("availability-zone", az);
            if let Some(region) = region_from_zone(az) {
                bundle.set("region", region);
            }
        }

        let keys = self.fetch_public_keys().await?;
        if !keys.is_empty() {
            bundle.set("public-keys", keys);
        }

        let userdata = self.get("user-data").await?;
        if userdata.is_none() {
            debug!("No user-data available");
        }
        bundle.set_userdata(userdata.map(String::into_bytes).unwrap_or_default());

        self.bundle = bundle;
        Ok(true)
    }

    fn bundle(&self) -> &MetadataBundle {
        &self.bundle
    }
}

/// Region is the zone minus its trailing letter (us-east-1a -> us-east-1)
fn region_from_zone(zone: &str) -> Option<&str> {
    let (last, _) = zone.char_indices().last()?;
    Some(&zone[..last]).filter(|r| !r.is_empty())
}
