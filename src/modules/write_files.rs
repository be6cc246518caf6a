//! Write files module

use super::{Module, config_value};
use crate::config::{Config, WriteFileConfig};
use crate::{Cloud, CloudInitError, util};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use flate2::read::GzDecoder;
use serde_yaml::Value;
use std::io::Read;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

const DEFAULT_PERMISSIONS: &str = "0644";

pub struct WriteFilesModule;

#[async_trait]
impl Module for WriteFilesModule {
    fn name(&self) -> &'static str {
        "write_files"
    }

    async fn handle(
        &self,
        name: &str,
        config: &Config,
        _cloud: &Cloud,
        _args: &[Value],
    ) -> Result<(), CloudInitError> {
        let Some(files) = config_value::<Vec<WriteFileConfig>>(config, name, "write_files")? else {
            debug!("Skipping module named {}, no 'write_files' key in configuration", name);
            return Ok(());
        };
        write_files(&files).await
    }
}

/// Write files from cloud-config
pub async fn write_files(files: &[WriteFileConfig]) -> Result<(), CloudInitError> {
    for file in files {
        write_file(file).await?;
    }
    Ok(())
}

async fn write_file(config: &WriteFileConfig) -> Result<(), CloudInitError> {
    info!("Writing file: {}", config.path);

    let path = Path::new(&config.path);
    let mut content = decode_content(&config.content, config.encoding.as_deref())?;

    if config.append == Some(true) {
        match fs::read(path).await {
            Ok(mut existing) => {
                existing.append(&mut content);
                content = existing;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    let mode = util::parse_mode(config.permissions.as_deref().unwrap_or(DEFAULT_PERMISSIONS))?;
    util::write_file(path, &content, mode).await?;

    if let Some(owner) = &config.owner {
        set_ownership(path, owner).await?;
    }

    Ok(())
}

/// Decode content based on encoding type
fn decode_content(content: &str, encoding: Option<&str>) -> Result<Vec<u8>, CloudInitError> {
    let encoding = encoding.map(|e| e.trim().to_lowercase());
    match encoding.as_deref() {
        Some("base64") | Some("b64") => decode_base64(content),
        Some("gzip") | Some("gz") => decompress_gzip(content.as_bytes()),
        // Base64-encoded gzip data (most common)
        Some("gz+base64") | Some("gzip+base64") | Some("gz+b64") | Some("b64+gzip")
        | Some("base64+gzip") => decompress_gzip(&decode_base64(content)?),
        Some("text/plain") | None => Ok(content.as_bytes().to_vec()),
        Some(other) => Err(CloudInitError::InvalidData(format!("Unknown encoding: {}", other))),
    }
}

fn decode_base64(content: &str) -> Result<Vec<u8>, CloudInitError> {
    let compact: String = content.split_whitespace().collect();
    BASE64
        .decode(compact)
        .map_err(|e| CloudInitError::InvalidData(format!("Invalid base64: {}", e)))
}

fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>, CloudInitError> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| CloudInitError::InvalidData(format!("Failed to decompress gzip: {}", e)))?;
    Ok(decompressed)
}

async fn set_ownership(path: &Path, owner: &str) -> Result<(), CloudInitError> {
    debug!("Setting ownership {} on {:?}", owner, path);

    let output = tokio::process::Command::new("chown")
        .args([owner, &path.to_string_lossy()])
        .output()
        .await
        .map_err(|e| CloudInitError::Command(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CloudInitError::Command(format!(
            "Failed to set ownership: {}",
            stderr.trim()
        )));
    }

    Ok(())
}
