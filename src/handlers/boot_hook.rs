//! `text/cloud-boothook` handler
//!
//! Boot hooks run immediately while user-data is consumed, with
//! `INSTANCE_ID` set in their environment.

use super::{PartCall, PartHandler, clean_filename, dos2unix};
use crate::config::RunCmd;
use crate::userdata::types;
use crate::{Cloud, CloudInitError, util};
use async_trait::async_trait;
use tracing::info;

const BOOTHOOK_PREFIX: &[u8] = b"#cloud-boothook";

pub struct BootHookHandler;

/// Drop the `#cloud-boothook` marker line
fn strip_marker(payload: &[u8]) -> &[u8] {
    if payload.starts_with(BOOTHOOK_PREFIX) {
        let rest = &payload[BOOTHOOK_PREFIX.len()..];
        rest.strip_prefix(b"\n").unwrap_or(rest)
    } else {
        payload
    }
}

#[async_trait]
impl PartHandler for BootHookHandler {
    fn name(&self) -> &str {
        "boot-hook"
    }

    fn list_types(&self) -> Vec<String> {
        vec![types::BOOTHOOK.to_string()]
    }

    fn frequency(&self) -> Option<String> {
        Some("always".to_string())
    }

    async fn handle_part(&mut self, cloud: &Cloud, call: PartCall<'_>) -> Result<(), CloudInitError> {
        if call.is_lifecycle() {
            return Ok(());
        }

        let filename = clean_filename(call.filename.unwrap_or("part"));
        let path = cloud.paths().boothooks_dir(cloud.instance_id()).join(filename);
        let payload = dos2unix(call.payload);
        util::write_file(&path, strip_marker(&payload), 0o700).await?;

        info!("Running boot hook {}", path.display());
        let cmd = RunCmd::Args(vec![path.to_string_lossy().into_owned()]);
        util::run_command(&cmd, &[("INSTANCE_ID", cloud.instance_id())]).await?;
        Ok(())
    }
}
