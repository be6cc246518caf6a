//! `text/x-shellscript` handler
//!
//! Saves scripts to the instance `scripts` directory; the `scripts_user`
//! module runs them later in the final stage.

use super::{PartCall, PartHandler, clean_filename, dos2unix};
use crate::userdata::types;
use crate::{Cloud, CloudInitError, util};
use async_trait::async_trait;

pub struct ShellScriptHandler;

#[async_trait]
impl PartHandler for ShellScriptHandler {
    fn name(&self) -> &str {
        "shell-script"
    }

    fn list_types(&self) -> Vec<String> {
        vec![types::SHELLSCRIPT.to_string()]
    }

    fn frequency(&self) -> Option<String> {
        Some("always".to_string())
    }

    async fn handle_part(&mut self, cloud: &Cloud, call: PartCall<'_>) -> Result<(), CloudInitError> {
        if call.is_lifecycle() {
            return Ok(());
        }

        let filename = clean_filename(call.filename.unwrap_or("part"));
        let path = cloud.paths().scripts_dir(cloud.instance_id()).join(filename);
        util::write_file(&path, &dos2unix(call.payload), 0o700).await
    }
}
