//! Final message module - announce that configuration finished

use super::Module;
use crate::config::Config;
use crate::state::Frequency;
use crate::{Cloud, CloudInitError};
use async_trait::async_trait;
use serde_yaml::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

const DEFAULT_MESSAGE: &str =
    "cloud-init-engine v. $VERSION finished at $TIMESTAMP. Datasource $DATASOURCE. Up $UPTIME seconds";

pub struct FinalMessageModule;

/// Expand `$VERSION`, `$TIMESTAMP`, `$UPTIME`, `$DATASOURCE` and `$INSTANCE_ID`
pub fn render_message(template: &str, cloud: &Cloud, uptime: &str, timestamp: u64) -> String {
    template
        .replace("$VERSION", env!("CARGO_PKG_VERSION"))
        .replace("$TIMESTAMP", &timestamp.to_string())
        .replace("$UPTIME", uptime)
        .replace("$DATASOURCE", cloud.datasource())
        .replace("$INSTANCE_ID", cloud.instance_id())
}

async fn read_uptime() -> String {
    tokio::fs::read_to_string("/proc/uptime")
        .await
        .ok()
        .and_then(|s| s.split_whitespace().next().map(String::from))
        .unwrap_or_else(|| "unknown".to_string())
}

#[async_trait]
impl Module for FinalMessageModule {
    fn name(&self) -> &'static str {
        "final_message"
    }

    fn frequency(&self) -> Frequency {
        Frequency::Always
    }

    async fn handle(
        &self,
        _name: &str,
        config: &Config,
        cloud: &Cloud,
        args: &[Value],
    ) -> Result<(), CloudInitError> {
        let template = args
            .first()
            .and_then(Value::as_str)
            .or_else(|| config.get_str("final_message"))
            .unwrap_or(DEFAULT_MESSAGE);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        info!("{}", render_message(template, cloud, &read_uptime().await, timestamp));
        Ok(())
    }
}
