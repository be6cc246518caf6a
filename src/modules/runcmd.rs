//! Runcmd module - turn `runcmd` into a script for the final stage
//!
//! Commands are not run here. They are written as a shell script into the
//! instance `scripts` directory, which `scripts_user` executes later.

use super::{Module, config_value};
use crate::config::{Config, RunCmd};
use crate::{Cloud, CloudInitError, util};
use async_trait::async_trait;
use serde_yaml::Value;
use tracing::{debug, info};

pub struct RuncmdModule;

#[async_trait]
impl Module for RuncmdModule {
    fn name(&self) -> &'static str {
        "runcmd"
    }

    async fn handle(
        &self,
        name: &str,
        config: &Config,
        cloud: &Cloud,
        _args: &[Value],
    ) -> Result<(), CloudInitError> {
        let Some(commands) = config_value::<Vec<RunCmd>>(config, name, "runcmd")? else {
            debug!("Skipping module named {}, no 'runcmd' key in configuration", name);
            return Ok(());
        };

        let path = cloud.paths().scripts_dir(cloud.instance_id()).join("runcmd");
        info!("Writing {} runcmd commands to {}", commands.len(), path.display());
        util::write_file(&path, render_script(&commands).as_bytes(), 0o700).await
    }
}

/// Shell script running each command in order
pub fn render_script(commands: &[RunCmd]) -> String {
    let mut script = String::from("#!/bin/sh\n");
    for cmd in commands {
        match cmd {
            RunCmd::Shell(line) => script.push_str(line),
            RunCmd::Args(args) => {
                let quoted: Vec<String> = args.iter().map(|a| shell_quote(a)).collect();
                script.push_str(&quoted.join(" "));
            }
        }
        script.push('\n');
    }
    script
}

/// Single-quote an argument for sh
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasources::MetadataBundle;
    use crate::state::CloudPaths;
    use tempfile::TempDir;

    #[test]
    fn test_render_script() {
        let script = render_script(&[
            RunCmd::Shell("echo hello > /tmp/x".into()),
            RunCmd::Args(vec!["echo".into(), "it's".into(), "a b".into()]),
        ]);
        assert_eq!(
            script,
            "#!/bin/sh\necho hello > /tmp/x\n'echo' 'it'\\''s' 'a b'\n"
        );
    }

    #[tokio::test]
    async fn test_writes_runcmd_script() {
        let temp = TempDir::new().unwrap();
        let cloud = Cloud::new(CloudPaths::with_base(temp.path()), "i-1", "Mock", MetadataBundle::new());
        let config = Config::from_yaml("runcmd:\n  - touch /tmp/marker\n  - [ls, -l, /]\n").unwrap();

        RuncmdModule.handle("runcmd", &config, &cloud, &[]).await.unwrap();

        let script = tokio::fs::read_to_string(temp.path().join("instances/i-1/scripts/runcmd"))
            .await
            .unwrap();
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("touch /tmp/marker\n"));
        assert!(script.contains("'ls' '-l' '/'\n"));
    }
}
