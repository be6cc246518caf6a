//! File and process helpers shared by handlers and modules

use crate::CloudInitError;
use crate::config::RunCmd;
use std::path::Path;
use std::process::Output;
use tokio::fs;
use tracing::{debug, warn};

/// Write a file, creating parent directories, and set its mode
pub async fn write_file(path: &Path, content: &[u8], mode: u32) -> Result<(), CloudInitError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, content).await?;
    set_mode(path, mode).await?;
    debug!("Wrote {} ({:o})", path.display(), mode);
    Ok(())
}

/// Set permission bits on a path
pub async fn set_mode(path: &Path, mode: u32) -> Result<(), CloudInitError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

/// Parse an octal permission string such as "0644"
pub fn parse_mode(perms: &str) -> Result<u32, CloudInitError> {
    let digits = perms.trim().trim_start_matches("0o");
    u32::from_str_radix(digits, 8)
        .map_err(|e| CloudInitError::InvalidData(format!("Invalid permissions '{}': {}", perms, e)))
}

/// Run a command, capturing its output
///
/// A non-zero exit status is returned as `CloudInitError::Command`.
pub async fn run_command(cmd: &RunCmd, env: &[(&str, &str)]) -> Result<Output, CloudInitError> {
    let mut command = match cmd {
        RunCmd::Shell(shell_cmd) => {
            debug!("Running shell command: {}", shell_cmd);
            let mut c = tokio::process::Command::new("sh");
            c.args(["-c", shell_cmd]);
            c
        }
        RunCmd::Args(args) => {
            let Some((program, rest)) = args.split_first() else {
                return Err(CloudInitError::Command("empty command".to_string()));
            };
            debug!("Running command: {:?}", args);
            let mut c = tokio::process::Command::new(program);
            c.args(rest);
            c
        }
    };
    command.envs(env.iter().copied());

    let output = command
        .output()
        .await
        .map_err(|e| CloudInitError::Command(format!("{}: {}", describe(cmd), e)))?;

    if !output.stdout.is_empty() {
        debug!("stdout: {}", String::from_utf8_lossy(&output.stdout));
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(
            "Command exited with status {}: {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        );
        return Err(CloudInitError::Command(format!(
            "{} exited with status {}",
            describe(cmd),
            output.status.code().unwrap_or(-1)
        )));
    }

    Ok(output)
}

fn describe(cmd: &RunCmd) -> String {
    match cmd {
        RunCmd::Shell(s) => s.clone(),
        RunCmd::Args(args) => args.join(" "),
    }
}
