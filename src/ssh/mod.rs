//! SSH authorized key management

pub mod authorized_keys;

pub use authorized_keys::{AuthKeyLine, parse_authorized_keys, update_authorized_keys};

use crate::{CloudInitError, util};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

const DEFAULT_AUTHORIZED_KEYS: &str = "%h/.ssh/authorized_keys";

/// System files consulted when installing keys
#[derive(Debug, Clone)]
pub struct SshPaths {
    pub passwd: PathBuf,
    pub sshd_config: PathBuf,
}

impl Default for SshPaths {
    fn default() -> Self {
        Self {
            passwd: PathBuf::from("/etc/passwd"),
            sshd_config: PathBuf::from("/etc/ssh/sshd_config"),
        }
    }
}

/// Install `keys` for `user`, merging with the existing authorized_keys
///
/// Returns the path written.
pub async fn setup_user_keys(
    paths: &SshPaths,
    user: &str,
    keys: &[String],
    options: Option<&str>,
) -> Result<PathBuf, CloudInitError> {
    info!("Configuring {} SSH keys for user {}", keys.len(), user);

    let home = get_user_home(&paths.passwd, user).await?;
    let ssh_dir = home.join(".ssh");
    if !ssh_dir.exists() {
        debug!("Creating SSH directory: {}", ssh_dir.display());
        fs::create_dir_all(&ssh_dir).await?;
        util::set_mode(&ssh_dir, 0o700).await?;
        change_ownership(&ssh_dir, user).await;
    }

    let entries: Vec<AuthKeyLine> = keys.iter().map(|k| AuthKeyLine::parse(k, options)).collect();

    let sshd = parse_ssh_config(&paths.sshd_config).await?;
    let authorized_keys = authorized_keys_path(&sshd, &home, user);

    let existing = match fs::read_to_string(&authorized_keys).await {
        Ok(content) => parse_authorized_keys(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    let content = update_authorized_keys(existing, &entries);

    if let Some(parent) = authorized_keys.parent() {
        fs::create_dir_all(parent).await?;
        util::set_mode(parent, 0o700).await?;
    }
    util::write_file(&authorized_keys, content.as_bytes(), 0o600).await?;
    change_ownership(&authorized_keys, user).await;

    Ok(authorized_keys)
}

/// Resolve `AuthorizedKeysFile` with `%h`, `%u` and `%%` expanded
fn authorized_keys_path(sshd: &HashMap<String, String>, home: &Path, user: &str) -> PathBuf {
    let configured = sshd
        .get("authorizedkeysfile")
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        // multiple files may be listed; the first one is managed
        .and_then(|v| v.split_whitespace().next())
        .unwrap_or(DEFAULT_AUTHORIZED_KEYS);

    let expanded = configured
        .replace("%h", &home.to_string_lossy())
        .replace("%u", user)
        .replace("%%", "%");

    let path = PathBuf::from(expanded);
    if path.is_absolute() { path } else { home.join(path) }
}

/// Read sshd_config into lowercase keyword -> argument pairs
pub async fn parse_ssh_config(path: &Path) -> Result<HashMap<String, String>, CloudInitError> {
    let mut ret = HashMap::new();
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ret),
        Err(e) => return Err(e.into()),
    };

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once(char::is_whitespace) {
            ret.insert(key.trim().to_lowercase(), val.trim().to_string());
        }
    }
    Ok(ret)
}

async fn get_user_home(passwd: &Path, username: &str) -> Result<PathBuf, CloudInitError> {
    let passwd = fs::read_to_string(passwd).await?;

    for line in passwd.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() >= 6 && fields[0] == username {
            return Ok(PathBuf::from(fields[5]));
        }
    }

    debug!("User {} not in passwd, assuming /home/{}", username, username);
    Ok(PathBuf::from(format!("/home/{}", username)))
}

async fn change_ownership(path: &Path, username: &str) {
    let result = tokio::process::Command::new("chown")
        .args([username, &path.to_string_lossy()])
        .output()
        .await;

    match result {
        Ok(output) if !output.status.success() => debug!(
            "Failed to change ownership of {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        Err(e) => debug!("Failed to run chown on {}: {}", path.display(), e),
        Ok(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn fixture(sshd: &str) -> (TempDir, SshPaths, PathBuf) {
        let temp = TempDir::new().unwrap();
        let home = temp.path().join("home/alice");
        let passwd = temp.path().join("passwd");
        fs::write(
            &passwd,
            format!("root:x:0:0:root:/root:/bin/sh\nalice:x:1000:1000::{}:/bin/sh\n", home.display()),
        )
        .await
        .unwrap();
        let sshd_config = temp.path().join("sshd_config");
        fs::write(&sshd_config, sshd).await.unwrap();
        (temp, SshPaths { passwd, sshd_config }, home)
    }

    #[tokio::test]
    async fn test_setup_merges_with_existing() {
        let (_temp, paths, home) = fixture("# defaults\n").await;
        fs::create_dir_all(home.join(".ssh")).await.unwrap();
        fs::write(home.join(".ssh/authorized_keys"), "ssh-rsa AAAA old\n").await.unwrap();

        let written = setup_user_keys(
            &paths,
            "alice",
            &["ssh-rsa AAAA renewed".to_string(), "ssh-ed25519 BBBB laptop".to_string()],
            None,
        )
        .await
        .unwrap();

        assert_eq!(written, home.join(".ssh/authorized_keys"));
        let content = fs::read_to_string(&written).await.unwrap();
        assert_eq!(content, "ssh-rsa AAAA renewed\nssh-ed25519 BBBB laptop\n");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&written).await.unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_authorized_keys_file_tokens() {
        let (temp, paths, _home) = fixture("").await;
        fs::write(
            &paths.sshd_config,
            format!("AuthorizedKeysFile {}/keys/%u.keys\n", temp.path().display()),
        )
        .await
        .unwrap();

        let written = setup_user_keys(&paths, "alice", &["AAAA".to_string()], Some("no-pty"))
            .await
            .unwrap();
        assert_eq!(written, temp.path().join("keys/alice.keys"));
        assert_eq!(fs::read_to_string(&written).await.unwrap(), "no-pty AAAA\n");
    }

    #[test]
    fn test_relative_path_joins_home() {
        let mut sshd = HashMap::new();
        sshd.insert("authorizedkeysfile".to_string(), ".ssh/authorized_keys2 .ssh/other".to_string());
        assert_eq!(
            authorized_keys_path(&sshd, Path::new("/home/bob"), "bob"),
            PathBuf::from("/home/bob/.ssh/authorized_keys2")
        );
        assert_eq!(
            authorized_keys_path(&HashMap::new(), Path::new("/home/bob"), "bob"),
            PathBuf::from("/home/bob/.ssh/authorized_keys")
        );
    }
}
