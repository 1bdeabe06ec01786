use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rand::RngCore;

pub const DEFAULT_WORKER_URL: &str = "https://tunnel.burrow.dev";

/// Edge base URL, overridable for self-hosted or local edges.
pub fn worker_url() -> String {
    std::env::var("WORKER_URL")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_WORKER_URL.to_string())
}

/// Host the proxied traffic is sent to. `host.docker.internal` stands
/// in for localhost when the agent runs in a container without host
/// networking.
pub fn target_host() -> String {
    if std::env::var("NET_HOST").as_deref() == Ok("false") {
        "host.docker.internal".to_string()
    } else {
        "localhost".to_string()
    }
}

/// Stable per-machine client id, created on first run at
/// `$HOME/.prod/id` and reused afterwards.
pub fn client_id() -> Result<String> {
    let home = dirs::home_dir().context("failed to locate home directory")?;
    client_id_at(&home.join(".prod"))
}

/// Load or create the client id under the given config directory.
pub fn client_id_at(config_dir: &Path) -> Result<String> {
    let id_file = config_dir.join("id");

    if id_file.exists() {
        let data = fs::read_to_string(&id_file)
            .with_context(|| format!("failed to read {}", id_file.display()))?;
        return Ok(data.trim_end().to_string());
    }

    fs::create_dir_all(config_dir)
        .with_context(|| format!("failed to create {}", config_dir.display()))?;
    #[cfg(unix)]
    set_mode(config_dir, 0o755)?;

    let id = generate_id();
    fs::write(&id_file, &id).with_context(|| format!("failed to write {}", id_file.display()))?;
    #[cfg(unix)]
    set_mode(&id_file, 0o644)?;

    Ok(id)
}

/// 32 lowercase hex characters from the OS RNG.
fn generate_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to set permissions on {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_id_is_32_lowercase_hex() {
        let id = generate_id();
        assert_eq!(id.len(), 32);
        assert!(id
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn client_id_is_created_then_reused() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join(".prod");
        let first = client_id_at(&config_dir).unwrap();
        let second = client_id_at(&config_dir).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
    }

    #[test]
    fn client_id_is_trimmed_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join(".prod");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(config_dir.join("id"), "abc123\n").unwrap();
        assert_eq!(client_id_at(&config_dir).unwrap(), "abc123");
    }
}
