use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    pub auth: AuthConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Maximum number of per-path operations running at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Period of the automatic sync timer; 0 disables it.
    #[serde(default = "default_auto_run_interval")]
    pub auto_run_interval_secs: u64,
    /// Delay before the one-shot sync after daemon startup.
    #[serde(default)]
    pub init_run_delay_secs: Option<u64>,
    /// Upper bound for a whole sync run.
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
    #[serde(default = "default_trash_retention")]
    pub trash_retention_days: u64,
    /// Custom path for the SQLite database
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            auto_run_interval_secs: default_auto_run_interval(),
            init_run_delay_secs: None,
            run_timeout_secs: None,
            trash_retention_days: default_trash_retention(),
            db_path: None,
        }
    }
}

fn default_concurrency() -> usize {
    1
}
fn default_auto_run_interval() -> u64 {
    0
}
fn default_trash_retention() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Custom path for token storage
    pub token_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub local_path: PathBuf,
    /// Name of the Drive folder (under "My Drive") mirrored by `local_path`.
    #[serde(default)]
    pub remote_root_name: Option<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl SyncConfig {
    /// The remote root folder name, defaulting to the local folder's name.
    pub fn remote_root_name(&self) -> String {
        if let Some(name) = &self.remote_root_name {
            return name.clone();
        }
        self.local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "gdsyncd".to_string())
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(dir.join("gdsyncd").join("config.toml"))
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()?,
    };

    let content = std::fs::read_to_string(&path).with_context(|| {
        format!(
            "Failed to read config file: {}\n\
             Create it with your Google OAuth client credentials and sync folder.",
            path.display()
        )
    })?;

    let config = parse_config(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)?;

    if config.auth.client_id.is_empty() {
        anyhow::bail!("auth.client_id must not be empty");
    }
    if config.auth.client_secret.is_empty() {
        anyhow::bail!("auth.client_secret must not be empty");
    }
    if config.general.concurrency == 0 {
        anyhow::bail!("general.concurrency must be at least 1");
    }
    if !config.sync.local_path.is_absolute() {
        anyhow::bail!(
            "sync.local_path must be absolute, got {}",
            config.sync.local_path.display()
        );
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [auth]
        client_id = "id"
        client_secret = "secret"

        [sync]
        local_path = "/home/me/notes"
    "#;

    #[test]
    fn defaults_apply() {
        let cfg = parse_config(MINIMAL).unwrap();
        assert_eq!(cfg.general.concurrency, 1);
        assert_eq!(cfg.general.auto_run_interval_secs, 0);
        assert!(cfg.general.init_run_delay_secs.is_none());
        assert_eq!(cfg.sync.remote_root_name(), "notes");
        assert!(cfg.sync.exclude.is_empty());
    }

    #[test]
    fn explicit_values() {
        let cfg = parse_config(
            r#"
            [general]
            concurrency = 4
            auto_run_interval_secs = 600
            init_run_delay_secs = 5

            [auth]
            client_id = "id"
            client_secret = "secret"

            [sync]
            local_path = "/srv/vault"
            remote_root_name = "Vault Backup"
            exclude = ["*.tmp"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.general.concurrency, 4);
        assert_eq!(cfg.general.init_run_delay_secs, Some(5));
        assert_eq!(cfg.sync.remote_root_name(), "Vault Backup");
        assert_eq!(cfg.sync.exclude, vec!["*.tmp".to_string()]);
    }

    #[test]
    fn rejects_zero_concurrency() {
        let content = format!("[general]\nconcurrency = 0\n{MINIMAL}");
        assert!(parse_config(&content).is_err());
    }

    #[test]
    fn rejects_relative_local_path() {
        let content = MINIMAL.replace("/home/me/notes", "notes");
        assert!(parse_config(&content).is_err());
    }

    #[test]
    fn rejects_empty_client_id() {
        let content = MINIMAL.replace("\"id\"", "\"\"");
        assert!(parse_config(&content).is_err());
    }
}
