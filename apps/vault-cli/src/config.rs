//! CLI configuration.
//!
//! Stored as TOML at `$XDG_CONFIG_HOME/televault/config.toml` (falling back
//! to `~/.config/televault/config.toml`). A default file is written on first
//! run so the bot token and chat id can be filled in.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use televault_sync::SyncConfig;
use televault_transport::TelegramConfig;

/// Everything the CLI needs to build a coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Index file. Defaults to `index.json` next to the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_path: Option<PathBuf>,

    /// Where `restore` writes when no destination is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_dir: Option<PathBuf>,

    #[serde(default)]
    pub telegram: TelegramConfig,

    #[serde(default)]
    pub sync: SyncConfig,
}

impl VaultConfig {
    /// Loads `path`, or the default location when `None`.
    ///
    /// A missing file is created with default contents.
    pub fn load(path: Option<&Path>) -> anyhow::Result<(Self, PathBuf)> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path()?,
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: VaultConfig = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok((config, path))
        } else {
            let config = VaultConfig::default();
            config.save(&path)?;
            tracing::info!(path = %path.display(), "wrote default configuration");
            Ok((config, path))
        }
    }

    /// Writes the configuration to `path` with owner-only permissions.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // The file holds the bot token.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Resolved index location for a config loaded from `config_path`.
    pub fn index_path(&self, config_path: &Path) -> PathBuf {
        match &self.index_path {
            Some(p) => p.clone(),
            None => config_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("index.json"),
        }
    }

    /// Resolved restore directory.
    pub fn download_dir(&self) -> PathBuf {
        match &self.download_dir {
            Some(p) => p.clone(),
            None => home_dir().join("Downloads").join("TeleVault"),
        }
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".into()))
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA").context("APPDATA is not set")?;
        Ok(PathBuf::from(appdata).join("televault").join("config.toml"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        let base = match std::env::var_os("XDG_CONFIG_HOME") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => home_dir().join(".config"),
        };
        Ok(base.join("televault").join("config.toml"))
    }
}
