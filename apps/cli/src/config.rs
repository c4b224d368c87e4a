//! CLI configuration.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/sliceup/config.toml`
//! - Windows: `%APPDATA%/sliceup/config.toml`
//!
//! Upload settings live in the `[upload]` table.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sliceup_uploader::UploadConfig;

/// CLI configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// How often a failed upload is resumed before giving up.
    #[serde(default = "default_resume_attempts")]
    pub resume_attempts: u32,

    /// Pause before each resume, in seconds.
    #[serde(default = "default_resume_delay_secs")]
    pub resume_delay_secs: u64,

    /// Seconds between progress reports (0 disables them).
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,

    #[serde(default)]
    pub upload: UploadConfig,
}

fn default_resume_attempts() -> u32 {
    3
}

fn default_resume_delay_secs() -> u64 {
    2
}

fn default_progress_interval_secs() -> u64 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resume_attempts: default_resume_attempts(),
            resume_delay_secs: default_resume_delay_secs(),
            progress_interval_secs: default_progress_interval_secs(),
            upload: UploadConfig::default(),
        }
    }
}

impl Config {
    /// Loads `path` if given; otherwise the platform config file, creating
    /// it with defaults when missing.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            return Self::load_from(path);
        }

        let path = config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Config::default();
            config.save_to(&path)?;
            tracing::info!(path = %path.display(), "wrote default configuration");
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        let config: Config = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Upload headers may carry credentials.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn resume_delay(&self) -> Duration {
        Duration::from_secs(self.resume_delay_secs)
    }

    pub fn progress_interval(&self) -> Option<Duration> {
        (self.progress_interval_secs > 0).then(|| Duration::from_secs(self.progress_interval_secs))
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("sliceup")
            .join("config.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("sliceup").join("config.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp/sliceup/config.toml"))
    }
}
