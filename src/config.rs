//! Configuration: socket path, script path, logging target.
//!
//! Layering, highest priority first: CLI flags (applied by `main`),
//! environment variables, `config.json` in the config directory,
//! built-in defaults.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Unix socket the server listens on.
    pub socket_path: PathBuf,
    /// User script; `None` falls back to `<config dir>/init.lua`, then
    /// the embedded default.
    #[serde(default)]
    pub script_path: Option<PathBuf>,
    /// Log file; `None` logs to stderr.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            script_path: None,
            log_file: None,
        }
    }
}

impl Config {
    /// The config directory (`~/.config/prise` unless overridden).
    ///
    /// `PRISE_CONFIG_DIR` overrides, which tests rely on.
    ///
    /// # Errors
    ///
    /// Returns an error if no config directory can be determined or
    /// created.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("PRISE_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("No config directory")?
                .join("prise")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Load configuration: file, then environment overrides.
    ///
    /// A missing or unreadable config file falls back to defaults; a
    /// present-but-invalid one is reported.
    pub fn load() -> Result<Self> {
        let mut config = match Self::load_from_file() {
            Ok(config) => config,
            Err(e) => {
                log::debug!("no config file loaded: {e:#}");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_dir()?.join("config.json");
        if !path.exists() {
            anyhow::bail!("config file not found");
        }
        let content = fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("PRISE_SOCKET") {
            self.socket_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("PRISE_SCRIPT") {
            self.script_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("PRISE_LOG") {
            self.log_file = Some(PathBuf::from(path));
        }
    }

    /// Resolve the script to load: explicit path, else the conventional
    /// `<config dir>/init.lua` when it exists, else `None` (embedded
    /// default).
    #[must_use]
    pub fn resolve_script(&self) -> Option<PathBuf> {
        if self.script_path.is_some() {
            return self.script_path.clone();
        }
        let conventional = Self::config_dir().ok()?.join("init.lua");
        conventional.exists().then_some(conventional)
    }
}

/// Default socket path: `$XDG_RUNTIME_DIR/prise-<uid>.sock` when the
/// runtime dir is set, else `/tmp/prise-<uid>.sock`.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    let name = format!("prise-{}.sock", nix::unistd::getuid());
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir).join(name),
        _ => PathBuf::from("/tmp").join(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_socket_path_carries_uid() {
        let path = default_socket_path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("prise-"));
        assert!(name.ends_with(".sock"));
    }

    #[test]
    fn test_config_serialization_round_trip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let decoded: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config.socket_path, decoded.socket_path);
    }

    #[test]
    fn test_minimal_config_file_parses() {
        let config: Config = serde_json::from_str(r#"{"socket_path": "/tmp/x.sock"}"#).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/x.sock"));
        assert!(config.script_path.is_none());
        assert!(config.log_file.is_none());
    }
}
