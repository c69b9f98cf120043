//! Configuration system for the JingWei compositor
//!
//! Loads configuration from TOML file at `~/.config/jingwei/config.toml`
//! Auto-generates default config file on first run if missing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub buffers: BufferConfig,
    pub backend: BackendConfig,
}

impl Config {
    /// Load configuration from the default location, or use defaults if the file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            // Auto-generate default config file
            if let Err(e) = Self::save_default(config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path).context("Failed to read config file")?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        info!("Configuration loaded from {:?}", config_path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("jingwei");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let default_config = Self::default();
        let toml_string =
            toml::to_string_pretty(&default_config).context("Failed to serialize default config")?;

        fs::write(path, toml_string).context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }
}

/// Listening socket and connection handling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket path override; defaults to `$XDG_RUNTIME_DIR/jw_mt_core.sock`
    pub socket_path: Option<PathBuf>,
    /// Maximum simultaneously connected clients
    pub max_clients: usize,
    /// Upper bound on one wait for socket readiness, in milliseconds
    pub poll_timeout_ms: u64,
    /// Largest accepted request frame payload
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            max_clients: 10,
            poll_timeout_ms: 10,
            max_frame_bytes: jw_ipc::MAX_FRAME_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(jw_ipc::socket_path)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Shared canvas configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Segment name prefix; the surface id is appended
    pub shm_prefix: String,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            shm_prefix: "/jw_shm_".to_string(),
        }
    }
}

/// Which presentation backend to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    X11,
    Headless,
}

/// Presentation backend configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend: "x11" or "headless"
    pub kind: BackendKind,
    /// X display to connect to; `$DISPLAY` when unset
    pub display: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.server.max_clients, 10);
        assert_eq!(config.server.poll_timeout(), Duration::from_millis(10));
        assert!(path.exists());

        // The generated file parses back to the same values
        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.buffers.shm_prefix, "/jw_shm_");
        assert_eq!(reloaded.backend.kind, BackendKind::X11);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[server]\nmax_clients = 2\nsocket_path = \"/tmp/x.sock\"\n\n[backend]\nkind = \"headless\"\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.server.max_clients, 2);
        assert_eq!(config.server.socket_path(), PathBuf::from("/tmp/x.sock"));
        assert_eq!(config.server.max_frame_bytes, jw_ipc::MAX_FRAME_SIZE);
        assert_eq!(config.backend.kind, BackendKind::Headless);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[server\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
