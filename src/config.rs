// src/config.rs
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::pump::ProtocolPolicy;

pub const CONFIG_FILE_NAME: &str = "StreamBridge.json";

// Configuration structures
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub calls: CallSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_server_id")]
    pub server_id: String,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSettings {
    /// Zero disables the deadline.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
    #[serde(default)]
    pub strict_protocol: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            server_id: default_server_id(),
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout(),
            strict_protocol: false,
        }
    }
}

// Default values
fn default_listen_addr() -> String { "0.0.0.0:54321".to_string() }
fn default_server_id() -> String { "bridge-1".to_string() }
fn default_handshake_timeout() -> u64 { 5000 }
fn default_call_timeout() -> u64 { 30000 }

impl BridgeConfig {
    pub fn validate(&self) -> Result<()> {
        self.server
            .listen_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("server.listen_addr '{}' is not a socket address", self.server.listen_addr))?;
        if self.server.server_id.trim().is_empty() {
            return Err(anyhow!("Configuration error: server.server_id cannot be empty"));
        }
        if self.server.handshake_timeout_ms == 0 {
            return Err(anyhow!("Configuration error: server.handshake_timeout_ms must be positive"));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.server.handshake_timeout_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        match self.calls.call_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn protocol_policy(&self) -> ProtocolPolicy {
        if self.calls.strict_protocol {
            ProtocolPolicy::Strict
        } else {
            ProtocolPolicy::Lenient
        }
    }
}

// Configuration loading and management functions
pub fn find_config_file() -> Option<PathBuf> {
    let locations = [
        ("Current directory", PathBuf::from(CONFIG_FILE_NAME)),
        ("Config directory", Path::new("config").join(CONFIG_FILE_NAME)),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Some(path.clone());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{CONFIG_FILE_NAME}"));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Some(home_config);
        }
    }

    None
}

pub fn load_config_from(path: &Path) -> Result<BridgeConfig> {
    let config_content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;

    let config: BridgeConfig = serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON or missing required fields")?;
    config.validate()?;

    Ok(config)
}

/// Loads the first config file found, or the built-in defaults if there is none.
pub fn load_config() -> Result<BridgeConfig> {
    match find_config_file() {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            load_config_from(&path)
        }
        None => {
            info!("No {} found, using built-in defaults", CONFIG_FILE_NAME);
            Ok(BridgeConfig::default())
        }
    }
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&BridgeConfig::default())
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .with_context(|| format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
