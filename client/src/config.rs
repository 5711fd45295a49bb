//! Configuration file parser for Tunnelsnake
//!
//! Supports tunnelsnake.yml holding the device endpoint so it does not
//! have to be typed at every start. Command line flags take precedence.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tunnelsnake_shared::Mode;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelsnakeConfig {
    /// Transport mode: udp, tcp or serial
    #[serde(default)]
    pub mode: Mode,

    /// Guardian device IP or hostname
    pub address: Option<String>,

    /// Guardian device port
    pub port: Option<u16>,

    /// Local port to listen on (default: same as the device port)
    pub bind_port: Option<u16>,
}

impl TunnelsnakeConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: TunnelsnakeConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(address) = &self.address {
            if address.trim().is_empty() {
                anyhow::bail!("Device address cannot be empty");
            }
        }
        if self.port == Some(0) {
            anyhow::bail!("Invalid device port 0");
        }
        Ok(())
    }

    /// Overlay values given on the command line
    pub fn merge(
        mut self,
        mode: Option<Mode>,
        address: Option<String>,
        port: Option<u16>,
        bind_port: Option<u16>,
    ) -> Self {
        if let Some(mode) = mode {
            self.mode = mode;
        }
        if address.is_some() {
            self.address = address;
        }
        if port.is_some() {
            self.port = port;
        }
        if bind_port.is_some() {
            self.bind_port = bind_port;
        }
        self
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = [
            "tunnelsnake.yml",
            "tunnelsnake.yaml",
            ".tunnelsnake.yml",
            ".tunnelsnake.yaml",
        ];

        // Check current directory
        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}
