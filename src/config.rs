use anyhow::Result;
use serde::{Deserialize, Serialize};
use skirmish_server::HostSettings;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config/skirmish.toml";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HostConfig {
    /// Address remote players connect to.
    pub listen: SocketAddr,
    /// Accept remote players at all.
    pub network: bool,
    #[serde(flatten)]
    pub host: HostSettings,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 7878)),
            network: true,
            host: HostSettings::default(),
        }
    }
}

impl HostConfig {
    /// Load configuration from an explicit path, falling back to defaults on errors.
    pub fn load_from_path(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<HostConfig>(&contents) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!("Failed to parse {}: {err}. Using defaults", path.display());
                    HostConfig::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!("Host config not found at {}. Using defaults", path.display());
                HostConfig::default()
            }
            Err(err) => {
                warn!("Failed to read {}: {err}. Using defaults", path.display());
                HostConfig::default()
            }
        }
    }

    /// Write the configuration as TOML, creating parent directories.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let toml = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml)?;
        Ok(())
    }
}
